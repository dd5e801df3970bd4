//! Live socket connections, keyed by client id.
//!
//! Task workers finish concurrently and deliver responses through this map,
//! so every access goes through a lock and senders never block.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use robe_shared::Envelope;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, UnboundedSender<Envelope>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: Uuid, sender: UnboundedSender<Envelope>) {
        self.inner.write().insert(client_id, sender);
    }

    pub fn unregister(&self, client_id: &Uuid) {
        self.inner.write().remove(client_id);
    }

    /// Queue `envelope` for one client. Returns false if it is gone.
    pub fn send_to(&self, client_id: &Uuid, envelope: Envelope) -> bool {
        match self.inner.read().get(client_id) {
            Some(sender) => sender.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
