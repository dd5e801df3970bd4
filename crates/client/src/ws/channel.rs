//! Named logical channels multiplexed over one [`Socket`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use robe_shared::{events, Envelope, NotConnected, ProtocolError};
use serde_json::Value;
use thiserror::Error;

use super::connection::{SendError, Socket};

type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel `{0}` is already open")]
    AlreadyOpen(String),
    #[error("channel `{0}` is closed")]
    Closed(String),
    #[error(transparent)]
    NotConnected(#[from] NotConnected),
    #[error("could not encode frame: {0}")]
    Encode(ProtocolError),
}

impl From<SendError> for ChannelError {
    fn from(error: SendError) -> Self {
        match error {
            SendError::NotConnected(e) => ChannelError::NotConnected(e),
            SendError::Encode(e) => ChannelError::Encode(e),
        }
    }
}

struct ChannelInner {
    name: String,
    open: AtomicBool,
    socket: Socket,
    handlers: RwLock<HashMap<String, Vec<EventCallback>>>,
}

/// Handle to one open channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Channel {
    fn new(name: &str, socket: Socket) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                open: AtomicBool::new(true),
                socket,
                handlers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Add a handler for `event`. Handlers run in registration order.
    pub fn on(&self, event: &str, callback: impl Fn(&Value) + Send + Sync + 'static) {
        self.inner
            .handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Wrap `content` in an envelope for this channel and send it.
    pub fn send(&self, event: &str, content: Value) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.inner.name.clone()));
        }
        self.inner
            .socket
            .send(&Envelope::new(self.inner.name.as_str(), event, content))?;
        Ok(())
    }

    fn dispatch(&self, event: &str, content: &Value) {
        let handlers = self.inner.handlers.read().get(event).cloned();
        match handlers {
            Some(handlers) => {
                for handler in handlers {
                    handler(content);
                }
            }
            None if event == events::SUBSCRIBED || event == events::UNSUBSCRIBED => {}
            None => tracing::debug!(channel = %self.inner.name, %event, "No handler for event"),
        }
    }
}

struct ChannelsInner {
    socket: Socket,
    channels: RwLock<HashMap<String, Channel>>,
}

/// The set of channels open on one socket.
///
/// Open channels survive a reconnect: every one of them is subscribed again
/// when the socket reopens.
#[derive(Clone)]
pub struct Channels {
    inner: Arc<ChannelsInner>,
}

impl Channels {
    pub fn new(socket: &Socket) -> Self {
        let inner = Arc::new(ChannelsInner {
            socket: socket.clone(),
            channels: RwLock::new(HashMap::new()),
        });

        let weak: Weak<ChannelsInner> = Arc::downgrade(&inner);
        socket.on_open(move || {
            if let Some(inner) = weak.upgrade() {
                inner.resubscribe();
            }
        });

        let weak: Weak<ChannelsInner> = Arc::downgrade(&inner);
        socket.on_message(move |text| {
            if let Some(inner) = weak.upgrade() {
                inner.route(text);
            }
        });

        Self { inner }
    }

    pub fn socket(&self) -> &Socket {
        &self.inner.socket
    }

    /// Open `name` and subscribe to it on the server.
    pub fn open_channel(&self, name: &str) -> Result<Channel, ChannelError> {
        let channel = {
            let mut channels = self.inner.channels.write();
            if channels.contains_key(name) {
                return Err(ChannelError::AlreadyOpen(name.to_string()));
            }
            let channel = Channel::new(name, self.inner.socket.clone());
            channels.insert(name.to_string(), channel.clone());
            channel
        };

        if self.inner.socket.send(&Envelope::subscribe(name)).is_err() {
            tracing::debug!(channel = %name, "Not connected, subscribing on open");
        }
        Ok(channel)
    }

    /// Unsubscribe and forget `name`. No-op when it is not open.
    pub fn close_channel(&self, name: &str) {
        let Some(channel) = self.inner.channels.write().remove(name) else {
            return;
        };
        channel.inner.open.store(false, Ordering::SeqCst);
        if self.inner.socket.send(&Envelope::unsubscribe(name)).is_err() {
            tracing::debug!(channel = %name, "Not connected, dropping unsubscribe");
        }
    }

    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.inner.channels.read().get(name).cloned()
    }

    pub fn open_channels(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.channels.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl ChannelsInner {
    fn resubscribe(&self) {
        let names: Vec<String> = self.channels.read().keys().cloned().collect();
        for name in names {
            tracing::debug!(channel = %name, "Resubscribing");
            if let Err(e) = self.socket.send(&Envelope::subscribe(&name)) {
                tracing::warn!(channel = %name, "Resubscribe failed: {}", e);
            }
        }
    }

    /// Demux one inbound frame to its channel.
    fn route(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping frame: {}", e);
                return;
            }
        };

        let channel = self.channels.read().get(&envelope.channel).cloned();
        match channel {
            Some(channel) => channel.dispatch(&envelope.event, &envelope.content),
            None if envelope.is_control() => {
                tracing::debug!(channel = %envelope.channel, event = %envelope.event, "Control frame for closed channel");
            }
            None => {
                let e = ProtocolError::UnknownChannel(envelope.channel);
                tracing::warn!(event = %envelope.event, "Dropping frame: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::connection::ReconnectConfig;
    use parking_lot::Mutex;
    use serde_json::json;

    fn channels() -> Channels {
        Channels::new(&Socket::new("ws://127.0.0.1:9/socket", ReconnectConfig::default()))
    }

    #[test]
    fn test_open_twice_fails() {
        let channels = channels();
        let chat = channels.open_channel("chat").unwrap();
        assert!(chat.is_open());
        assert_eq!(
            channels.open_channel("chat").unwrap_err(),
            ChannelError::AlreadyOpen("chat".into())
        );
    }

    #[test]
    fn test_close_forgets_channel_and_is_idempotent() {
        let channels = channels();
        let chat = channels.open_channel("chat").unwrap();
        channels.close_channel("chat");
        channels.close_channel("chat");
        channels.close_channel("never-opened");

        assert!(!chat.is_open());
        assert!(channels.channel("chat").is_none());
        assert_eq!(
            chat.send("say", json!("hi")),
            Err(ChannelError::Closed("chat".into()))
        );
        // Reopening after close is allowed.
        assert!(channels.open_channel("chat").is_ok());
    }

    #[test]
    fn test_send_while_disconnected_reports_not_connected() {
        let channels = channels();
        let chat = channels.open_channel("chat").unwrap();
        assert_eq!(
            chat.send("say", json!("hi")),
            Err(ChannelError::NotConnected(NotConnected))
        );
    }

    #[test]
    fn test_route_dispatches_by_channel_then_event_in_order() {
        let channels = channels();
        let chat = channels.open_channel("chat").unwrap();
        let news = channels.open_channel("news").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        chat.on("say", move |v| log.lock().push(format!("first {}", v)));
        let log = Arc::clone(&seen);
        chat.on("say", move |v| log.lock().push(format!("second {}", v)));
        let log = Arc::clone(&seen);
        news.on("say", move |v| log.lock().push(format!("news {}", v)));

        channels
            .inner
            .route(r#"{"channel":"chat","event":"say","content":1}"#);
        channels.inner.route("not json");
        channels
            .inner
            .route(r#"{"channel":"elsewhere","event":"say","content":2}"#);

        assert_eq!(*seen.lock(), vec!["first 1", "second 1"]);
    }

    #[test]
    fn test_open_channels_are_listed() {
        let channels = channels();
        channels.open_channel("b").unwrap();
        channels.open_channel("a").unwrap();
        assert_eq!(channels.open_channels(), vec!["a", "b"]);
    }

    #[test]
    fn test_encode_failure_is_not_a_connectivity_error() {
        let error = ChannelError::from(SendError::Encode(ProtocolError::Malformed("bad".into())));
        assert_eq!(error, ChannelError::Encode(ProtocolError::Malformed("bad".into())));
        assert_eq!(
            ChannelError::from(SendError::NotConnected(NotConnected)),
            ChannelError::NotConnected(NotConnected)
        );
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_open_channels() {
        use futures_util::StreamExt;
        use std::time::Duration;
        use tokio::net::TcpListener;
        use tokio::sync::mpsc;
        use tokio_tungstenite::{accept_async, tungstenite::Message};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Envelope>();

        // Drop the first connection, then report what the second one sends.
        let _server = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(accept_async(first).await.unwrap());

            let (second, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(second).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    if let Ok(envelope) = Envelope::parse(text.as_str()) {
                        let _ = frames_tx.send(envelope);
                    }
                }
            }
        });

        let config = ReconnectConfig {
            reconnect_interval: Duration::from_millis(10),
            max_reconnect_interval: Duration::from_millis(20),
            max_reconnect_attempts: 0,
            ..ReconnectConfig::default()
        };
        let socket = Socket::new(format!("ws://{}/socket", addr), config);
        let channels = Channels::new(&socket);
        channels.open_channel("chat").unwrap();
        channels.open_channel("news").unwrap();
        socket.start();

        let mut subscribed = Vec::new();
        while subscribed.len() < 2 {
            let envelope = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(envelope.event, events::SUBSCRIBE);
            subscribed.push(envelope.channel);
        }
        subscribed.sort();
        assert_eq!(subscribed, vec!["chat", "news"]);
        socket.close();
    }
}
