//! Client half of the task protocol.
//!
//! [`TaskClient::perform`] sends a request on the `tasks` channel and hands
//! back a [`Promise`] that settles when the response carrying the same id
//! arrives. Ids come from a per-client counter and are never reused, so a
//! late response can only ever reach the request that caused it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use robe_shared::{events, Promise, TaskError, TaskRequest, TaskResponse, UserSignature, TASKS_CHANNEL};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::ws::{Channel, ChannelError, Channels};

/// Identity sent along with auth-required tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub signature: String,
}

/// Resend schedule for requests made while the socket is down.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total send attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    /// `base_delay * attempt^1.5`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.mul_f64(f64::from(attempt).powf(1.5))
    }
}

struct TaskClientInner {
    channel: Channel,
    retry: RetryConfig,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Promise<Value, TaskError>>>,
    credentials: RwLock<Option<Credentials>>,
}

#[derive(Clone)]
pub struct TaskClient {
    inner: Arc<TaskClientInner>,
}

impl TaskClient {
    /// Open the `tasks` channel on `channels` and start listening for responses.
    pub fn new(channels: &Channels, retry: RetryConfig) -> Result<Self, ChannelError> {
        let channel = channels.open_channel(TASKS_CHANNEL)?;
        let inner = Arc::new(TaskClientInner {
            channel: channel.clone(),
            retry,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            credentials: RwLock::new(None),
        });

        let weak: Weak<TaskClientInner> = Arc::downgrade(&inner);
        channel.on(events::RESPONSE, move |content| {
            if let Some(inner) = weak.upgrade() {
                inner.on_response(content);
            }
        });

        Ok(Self { inner })
    }

    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.set_credentials(Some(credentials));
        self
    }

    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.inner.credentials.write() = credentials;
    }

    /// Requests still waiting for a response.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Run `task` on the server with `args`, which must serialize to an
    /// object (or unit, for no arguments).
    ///
    /// With `auth` set the configured credentials are attached; without
    /// credentials the request goes out unsigned and the server decides.
    pub fn perform<A: Serialize + ?Sized>(
        &self,
        task: &str,
        args: &A,
        auth: bool,
    ) -> Promise<Value, TaskError> {
        let args = match serde_json::to_value(args) {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => Map::new(),
            Ok(other) => {
                return Promise::rejected(TaskError::InvalidArguments {
                    message: format!("arguments must be an object, got {}", other),
                })
            }
            Err(e) => {
                return Promise::rejected(TaskError::InvalidArguments {
                    message: e.to_string(),
                })
            }
        };

        let user = if auth {
            let credentials = self.inner.credentials.read().clone();
            if credentials.is_none() {
                tracing::debug!(%task, "No credentials configured, sending unsigned");
            }
            credentials.map(|c| UserSignature {
                id: c.user_id,
                signature: c.signature,
            })
        } else {
            None
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let request = TaskRequest {
            task: task.to_string(),
            args,
            id,
            user,
        };
        let content = match serde_json::to_value(&request) {
            Ok(content) => content,
            Err(e) => return Promise::rejected(TaskError::failed(e.to_string())),
        };

        let promise = Promise::new();
        self.inner.pending.lock().insert(id, promise.clone());
        tracing::debug!(%task, id, "Performing task");

        match self.inner.channel.send(events::REQUEST, content.clone()) {
            Ok(()) => {}
            Err(ChannelError::NotConnected(_)) => self.retry_later(id, content),
            Err(e) => {
                self.inner.settle(id, Err(TaskError::failed(e.to_string())));
            }
        }
        promise
    }

    /// Keep resending request `id` until it goes out or the budget runs dry.
    fn retry_later(&self, id: u64, content: Value) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(id, "No runtime to retry on, abandoning request");
            self.inner
                .settle(id, Err(TaskError::TransportUnavailable { attempts: 1 }));
            return;
        };

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            let max_attempts = inner.retry.max_attempts.max(1);
            for attempt in 1..max_attempts {
                tokio::time::sleep(inner.retry.delay_for_attempt(attempt)).await;
                if !inner.pending.lock().contains_key(&id) {
                    return;
                }
                match inner.channel.send(events::REQUEST, content.clone()) {
                    Ok(()) => {
                        tracing::debug!(id, attempt, "Request sent after retry");
                        return;
                    }
                    Err(ChannelError::NotConnected(_)) => continue,
                    Err(e) => {
                        inner.settle(id, Err(TaskError::failed(e.to_string())));
                        return;
                    }
                }
            }
            tracing::warn!(id, attempts = max_attempts, "Giving up on request");
            inner.settle(
                id,
                Err(TaskError::TransportUnavailable {
                    attempts: max_attempts,
                }),
            );
        });
    }
}

impl TaskClientInner {
    fn on_response(&self, content: &Value) {
        let response: TaskResponse = match serde_json::from_value(content.clone()) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Dropping malformed task response: {}", e);
                return;
            }
        };

        let outcome = if response.is_error() {
            Err(TaskError::from_wire(response.error))
        } else {
            Ok(response.result)
        };
        if !self.settle(response.id, outcome) {
            tracing::warn!(task = %response.task, id = response.id, "Dropping response for unknown request");
        }
    }

    /// Remove entry `id` and realize its promise. False when there was none.
    fn settle(&self, id: u64, outcome: Result<Value, TaskError>) -> bool {
        let Some(promise) = self.pending.lock().remove(&id) else {
            return false;
        };
        if let Err(e) = promise.settle(outcome) {
            tracing::error!(id, "Task promise settled elsewhere: {}", e);
        }
        true
    }
}
