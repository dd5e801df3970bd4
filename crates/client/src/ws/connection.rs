//! Reconnecting WebSocket transport.
//!
//! A [`Socket`] keeps one connection to the server alive in a background
//! tokio task. Lost connections are retried with exponential backoff until
//! [`ReconnectConfig::max_reconnect_attempts`] consecutive failures, after
//! which the give-up listeners fire and the socket stays down. The socket
//! never buffers: [`Socket::send`] fails with [`SendError::NotConnected`]
//! while the connection is down and the caller decides what to do about it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use robe_shared::{Envelope, NotConnected, ProtocolError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Listener = Arc<dyn Fn() + Send + Sync>;
type TextListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Why [`Socket::send`] did not hand a frame to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error(transparent)]
    NotConnected(#[from] NotConnected),
    #[error("could not encode frame: {0}")]
    Encode(#[from] ProtocolError),
}

/// Connection state for a [`Socket`]
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
    /// Closed locally, no reconnect will be attempted.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt
    pub reconnect_interval: Duration,
    /// Multiplier applied per attempt
    pub reconnect_decay: f64,
    /// Upper bound for any single delay
    pub max_reconnect_interval: Duration,
    /// Consecutive failures before giving up (0 = infinite)
    pub max_reconnect_attempts: u32,
    /// How long a connection attempt may take before it is abandoned
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(1000),
            reconnect_decay: 1.5,
            max_reconnect_interval: Duration::from_millis(30_000),
            max_reconnect_attempts: 10,
            connect_timeout: Duration::from_millis(2000),
        }
    }
}

impl ReconnectConfig {
    /// `reconnect_interval * reconnect_decay^attempt`, capped at `max_reconnect_interval`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.reconnect_interval.as_secs_f64() * self.reconnect_decay.powi(exponent);
        let capped = secs.min(self.max_reconnect_interval.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

/// Attempt counter for consecutive reconnect failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next try, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let max = self.config.max_reconnect_attempts;
        if max > 0 && self.attempt >= max {
            return None;
        }
        let delay = self.config.delay_for_attempt(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Called after a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Default)]
struct Listeners {
    open: Vec<Listener>,
    close: Vec<Listener>,
    error: Vec<TextListener>,
    message: Vec<TextListener>,
    give_up: Vec<TextListener>,
}

struct SocketInner {
    url: String,
    config: ReconnectConfig,
    state: RwLock<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    listeners: RwLock<Listeners>,
    started: AtomicBool,
    closing: AtomicBool,
    shutdown: Notify,
}

/// Handle to a managed connection. Clones share the same connection.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("url", &self.inner.url)
            .field("state", &*self.inner.state.read())
            .finish()
    }
}

impl Socket {
    /// Create a socket for `url`. Nothing happens until [`start`](Self::start).
    pub fn new(url: impl Into<String>, config: ReconnectConfig) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                url: url.into(),
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                listeners: RwLock::new(Listeners::default()),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Spawn the connection loop. Calling it again is a no-op.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(run(Arc::clone(&self.inner)));
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.read().is_connected()
    }

    pub fn on_open(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.inner.listeners.write().open.push(Arc::new(listener));
    }

    pub fn on_close(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.inner.listeners.write().close.push(Arc::new(listener));
    }

    pub fn on_error(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.listeners.write().error.push(Arc::new(listener));
    }

    /// Raw text frames, before any parsing.
    pub fn on_message(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.listeners.write().message.push(Arc::new(listener));
    }

    /// Fired once when the reconnect budget is exhausted.
    pub fn on_give_up(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.listeners.write().give_up.push(Arc::new(listener));
    }

    /// Serialize and transmit `envelope` if the connection is up.
    pub fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        let json = envelope.to_json().map_err(|e| {
            tracing::error!(channel = %envelope.channel, "Failed to encode frame: {}", e);
            e
        })?;
        if !self.is_connected() {
            return Err(NotConnected.into());
        }
        match self.inner.outbound.lock().as_ref() {
            Some(tx) => tx.send(json).map_err(|_| NotConnected.into()),
            None => Err(NotConnected.into()),
        }
    }

    /// Disconnect and stop reconnecting.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(url = %self.inner.url, "Closing socket");
        self.inner.shutdown.notify_one();
        if !self.inner.started.load(Ordering::SeqCst) {
            *self.inner.state.write() = ConnectionState::Closed;
        }
    }
}

impl SocketInner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn emit_open(&self) {
        let listeners = self.listeners.read().open.clone();
        for listener in listeners {
            listener();
        }
    }

    fn emit_close(&self) {
        let listeners = self.listeners.read().close.clone();
        for listener in listeners {
            listener();
        }
    }

    fn emit_error(&self, error: &str) {
        let listeners = self.listeners.read().error.clone();
        for listener in listeners {
            listener(error);
        }
    }

    fn emit_message(&self, text: &str) {
        let listeners = self.listeners.read().message.clone();
        for listener in listeners {
            listener(text);
        }
    }

    fn emit_give_up(&self, reason: &str) {
        let listeners = self.listeners.read().give_up.clone();
        for listener in listeners {
            listener(reason);
        }
    }
}

/// Connection management loop
async fn run(inner: Arc<SocketInner>) {
    let mut backoff = Backoff::new(inner.config.clone());

    loop {
        if inner.is_closing() {
            break;
        }

        let attempt = backoff.attempt();
        if attempt == 0 {
            inner.set_state(ConnectionState::Connecting);
        } else {
            inner.set_state(ConnectionState::Reconnecting { attempt });
        }

        let connect = tokio::time::timeout(
            inner.config.connect_timeout,
            connect_async(inner.url.as_str()),
        );
        let outcome = tokio::select! {
            outcome = connect => outcome,
            _ = inner.shutdown.notified() => break,
        };

        match outcome {
            Ok(Ok((stream, _response))) => {
                backoff.reset();
                let (tx, rx) = mpsc::unbounded_channel();
                *inner.outbound.lock() = Some(tx);
                inner.set_state(ConnectionState::Connected);
                tracing::info!(url = %inner.url, "Socket connected");
                inner.emit_open();

                let reason = pump(&inner, stream, rx).await;
                inner.outbound.lock().take();
                tracing::info!(url = %inner.url, "Socket disconnected: {}", reason);
            }
            Ok(Err(e)) => {
                tracing::warn!(url = %inner.url, attempt, "Connect failed: {}", e);
                inner.emit_error(&e.to_string());
            }
            Err(_) => {
                let message = format!(
                    "connect timed out after {}ms",
                    inner.config.connect_timeout.as_millis()
                );
                tracing::warn!(url = %inner.url, attempt, "{}", message);
                inner.emit_error(&message);
            }
        }

        inner.set_state(ConnectionState::Disconnected);
        inner.emit_close();

        if inner.is_closing() {
            break;
        }

        match backoff.next_delay() {
            Some(delay) => {
                tracing::debug!(
                    url = %inner.url,
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.shutdown.notified() => break,
                }
            }
            None => {
                let reason = format!(
                    "gave up after {} reconnect attempts",
                    inner.config.max_reconnect_attempts
                );
                tracing::error!(url = %inner.url, "{}", reason);
                inner.set_state(ConnectionState::Failed {
                    reason: reason.clone(),
                });
                inner.emit_give_up(&reason);
                return;
            }
        }
    }

    inner.outbound.lock().take();
    inner.set_state(ConnectionState::Closed);
}

/// Shuttle frames both ways until the connection drops. Returns why it did.
async fn pump(
    inner: &SocketInner,
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
) -> String {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => inner.emit_message(text.as_str()),
                Some(Ok(Message::Close(_))) => return "closed by peer".into(),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    inner.emit_error(&e.to_string());
                    return e.to_string();
                }
                None => return "stream ended".into(),
            },
            Some(json) = outbound.recv() => {
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    inner.emit_error(&e.to_string());
                    return e.to_string();
                }
            }
            _ = inner.shutdown.notified() => {
                let _ = write.send(Message::Close(None)).await;
                return "closed locally".into();
            }
        }
    }
}
