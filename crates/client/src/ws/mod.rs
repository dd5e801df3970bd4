//! WebSocket layer for talking to a robe server.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   perform()   ┌───────────────────────────┐
//! │  TaskClient  │──────────────▶│ Channel "tasks"           │
//! └──────────────┘               └───────────────────────────┘
//!                                          │ {channel, event, content}
//!                                          ▼
//!                                ┌───────────────────────────┐
//!                                │ Channels (demux by name)  │
//!                                └───────────────────────────┘
//!                                          │
//!                                          ▼
//!                                ┌───────────────────────────┐
//!                                │ Socket (reconnect loop)   │
//!                                └───────────────────────────┘
//! ```

pub mod channel;
pub mod connection;

pub use channel::{Channel, ChannelError, Channels};
pub use connection::{Backoff, ConnectionState, ReconnectConfig, SendError, Socket};
