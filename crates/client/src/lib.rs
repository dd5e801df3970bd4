//! robe client: reconnecting socket, channel multiplexing, remote tasks and
//! the state containers application code keeps their results in.

pub mod client;
pub mod config;
pub mod state;
pub mod tasks;
pub mod ws;

pub use client::RobeClient;
pub use config::ClientConfig;
pub use tasks::{Credentials, RetryConfig, TaskClient};
pub use ws::{Channel, ChannelError, Channels, ConnectionState, ReconnectConfig, Socket};
