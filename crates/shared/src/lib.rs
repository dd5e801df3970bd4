//! Types shared by the robe server and client: the channel-multiplexed wire
//! protocol, promises, task errors and user signatures.

pub mod auth;
pub mod error;
pub mod promise;
pub mod protocol;

pub use auth::{Auth, SignatureAuth};
pub use error::{NotConnected, PromiseError, ProtocolError, TaskError};
pub use promise::Promise;
pub use protocol::*;
