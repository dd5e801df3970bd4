//! Server side of the task protocol: a registry of named handlers and the
//! dispatcher that runs them on the worker pool under a deadline.

mod dispatch;
mod registry;

pub mod builtin;

pub use dispatch::Dispatcher;
pub use registry::{IntoTaskOutput, Registration, TaskContext, TaskOutput, TaskRegistry};
