//! Named task handlers.
//!
//! Handlers are typed closures `Fn(TaskContext) -> O` where `O` is either an
//! immediate `Result` or a [`Promise`] (see [`IntoTaskOutput`]). The typed
//! closure is erased once, at registration, into a handler producing JSON
//! values for the response.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use parking_lot::RwLock;
use robe_shared::{Promise, TaskError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Everything a handler gets to see about the request it serves.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: String,
    pub args: Map<String, Value>,
    /// Verified user id, present when the request carried a valid signature.
    pub user_id: Option<String>,
    pub client_id: Uuid,
}

impl TaskContext {
    /// Deserialize the argument `name`.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Result<T, TaskError> {
        let raw = self.args.get(name).cloned().unwrap_or(Value::Null);
        serde_json::from_value(raw).map_err(|e| TaskError::InvalidArguments {
            message: format!("`{}`: {}", name, e),
        })
    }

    /// Deserialize the whole argument object.
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_value(Value::Object(self.args.clone())).map_err(|e| {
            TaskError::InvalidArguments {
                message: e.to_string(),
            }
        })
    }
}

/// What a handler hands back: a finished result or a promise of one.
pub enum TaskOutput<R, E> {
    Ready(Result<R, E>),
    Deferred(Promise<R, E>),
}

/// Handler return types: `Result<R, E>` or `Promise<R, E>`.
pub trait IntoTaskOutput {
    type Value;
    type Error;

    fn into_output(self) -> TaskOutput<Self::Value, Self::Error>;
}

impl<R, E> IntoTaskOutput for Result<R, E> {
    type Value = R;
    type Error = E;

    fn into_output(self) -> TaskOutput<R, E> {
        TaskOutput::Ready(self)
    }
}

impl<R, E> IntoTaskOutput for Promise<R, E> {
    type Value = R;
    type Error = E;

    fn into_output(self) -> TaskOutput<R, E> {
        TaskOutput::Deferred(self)
    }
}

impl<R, E> IntoTaskOutput for TaskOutput<R, E> {
    type Value = R;
    type Error = E;

    fn into_output(self) -> TaskOutput<R, E> {
        self
    }
}

/// Handler output after erasure. Errors are already in wire form.
pub(crate) enum ErasedOutput {
    Ready(Result<Value, Value>),
    Deferred(Promise<Value, Value>),
}

pub(crate) type ErasedHandler = Arc<dyn Fn(TaskContext) -> ErasedOutput + Send + Sync>;

pub struct Registration {
    pub name: String,
    pub auth_required: bool,
    pub(crate) handler: ErasedHandler,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("auth_required", &self.auth_required)
            .finish()
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<Registration>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any earlier registration.
    pub fn register<F, O>(&self, name: &str, auth_required: bool, handler: F)
    where
        F: Fn(TaskContext) -> O + Send + Sync + 'static,
        O: IntoTaskOutput,
        O::Value: Serialize + Clone + Send + 'static,
        O::Error: Serialize + Display + Clone + Send + 'static,
    {
        let task = name.to_string();
        let erased: ErasedHandler = Arc::new(move |ctx| match handler(ctx).into_output() {
            TaskOutput::Ready(result) => ErasedOutput::Ready(erase(&task, result)),
            TaskOutput::Deferred(promise) => {
                let out = Promise::new();
                let target = out.clone();
                let task = task.clone();
                let chained = promise.always(move |outcome| {
                    let _ = target.settle(erase(&task, outcome));
                });
                match chained {
                    Ok(_) => ErasedOutput::Deferred(out),
                    Err(e) => ErasedOutput::Ready(Err(TaskError::failed(format!(
                        "handler returned an unusable promise: {}",
                        e
                    ))
                    .to_wire())),
                }
            }
        });

        let registration = Arc::new(Registration {
            name: name.to_string(),
            auth_required,
            handler: erased,
        });
        if self
            .tasks
            .write()
            .insert(name.to_string(), registration)
            .is_some()
        {
            tracing::debug!(task = %name, "Task handler replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Registration>> {
        self.tasks.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tasks.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Convert a typed handler outcome into wire values.
///
/// An error that cannot be serialized is downgraded to its display string.
fn erase<R, E>(task: &str, outcome: Result<R, E>) -> Result<Value, Value>
where
    R: Serialize,
    E: Serialize + Display,
{
    match outcome {
        Ok(value) => serde_json::to_value(&value).map_err(|e| {
            tracing::error!(task = %task, "Task result is not serializable: {}", e);
            TaskError::failed(format!("result is not serializable: {}", e)).to_wire()
        }),
        Err(error) => match serde_json::to_value(&error) {
            Ok(value) => Err(TaskError::from_wire(value).to_wire()),
            Err(e) => {
                tracing::warn!(task = %task, "Task error is not serializable ({}), sending its message", e);
                Err(TaskError::failed(error.to_string()).to_wire())
            }
        },
    }
}
