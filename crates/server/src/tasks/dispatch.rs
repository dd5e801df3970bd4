//! Turns task requests into task responses.
//!
//! Every failure mode (unknown task, bad signature, saturated pool, handler
//! error or panic, deadline) ends up as a rejected [`TaskResponse`] carrying
//! the client's own correlation id. Nothing here can take a worker down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use robe_shared::{Auth, TaskError, TaskRequest, TaskResponse};
use serde_json::Value;
use uuid::Uuid;

use super::registry::{ErasedOutput, TaskContext, TaskRegistry};
use crate::pool::WorkerPool;

pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    pool: Arc<WorkerPool>,
    auth: Arc<dyn Auth>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        pool: Arc<WorkerPool>,
        auth: Arc<dyn Auth>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            pool,
            auth,
            timeout,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub async fn dispatch(&self, request: TaskRequest, client_id: Uuid) -> TaskResponse {
        let task = request.task.clone();
        let id = request.id;
        match self.run(request, client_id).await {
            Ok(result) => TaskResponse::resolved(task, id, result),
            Err(error) => TaskResponse::rejected(task, id, error),
        }
    }

    async fn run(&self, request: TaskRequest, client_id: Uuid) -> Result<Value, Value> {
        let Some(registration) = self.registry.get(&request.task) else {
            tracing::warn!(task = %request.task, id = request.id, "Unknown task requested");
            return Err(TaskError::UnknownTask { task: request.task }.to_wire());
        };

        let verified = request
            .user
            .as_ref()
            .filter(|user| self.auth.valid_signature(&user.id, &user.signature))
            .map(|user| user.id.clone());

        if registration.auth_required && verified.is_none() {
            let reason = if request.user.is_some() {
                "invalid user signature"
            } else {
                "missing user signature"
            };
            tracing::warn!(task = %request.task, id = request.id, "Rejected task: {}", reason);
            return Err(TaskError::unauthorized(reason).to_wire());
        }

        let ctx = TaskContext {
            task: request.task.clone(),
            args: request.args,
            user_id: verified,
            client_id,
        };
        let handler = Arc::clone(&registration.handler);
        let started = Instant::now();
        let job = self
            .pool
            .submit(move || handler(ctx))
            .map_err(|e| {
                tracing::warn!(task = %request.task, "Task rejected: {}", e);
                e.to_wire()
            })?;

        let work = async move {
            let output = match job.await {
                Ok(Ok(output)) => output,
                Ok(Err(panic)) => {
                    return Err(TaskError::failed(format!("task panicked: {}", panic)).to_wire())
                }
                Err(_) => return Err(TaskError::failed("worker dropped the task").to_wire()),
            };
            match output {
                ErasedOutput::Ready(result) => result,
                ErasedOutput::Deferred(promise) => promise.await,
            }
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match &result {
                    Ok(_) => tracing::debug!(task = %request.task, id = request.id, elapsed_ms, "Task resolved"),
                    Err(error) => tracing::info!(task = %request.task, id = request.id, elapsed_ms, %error, "Task rejected"),
                }
                result
            }
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                tracing::warn!(
                    task = %request.task,
                    id = request.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    timeout_ms,
                    "Task timed out"
                );
                Err(TaskError::Timeout {
                    task: request.task,
                    timeout_ms,
                }
                .to_wire())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use robe_shared::{Promise, SignatureAuth, UserSignature};
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher(registry: TaskRegistry, timeout: Duration) -> (Dispatcher, Arc<SignatureAuth>) {
        let auth = Arc::new(SignatureAuth::from_seed([3u8; 32]));
        let pool = Arc::new(WorkerPool::new(PoolConfig::default()));
        let d = Dispatcher::new(Arc::new(registry), pool, auth.clone(), timeout);
        (d, auth)
    }

    fn request(task: &str, id: u64, args: Value) -> TaskRequest {
        TaskRequest {
            task: task.into(),
            args: args.as_object().cloned().unwrap_or_else(Map::new),
            id,
            user: None,
        }
    }

    fn error_of(response: &TaskResponse) -> TaskError {
        assert!(response.is_error(), "expected rejection, got {:?}", response);
        TaskError::from_wire(response.error.clone())
    }

    #[tokio::test]
    async fn test_resolves_with_handler_result() {
        let registry = TaskRegistry::new();
        registry.register("double", false, |c: TaskContext| {
            c.arg::<i64>("x").map(|x| x * 2)
        });
        let (d, _) = dispatcher(registry, Duration::from_secs(5));

        let response = d.dispatch(request("double", 9, json!({"x": 1})), Uuid::new_v4()).await;
        assert_eq!(response.id, 9);
        assert_eq!(response.result, json!(2));
        assert!(!response.is_error());
    }

    #[tokio::test]
    async fn test_unknown_task_is_rejected() {
        let (d, _) = dispatcher(TaskRegistry::new(), Duration::from_secs(5));
        let response = d.dispatch(request("nope", 1, json!({})), Uuid::new_v4()).await;
        assert_eq!(
            error_of(&response),
            TaskError::UnknownTask { task: "nope".into() }
        );
    }

    #[tokio::test]
    async fn test_auth_required_task_checks_signature() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let registry = TaskRegistry::new();
        registry.register("secret", true, move |c: TaskContext| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TaskError>(c.user_id.unwrap_or_default())
        });
        let (d, auth) = dispatcher(registry, Duration::from_secs(5));

        let missing = d.dispatch(request("secret", 1, json!({})), Uuid::new_v4()).await;
        assert!(matches!(error_of(&missing), TaskError::Unauthorized { .. }));

        let mut tampered = request("secret", 2, json!({}));
        tampered.user = Some(UserSignature {
            id: "alice".into(),
            signature: auth.signature_for("mallory"),
        });
        let rejected = d.dispatch(tampered, Uuid::new_v4()).await;
        assert!(error_of(&rejected).to_string().contains("unauthorized"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut signed = request("secret", 3, json!({}));
        signed.user = Some(UserSignature {
            id: "alice".into(),
            signature: auth.signature_for("alice"),
        });
        let accepted = d.dispatch(signed, Uuid::new_v4()).await;
        assert_eq!(accepted.result, json!("alice"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_rejection() {
        let registry = TaskRegistry::new();
        registry.register("explode", false, |_| -> Result<i64, String> {
            panic!("kaboom")
        });
        let (d, _) = dispatcher(registry, Duration::from_secs(5));

        let response = d.dispatch(request("explode", 1, json!({})), Uuid::new_v4()).await;
        assert!(error_of(&response).to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_slow_task_times_out() {
        let registry = TaskRegistry::new();
        registry.register("slow", false, |_| {
            std::thread::sleep(Duration::from_millis(500));
            Ok::<_, TaskError>(1)
        });
        let (d, _) = dispatcher(registry, Duration::from_millis(50));

        let started = Instant::now();
        let response = d.dispatch(request("slow", 4, json!({})), Uuid::new_v4()).await;
        assert!(error_of(&response).is_timeout());
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_deferred_result_is_awaited() {
        let registry = TaskRegistry::new();
        registry.register("later", false, |_| {
            let promise: Promise<&'static str, String> = Promise::new();
            let remote = promise.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                let _ = remote.resolve("done");
            });
            promise
        });
        let (d, _) = dispatcher(registry, Duration::from_secs(5));

        let response = d.dispatch(request("later", 5, json!({})), Uuid::new_v4()).await;
        assert_eq!(response.result, json!("done"));
    }

    #[tokio::test]
    async fn test_never_realized_promise_times_out() {
        let registry = TaskRegistry::new();
        registry.register("hang", false, |_| Promise::<i64, String>::new());
        let (d, _) = dispatcher(registry, Duration::from_millis(30));

        let response = d.dispatch(request("hang", 6, json!({})), Uuid::new_v4()).await;
        assert!(error_of(&response).is_timeout());
    }
}
