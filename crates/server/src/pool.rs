//! Bounded worker pool for task handlers.
//!
//! Handlers are plain blocking closures. The pool keeps `min_threads` workers
//! alive, grows up to `max_threads` while jobs are waiting and retires extra
//! workers after `keep_alive` without work. At most `queue_depth` jobs may
//! wait; further submissions are rejected with [`TaskError::Saturated`].
//!
//! A job that outlives its caller's deadline keeps its worker busy until it
//! returns. Its result is discarded.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use robe_shared::TaskError;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub queue_depth: usize,
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: 16,
            queue_depth: 1024,
            keep_alive: Duration::from_secs(30),
        }
    }
}

struct PoolState {
    jobs: VecDeque<Job>,
    threads: usize,
    idle: usize,
    notified: usize,
    spawned: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
    config: PoolConfig,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
}

/// Handle to a submitted job. Resolves to the closure's return value, or to
/// the panic message if it panicked.
pub type JobHandle<R> = oneshot::Receiver<Result<R, String>>;

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let min = config.min_threads.max(1);
        let config = PoolConfig {
            min_threads: min,
            max_threads: config.max_threads.max(min),
            ..config
        };
        let pool = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    jobs: VecDeque::new(),
                    threads: 0,
                    idle: 0,
                    notified: 0,
                    spawned: 0,
                    shutdown: false,
                }),
                available: Condvar::new(),
                config,
            }),
        };

        for _ in 0..min {
            pool.shared.state.lock().threads += 1;
            spawn_worker(&pool.shared);
        }
        pool
    }

    /// Queue `job` for execution on a worker thread.
    pub fn submit<F, R>(&self, job: F) -> Result<JobHandle<R>, TaskError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(job)).map_err(panic_message);
            // The receiver is gone when the caller timed out.
            let _ = tx.send(outcome);
        });

        let mut state = self.shared.state.lock();
        if state.shutdown || state.jobs.len() >= self.shared.config.queue_depth {
            return Err(TaskError::Saturated {
                queued: state.jobs.len(),
            });
        }
        state.jobs.push_back(wrapped);

        // Wake a waiting worker that nobody has claimed yet, otherwise grow.
        if state.idle > state.notified {
            state.notified += 1;
            drop(state);
            self.shared.available.notify_one();
        } else if state.threads < self.shared.config.max_threads {
            state.threads += 1;
            drop(state);
            spawn_worker(&self.shared);
        }
        Ok(rx)
    }

    pub fn threads(&self) -> usize {
        self.shared.state.lock().threads
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.available.notify_all();
    }
}

fn spawn_worker(shared: &Arc<Shared>) {
    let n = {
        let mut state = shared.state.lock();
        state.spawned += 1;
        state.spawned
    };
    let worker_shared = Arc::clone(shared);
    let spawned = std::thread::Builder::new()
        .name(format!("robe-worker-{}", n))
        .spawn(move || worker_loop(worker_shared));

    if let Err(e) = spawned {
        tracing::error!("Failed to spawn task worker: {}", e);
        shared.state.lock().threads -= 1;
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if state.shutdown {
                    state.threads -= 1;
                    return;
                }
                state.idle += 1;
                let waited = shared
                    .available
                    .wait_for(&mut state, shared.config.keep_alive);
                state.idle -= 1;
                state.notified = state.notified.saturating_sub(1);

                if waited.timed_out()
                    && state.jobs.is_empty()
                    && state.threads > shared.config.min_threads
                {
                    state.threads -= 1;
                    tracing::debug!(threads = state.threads, "Idle task worker retired");
                    return;
                }
            }
        };
        job();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(min: usize, max: usize, depth: usize) -> PoolConfig {
        PoolConfig {
            min_threads: min,
            max_threads: max,
            queue_depth: depth,
            keep_alive: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_runs_jobs_and_returns_results() {
        let pool = WorkerPool::new(config(1, 4, 16));
        let handle = pool.submit(|| 21 * 2).unwrap();
        assert_eq!(handle.await.unwrap(), Ok(42));
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(config(1, 1, 16));
        let bad = pool.submit(|| -> u8 { panic!("boom") }).unwrap();
        assert_eq!(bad.await.unwrap(), Err("boom".to_string()));

        let good = pool.submit(|| 1u8).unwrap();
        assert_eq!(good.await.unwrap(), Ok(1));
        assert_eq!(pool.threads(), 1);
    }

    #[tokio::test]
    async fn test_grows_to_max_threads_under_load() {
        let pool = WorkerPool::new(config(1, 3, 16));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.submit(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(100));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert!(pool.threads() <= 3);
    }

    #[tokio::test]
    async fn test_rejects_when_queue_is_full() {
        let pool = WorkerPool::new(config(1, 1, 1));
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let busy = pool
            .submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        // Let the single worker pick up the blocking job.
        while pool.queued() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let waiting = pool.submit(|| ()).unwrap();
        assert!(matches!(
            pool.submit(|| ()),
            Err(TaskError::Saturated { queued: 1 })
        ));

        release_tx.send(()).unwrap();
        busy.await.unwrap().unwrap();
        waiting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_extra_workers_retire_when_idle() {
        let pool = WorkerPool::new(config(1, 2, 16));
        let a = pool
            .submit(|| std::thread::sleep(Duration::from_millis(30)))
            .unwrap();
        let b = pool
            .submit(|| std::thread::sleep(Duration::from_millis(30)))
            .unwrap();
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.threads(), 1);
    }
}
