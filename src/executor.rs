//! Bounded background executor for cache rebuilds.
//!
//! A fixed pool of workers drains a bounded queue. When the queue is full
//! the submitting caller runs the job itself, which slows producers down
//! instead of dropping rebuilds or growing memory without bound.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Unit of background work.
pub type Job = BoxFuture<'static, ()>;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 16;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Executor sizing.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Number of jobs run concurrently.
    pub workers: usize,
    /// Jobs buffered before submitters start running jobs themselves.
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ExecutorConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if either size is zero
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::ConfigError(
                "executor needs at least one worker".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::ConfigError(
                "executor queue capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of executor counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Jobs handed to [`TaskExecutor::submit`].
    pub submitted: u64,
    /// Jobs that ran to completion, on a worker or inline.
    pub completed: u64,
    /// Jobs run on the submitting task because the queue was full or closed.
    pub ran_inline: u64,
    /// Jobs that panicked.
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    ran_inline: AtomicU64,
    panicked: AtomicU64,
}

/// Background task executor with caller-runs backpressure.
///
/// Owned by the engine and shared between its clones. Call
/// [`TaskExecutor::shutdown`] to stop accepting queued work and wait for
/// the workers to drain what is already queued.
pub struct TaskExecutor {
    sender: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl TaskExecutor {
    /// Start the worker pool on the current tokio runtime.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if the configuration is invalid or no
    /// tokio runtime is running
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;

        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::ConfigError(format!("task executor requires a tokio runtime: {}", e))
        })?;

        let (sender, receiver) = mpsc::channel::<Job>(config.queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let workers = (0..config.workers)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let counters = Arc::clone(&counters);
                handle.spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        match job {
                            Some(job) => run_job(job, &counters).await,
                            None => break,
                        }
                    }
                    trace!("Executor worker {} stopped", id);
                })
            })
            .collect();

        info!(
            "✓ Task executor started ({} workers, queue capacity {})",
            config.workers, config.queue_capacity
        );

        Ok(TaskExecutor {
            sender: std::sync::Mutex::new(Some(sender)),
            workers: tokio::sync::Mutex::new(workers),
            counters,
        })
    }

    /// Start the worker pool with the default sizing.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if no tokio runtime is running
    pub fn with_defaults() -> Result<Self> {
        Self::new(ExecutorConfig::default())
    }

    /// Submit a job.
    ///
    /// Returns once the job is queued. If the queue is full, or the executor
    /// has been shut down, the job runs to completion on the caller before
    /// this returns.
    pub async fn submit(&self, job: Job) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let job = match sender {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(job)) => {
                    warn!("Task executor queue full; running job on the caller");
                    job
                }
                Err(TrySendError::Closed(job)) => job,
            },
            None => {
                debug!("Task executor shut down; running job on the caller");
                job
            }
        };

        self.counters.ran_inline.fetch_add(1, Ordering::Relaxed);
        run_job(job, &self.counters).await;
    }

    /// Current counters.
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            ran_inline: self.counters.ran_inline.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    /// True once [`TaskExecutor::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        match self.sender.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    /// Stop the queue and wait for every queued job to finish.
    ///
    /// Idempotent. Jobs submitted afterwards run on their caller.
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        if workers.is_empty() {
            return;
        }

        for worker in workers {
            if let Err(e) = worker.await {
                error!("Executor worker failed: {}", e);
            }
        }

        info!("✓ Task executor drained and stopped");
    }
}

async fn run_job(job: Job, counters: &Counters) {
    match AssertUnwindSafe(job).catch_unwind().await {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(panic) => {
            counters.panicked.fetch_add(1, Ordering::Relaxed);
            error!("Background job panicked: {}", panic_message(panic.as_ref()));
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_config_validate() {
        assert!(ExecutorConfig::default().validate().is_ok());

        let config = ExecutorConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let config = ExecutorConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let result = TaskExecutor::with_defaults();
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_jobs_run_and_drain_on_shutdown() {
        let executor = TaskExecutor::new(ExecutorConfig {
            workers: 4,
            queue_capacity: 64,
        })
        .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            executor
                .submit(
                    async move {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed(),
                )
                .await;
        }

        executor.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 32);

        let stats = executor.stats();
        assert_eq!(stats.submitted, 32);
        assert_eq!(stats.completed, 32);
        assert_eq!(stats.panicked, 0);
        assert!(executor.is_shut_down());
    }

    #[tokio::test]
    async fn test_full_queue_runs_on_caller() {
        let executor = TaskExecutor::new(ExecutorConfig {
            workers: 1,
            queue_capacity: 1,
        })
        .unwrap();

        // Occupy the only worker until released.
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        executor
            .submit(
                async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                }
                .boxed(),
            )
            .await;
        started_rx.await.unwrap();

        // Fills the single queue slot.
        executor.submit(async {}.boxed()).await;

        // No room left: runs before submit returns.
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        executor
            .submit(
                async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(executor.stats().ran_inline, 1);

        release_tx.send(()).unwrap();
        executor.shutdown().await;
        assert_eq!(executor.stats().completed, 3);
    }

    #[tokio::test]
    async fn test_panicking_job_is_contained() {
        let executor = TaskExecutor::new(ExecutorConfig {
            workers: 1,
            queue_capacity: 8,
        })
        .unwrap();

        executor
            .submit(async { panic!("rebuild exploded") }.boxed())
            .await;
        let after = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&after);
        executor
            .submit(
                async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .await;

        executor.shutdown().await;
        let stats = executor.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_runs_inline() {
        let executor = TaskExecutor::with_defaults().unwrap();
        executor.shutdown().await;
        executor.shutdown().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        executor
            .submit(
                async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                }
                .boxed(),
            )
            .await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(executor.stats().ran_inline, 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
