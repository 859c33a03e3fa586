//! Worker pool draining the job queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::queue::{FailOutcome, Job, JobQueue, QueueError, backoff};
use crate::domain::DomainError;
use crate::flow::FlowError;
use crate::persistence::StoreError;

/// Failure of a single job execution.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// A store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Enqueueing follow-up work failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Conversation routing failed.
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// Payload references data that cannot be processed.
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Executes one job.
#[async_trait]
pub trait JobHandler: Send + Sync + std::fmt::Debug {
    /// Runs `job`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] to have the job retried with backoff.
    async fn handle(&self, job: Job) -> Result<(), JobError>;
}

/// Fixed-size pool of workers sharing one queue.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    poll_interval: Duration,
}

impl WorkerPool {
    /// Creates a pool; call [`WorkerPool::spawn`] to start it.
    #[must_use]
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, poll_interval: Duration) -> Self {
        Self {
            queue,
            handler,
            poll_interval,
        }
    }

    /// Starts `workers` tasks that run until `shutdown` flips to `true`.
    #[must_use]
    pub fn spawn(&self, workers: usize, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let pool = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::info!(worker, "worker started");
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        match pool.run_once().await {
                            Ok(true) => continue,
                            Ok(false) => {}
                            Err(e) => tracing::error!(worker, error = %e, "queue poll failed"),
                        }
                        tokio::select! {
                            () = pool.queue.wait(pool.poll_interval) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    tracing::info!(worker, "worker stopped");
                })
            })
            .collect()
    }

    /// Claims and runs at most one ready job. Returns `false` when the
    /// queue had nothing ready.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the queue itself fails; job failures are
    /// handled by rescheduling.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(claimed) = self.queue.dequeue().await? else {
            return Ok(false);
        };
        let label = claimed.job.label();
        let span = tracing::info_span!("job", id = claimed.id, kind = label, attempt = claimed.attempts);

        match self.handler.handle(claimed.job).instrument(span).await {
            Ok(()) => {
                self.queue.ack(claimed.id).await?;
                tracing::debug!(id = claimed.id, kind = label, "job done");
            }
            Err(e) => {
                let retry_in = backoff(claimed.attempts.saturating_add(1));
                match self.queue.fail(claimed.id, retry_in).await? {
                    FailOutcome::Retrying => tracing::warn!(
                        id = claimed.id,
                        kind = label,
                        error = %e,
                        ?retry_in,
                        "job failed; retrying"
                    ),
                    FailOutcome::Dead => tracing::error!(
                        id = claimed.id,
                        kind = label,
                        error = %e,
                        "job failed permanently; dropped"
                    ),
                }
            }
        }
        Ok(true)
    }

    /// Runs ready jobs until the queue has none left ready.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the queue fails.
    pub async fn drain(&self) -> Result<usize, QueueError> {
        let mut ran = 0usize;
        while self.run_once().await? {
            ran = ran.saturating_add(1);
        }
        Ok(ran)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::dispatch::queue::MemoryJobQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: Job) -> Result<(), JobError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StoreError::Backend("transient".into()).into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_jobs_are_retried_then_acked() {
        tokio::time::pause();
        let queue = Arc::new(MemoryJobQueue::new());
        let handler = Arc::new(Flaky::default());
        let pool = WorkerPool::new(
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::clone(&handler) as Arc<dyn JobHandler>,
            Duration::from_millis(10),
        );
        let _ = queue.enqueue(Job::ExpireCatches, Duration::ZERO).await;

        assert_eq!(pool.run_once().await, Ok(true));
        assert_eq!(queue.len().await, Ok(1), "failed job stays queued");
        assert_eq!(pool.run_once().await, Ok(false), "not ready before backoff");

        tokio::time::advance(backoff(1)).await;
        assert_eq!(pool.drain().await, Ok(1));
        assert_eq!(queue.len().await, Ok(0));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn spawned_workers_stop_on_shutdown() {
        let queue = Arc::new(MemoryJobQueue::new());
        let handler = Arc::new(Flaky::default());
        let pool = WorkerPool::new(
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            handler,
            Duration::from_millis(5),
        );
        let (tx, rx) = watch::channel(false);
        let handles = pool.spawn(2, &rx);
        let _ = tx.send(true);
        for handle in handles {
            let joined = tokio::time::timeout(Duration::from_secs(1), handle).await;
            assert!(matches!(joined, Ok(Ok(()))));
        }
    }
}
