//! Background job queue.
//!
//! Anything that must not run on the webhook request path is expressed as a
//! [`Job`] and enqueued here: deferred message processing, rate-limited
//! sends, alert fan-out and scheduled sweeps. Workers claim ready jobs,
//! then either [`JobQueue::ack`] them or report a failure with
//! [`JobQueue::fail`], which reschedules until [`MAX_ATTEMPTS`].
//!
//! Jobs that share an [ordering key](Job::ordering_key) run one at a time
//! in enqueue order: only the oldest job of a key is claimable, and the
//! next one waits until it is acked or dropped.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::Lane;
use crate::domain::{AlertId, CatchId, DeliveryFrequency, IncomingMessage};
use crate::messaging::OutboundMessage;

/// Attempts after which a failing job is dropped.
pub const MAX_ATTEMPTS: u32 = 5;

/// Unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Route an inbound message that was not processed inline.
    ProcessMessage {
        /// The normalized message.
        message: IncomingMessage,
    },
    /// Send a message that was deferred by a rate limiter.
    Send {
        /// Message to send.
        message: OutboundMessage,
        /// Limiter lane it belongs to.
        lane: Lane,
        /// Alerts whose lifecycle the send updates: one for an immediate
        /// alert, every listed alert for a digest.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        alert_ids: Vec<AlertId>,
    },
    /// Fan a new catch out to matching subscribers.
    ProcessCatch {
        /// The new catch.
        catch_id: CatchId,
    },
    /// Offer alternatives to buyers of a catch that sold out.
    CatchSoldOut {
        /// The sold-out catch.
        catch_id: CatchId,
    },
    /// Flush pending alerts of one digest frequency.
    DigestSweep {
        /// Frequency to flush.
        frequency: DeliveryFrequency,
    },
    /// Expire catches past their listing window.
    ExpireCatches,
    /// Remind both parties of agreements coming due.
    AgreementReminders,
}

impl Job {
    /// Short label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ProcessMessage { .. } => "process_message",
            Self::Send { .. } => "send",
            Self::ProcessCatch { .. } => "process_catch",
            Self::CatchSoldOut { .. } => "catch_sold_out",
            Self::DigestSweep { .. } => "digest_sweep",
            Self::ExpireCatches => "expire_catches",
            Self::AgreementReminders => "agreement_reminders",
        }
    }

    /// Serialization key: deferred messages from one sender share their
    /// sender's phone so a conversation is never processed out of order.
    #[must_use]
    pub fn ordering_key(&self) -> Option<&str> {
        match self {
            Self::ProcessMessage { message } => Some(message.from.as_str()),
            _ => None,
        }
    }
}

/// A claimed job.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    /// Queue-assigned id.
    pub id: i64,
    /// Payload.
    pub job: Job,
    /// Failed attempts so far.
    pub attempts: u32,
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled for another attempt.
    Retrying,
    /// Out of attempts and dropped.
    Dead,
}

/// Queue failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The backend failed.
    #[error("queue backend failure: {0}")]
    Backend(String),

    /// A stored payload could not be decoded.
    #[error("undecodable job {id}: {reason}")]
    Corrupt {
        /// Row id.
        id: i64,
        /// Decode error.
        reason: String,
    },
}

/// Durable or in-process job queue.
#[async_trait]
pub trait JobQueue: Send + Sync + std::fmt::Debug {
    /// Schedules `job` to become ready after `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on backend failure.
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<i64, QueueError>;

    /// Claims the oldest ready job, if any. A job is skipped while an
    /// older job with the same [ordering key](Job::ordering_key) is still
    /// queued or claimed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on backend failure.
    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError>;

    /// Removes a completed job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on backend failure.
    async fn ack(&self, id: i64) -> Result<(), QueueError>;

    /// Records a failed attempt and reschedules after `retry_in`, or drops
    /// the job once it reached [`MAX_ATTEMPTS`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on backend failure.
    async fn fail(&self, id: i64, retry_in: Duration) -> Result<FailOutcome, QueueError>;

    /// Jobs waiting or claimed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on backend failure.
    async fn len(&self) -> Result<usize, QueueError>;

    /// Whether any job with ordering key `key` is waiting or claimed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on backend failure.
    async fn has_pending(&self, key: &str) -> Result<bool, QueueError>;

    /// Resolves when new work may be available. Backends without push
    /// notification simply sleep for `fallback`.
    async fn wait(&self, fallback: Duration) {
        tokio::time::sleep(fallback).await;
    }
}

/// Backoff before retry number `attempts` (1-based): 2s, 4s, 8s... capped
/// at five minutes.
#[must_use]
pub fn backoff(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(8);
    Duration::from_secs(2u64.saturating_pow(exp.saturating_add(1)).min(300))
}

#[derive(Debug)]
struct Entry {
    job: Job,
    run_at: Instant,
    attempts: u32,
    claimed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    entries: BTreeMap<i64, Entry>,
}

/// Process-local queue used when persistence is disabled and in tests.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryJobQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every unclaimed job, in id order (test helper).
    pub async fn snapshot(&self) -> Vec<Job> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .values()
            .filter(|e| !e.claimed)
            .map(|e| e.job.clone())
            .collect()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<i64, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.next_id = inner.next_id.saturating_add(1);
        let id = inner.next_id;
        inner.entries.insert(
            id,
            Entry {
                job,
                run_at: Instant::now() + delay,
                attempts: 0,
                claimed: false,
            },
        );
        drop(inner);
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mut held: HashSet<String> = HashSet::new();
        let Some((&id, entry)) = inner.entries.iter_mut().find(|(_, e)| {
            if let Some(key) = e.job.ordering_key() {
                if !held.insert(key.to_string()) {
                    return false;
                }
            }
            !e.claimed && e.run_at <= now
        }) else {
            return Ok(None);
        };
        entry.claimed = true;
        Ok(Some(QueuedJob {
            id,
            job: entry.job.clone(),
            attempts: entry.attempts,
        }))
    }

    async fn ack(&self, id: i64) -> Result<(), QueueError> {
        self.inner.lock().await.entries.remove(&id);
        Ok(())
    }

    async fn fail(&self, id: i64, retry_in: Duration) -> Result<FailOutcome, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(&id) else {
            return Ok(FailOutcome::Dead);
        };
        entry.attempts = entry.attempts.saturating_add(1);
        if entry.attempts >= MAX_ATTEMPTS {
            inner.entries.remove(&id);
            return Ok(FailOutcome::Dead);
        }
        entry.claimed = false;
        entry.run_at = Instant::now() + retry_in;
        Ok(FailOutcome::Retrying)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.inner.lock().await.entries.len())
    }

    async fn has_pending(&self, key: &str) -> Result<bool, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.values().any(|e| e.job.ordering_key() == Some(key)))
    }

    async fn wait(&self, fallback: Duration) {
        let _ = tokio::time::timeout(fallback, self.notify.notified()).await;
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delayed_jobs_are_not_ready_early() {
        tokio::time::pause();
        let queue = MemoryJobQueue::new();
        let _ = queue.enqueue(Job::ExpireCatches, Duration::from_secs(5)).await;
        assert_eq!(queue.dequeue().await, Ok(None));

        tokio::time::advance(Duration::from_secs(6)).await;
        let Ok(Some(claimed)) = queue.dequeue().await else {
            panic!("job should be ready");
        };
        assert_eq!(claimed.job, Job::ExpireCatches);
        assert_eq!(queue.dequeue().await, Ok(None), "claimed jobs are invisible");
    }

    #[tokio::test]
    async fn ack_removes_and_fail_reschedules() {
        tokio::time::pause();
        let queue = MemoryJobQueue::new();
        let _ = queue.enqueue(Job::AgreementReminders, Duration::ZERO).await;
        let Ok(Some(first)) = queue.dequeue().await else {
            panic!("ready job expected");
        };
        assert_eq!(queue.fail(first.id, Duration::from_secs(2)).await, Ok(FailOutcome::Retrying));
        tokio::time::advance(Duration::from_secs(3)).await;
        let Ok(Some(second)) = queue.dequeue().await else {
            panic!("retry expected");
        };
        assert_eq!(second.attempts, 1);
        assert_eq!(queue.ack(second.id).await, Ok(()));
        assert_eq!(queue.len().await, Ok(0));
    }

    #[tokio::test]
    async fn jobs_die_after_max_attempts() {
        tokio::time::pause();
        let queue = MemoryJobQueue::new();
        let _ = queue.enqueue(Job::ExpireCatches, Duration::ZERO).await;
        let mut outcome = FailOutcome::Retrying;
        for _ in 0..MAX_ATTEMPTS {
            let Ok(Some(job)) = queue.dequeue().await else {
                panic!("job expected");
            };
            let Ok(o) = queue.fail(job.id, Duration::ZERO).await else {
                panic!("fail should succeed");
            };
            outcome = o;
        }
        assert_eq!(outcome, FailOutcome::Dead);
        assert_eq!(queue.len().await, Ok(0));
    }

    fn message_from(from: &str, text: &str) -> Job {
        Job::ProcessMessage {
            message: IncomingMessage::text(format!("wamid.{from}.{text}"), from, text),
        }
    }

    fn text_of(job: &QueuedJob) -> Option<&str> {
        match &job.job {
            Job::ProcessMessage { message } => message.text.as_deref(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn one_sender_is_claimed_one_message_at_a_time() {
        let queue = MemoryJobQueue::new();
        let _ = queue.enqueue(message_from("9001", "first"), Duration::ZERO).await;
        let _ = queue.enqueue(message_from("9001", "second"), Duration::ZERO).await;
        let _ = queue.enqueue(message_from("9002", "other"), Duration::ZERO).await;

        let Ok(Some(first)) = queue.dequeue().await else {
            panic!("first message expected");
        };
        assert_eq!(text_of(&first), Some("first"));
        // A second worker skips the held sender and takes the other one.
        let Ok(Some(other)) = queue.dequeue().await else {
            panic!("other sender expected");
        };
        assert_eq!(text_of(&other), Some("other"));
        assert_eq!(queue.dequeue().await, Ok(None));
        assert_eq!(queue.has_pending("9001").await, Ok(true));

        assert_eq!(queue.ack(first.id).await, Ok(()));
        let Ok(Some(second)) = queue.dequeue().await else {
            panic!("second message expected after the first is acked");
        };
        assert_eq!(text_of(&second), Some("second"));
        assert_eq!(queue.ack(second.id).await, Ok(()));
        assert_eq!(queue.has_pending("9001").await, Ok(false));
    }

    #[tokio::test]
    async fn retrying_message_keeps_its_place() {
        tokio::time::pause();
        let queue = MemoryJobQueue::new();
        let _ = queue.enqueue(message_from("9003", "first"), Duration::ZERO).await;
        let _ = queue.enqueue(message_from("9003", "second"), Duration::ZERO).await;
        let Ok(Some(first)) = queue.dequeue().await else {
            panic!("first message expected");
        };
        let _ = queue.fail(first.id, Duration::from_secs(2)).await;
        assert_eq!(queue.dequeue().await, Ok(None), "second must wait for the retry");

        tokio::time::advance(Duration::from_secs(3)).await;
        let Ok(Some(retry)) = queue.dequeue().await else {
            panic!("retry expected");
        };
        assert_eq!(text_of(&retry), Some("first"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(30), Duration::from_secs(300));
    }

    #[test]
    fn send_job_survives_serde() {
        let job = Job::Send {
            message: OutboundMessage::text("91", "hi"),
            lane: Lane::Broadcast,
            alert_ids: vec![AlertId::new(), AlertId::new()],
        };
        let Ok(json) = serde_json::to_value(&job) else {
            panic!("serialize");
        };
        assert_eq!(json["kind"], "send");
        assert_eq!(serde_json::from_value::<Job>(json).ok(), Some(job));
    }
}
