//! Wall-clock scheduling of sweep jobs.
//!
//! The scheduler never does the work itself; it enqueues jobs on the
//! shared queue so sweeps run on the worker pool with the usual retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc, Weekday};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatch::{Job, JobQueue, QueueError};
use crate::domain::DeliveryFrequency;

const MORNING_HOUR: u32 = 6;
const AFTERNOON_HOUR: u32 = 16;
const WEEKLY_HOUR: u32 = 7;
const REMINDER_HOUR: u32 = 8;

/// Jobs due at the start of the local hour containing `local`.
#[must_use]
pub fn due_sweeps(local: NaiveDateTime) -> Vec<Job> {
    let hour = local.hour();
    let mut jobs = vec![Job::ExpireCatches];
    if hour == MORNING_HOUR {
        jobs.push(Job::DigestSweep { frequency: DeliveryFrequency::MorningOnly });
        jobs.push(Job::DigestSweep { frequency: DeliveryFrequency::TwiceDaily });
    }
    if hour == AFTERNOON_HOUR {
        jobs.push(Job::DigestSweep { frequency: DeliveryFrequency::TwiceDaily });
    }
    if hour == WEEKLY_HOUR && local.weekday() == Weekday::Mon {
        jobs.push(Job::DigestSweep { frequency: DeliveryFrequency::WeeklyDigest });
    }
    if hour == REMINDER_HOUR {
        jobs.push(Job::AgreementReminders);
    }
    jobs
}

/// Enqueues [`due_sweeps`] once per local hour.
#[derive(Debug)]
pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    offset_minutes: i32,
    last_hour: Option<NaiveDateTime>,
}

impl Scheduler {
    /// Creates a scheduler for a local time `offset_minutes` ahead of UTC.
    #[must_use]
    pub fn new(queue: Arc<dyn JobQueue>, offset_minutes: i32) -> Self {
        Self {
            queue,
            offset_minutes,
            last_hour: None,
        }
    }

    fn local_hour(&self, now: DateTime<Utc>) -> Option<NaiveDateTime> {
        let local = now.naive_utc() + chrono::Duration::minutes(i64::from(self.offset_minutes));
        local.with_minute(0)?.with_second(0)?.with_nanosecond(0)
    }

    /// Enqueues the sweeps of the current local hour if they have not
    /// been enqueued yet. The first tick after start-up always fires;
    /// every sweep is safe to repeat. Returns the number of jobs queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if enqueueing fails; the hour is retried on
    /// the next tick.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let Some(hour) = self.local_hour(now) else {
            return Ok(0);
        };
        if self.last_hour == Some(hour) {
            return Ok(0);
        }
        let jobs = due_sweeps(hour);
        let count = jobs.len();
        for job in jobs {
            self.queue.enqueue(job, Duration::ZERO).await?;
        }
        self.last_hour = Some(hour);
        tracing::info!(local_hour = %hour, jobs = count, "scheduled sweeps");
        Ok(count)
    }

    /// Ticks every `interval` until `shutdown` flips to `true`.
    #[must_use]
    pub fn spawn(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(Utc::now()).await {
                            tracing::error!(error = %e, "failed to schedule sweeps");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("scheduler stopped");
        })
    }
}
