//! Executes queued jobs on the worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;

use super::conversation::ConversationService;
use crate::alerts::AlertEngine;
use crate::dispatch::{Delivery, Job, JobError, JobHandler, Outbound};

/// [`JobHandler`] for every [`Job`] variant.
///
/// Alert fan-out, digest and sold-out jobs share a semaphore so a burst
/// of catches cannot occupy every worker at once.
#[derive(Debug)]
pub struct JobRunner {
    conversations: Arc<ConversationService>,
    engine: Arc<AlertEngine>,
    outbound: Arc<Outbound>,
    batch: Arc<Semaphore>,
    reminder_days: u32,
    utc_offset_minutes: i32,
}

impl JobRunner {
    /// Creates the runner with `batch_concurrency` alert-job permits.
    #[must_use]
    pub fn new(
        conversations: Arc<ConversationService>,
        engine: Arc<AlertEngine>,
        outbound: Arc<Outbound>,
        batch_concurrency: usize,
        reminder_days: u32,
        utc_offset_minutes: i32,
    ) -> Self {
        Self {
            conversations,
            engine,
            outbound,
            batch: Arc::new(Semaphore::new(batch_concurrency.max(1))),
            reminder_days,
            utc_offset_minutes,
        }
    }
}

#[async_trait]
impl JobHandler for JobRunner {
    async fn handle(&self, job: Job) -> Result<(), JobError> {
        match job {
            Job::ProcessMessage { message } => {
                let outcome = self.conversations.process(&message).await?;
                tracing::debug!(message_id = %message.message_id, ?outcome, "deferred message processed");
            }
            Job::Send { message, lane, alert_ids } => {
                let alerts = alert_ids.len();
                match self.outbound.deliver_tracked(message, lane, alert_ids).await {
                    Delivery::Sent(_) | Delivery::Deferred(_) => {}
                    Delivery::Failed(reason) => {
                        tracing::warn!(alerts, %reason, "deferred send failed permanently");
                    }
                }
            }
            Job::ProcessCatch { catch_id } => {
                let _permit = self.batch.acquire().await.ok();
                let summary = self.engine.process_new_catch(catch_id).await?;
                tracing::info!(%catch_id, ?summary, "catch fan-out finished");
            }
            Job::CatchSoldOut { catch_id } => {
                let _permit = self.batch.acquire().await.ok();
                self.engine.process_sold_out(catch_id).await?;
            }
            Job::DigestSweep { frequency } => {
                let _permit = self.batch.acquire().await.ok();
                self.engine.flush_digests(frequency, Utc::now()).await?;
            }
            Job::ExpireCatches => {
                self.engine.expire_catches(Utc::now()).await?;
            }
            Job::AgreementReminders => {
                let local = Utc::now() + chrono::Duration::minutes(i64::from(self.utc_offset_minutes));
                self.engine
                    .send_agreement_reminders(local.date_naive(), self.reminder_days)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::dispatch::{JobQueue, Lane, WorkerPool};
    use crate::domain::{
        CatchId, CatchStatus, DeliveryFrequency, FishCatch, FishSubscription, FishTypeFilter,
        FishTypeId, FlowKind, Radius, Session,
    };
    use crate::flow::testing::{Harness, point};
    use crate::messaging::OutboundMessage;
    use crate::persistence::{CatchStore, SessionStore, SubscriptionStore};
    use crate::service::conversation::tests::service;
    use crate::service::ingestion::tests::{ingestion, text_body};

    fn runner(h: &Harness) -> JobRunner {
        let engine = AlertEngine::new(h.deps.stores.clone(), Arc::clone(&h.deps.outbound), 10.0);
        JobRunner::new(
            Arc::new(service(h)),
            Arc::new(engine),
            Arc::clone(&h.deps.outbound),
            2,
            1,
            330,
        )
    }

    fn pool(h: &Harness) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&h.deps.queue),
            Arc::new(runner(h)),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn deferred_message_is_answered_by_a_worker() {
        let h = Harness::new();
        let mut session = Session::new("919800000006");
        session.enter(FlowKind::Agreement, "ask_direction", serde_json::Value::Null);
        let Ok(_) = h.store.save(&session).await else {
            panic!("seed session");
        };
        let report = ingestion(&h, None)
            .ingest(None, &text_body("wamid.j1", "919800000006", "menu"))
            .await;
        assert_eq!(report.deferred, 1);
        assert!(h.last_to("919800000006").is_none());

        assert_eq!(pool(&h).drain().await, Ok(1));
        assert!(h.last_to("919800000006").is_some());
        let Ok(session) = h.store.load_or_create("919800000006").await else {
            panic!("session missing");
        };
        assert_eq!(session.flow, FlowKind::MainMenu);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_workers_keep_one_senders_messages_in_order() {
        let h = Harness::new();
        h.messenger.slow_down(Duration::from_millis(20));
        let mut session = Session::new("919800000010");
        session.enter(FlowKind::Agreement, "ask_amount", serde_json::Value::Null);
        let Ok(_) = h.store.save(&session).await else {
            panic!("seed session");
        };
        let svc = ingestion(&h, None);
        for (id, text) in [("wamid.o1", "500"), ("wamid.o2", "New net")] {
            let report = svc.ingest(None, &text_body(id, "919800000010", text)).await;
            assert_eq!(report.deferred, 1);
        }

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handles = pool(&h).spawn(2, &rx);
        let emptied = tokio::time::timeout(Duration::from_secs(5), async {
            while h.queue.len().await != Ok(0) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        let _ = tx.send(true);
        for handle in handles {
            let _ = handle.await;
        }
        assert!(emptied.is_ok(), "workers should drain the queue");

        // Amount first, then purpose: the flow ends up asking for the date.
        let Ok(session) = h.store.load_or_create("919800000010").await else {
            panic!("session missing");
        };
        assert_eq!(session.step(), Some("ask_due_date"));
    }

    #[tokio::test]
    async fn catch_job_fans_out_alerts() {
        let h = Harness::new();
        let Ok(radius) = Radius::new(10.0) else {
            panic!("valid radius");
        };
        let sub = FishSubscription::new(
            "919800000007",
            point(9.93, 76.26),
            radius,
            FishTypeFilter::All,
            DeliveryFrequency::Immediate,
        );
        let Ok(()) = h.store.insert_subscription(&sub).await else {
            panic!("insert subscription");
        };
        let now = Utc::now();
        let catch = FishCatch {
            id: CatchId::new(),
            seller_phone: "919800000008".to_string(),
            fish_type: FishTypeId(3),
            location: Some(point(9.95, 76.25)),
            price_per_kg: 60_000,
            quantity_kg: 12.0,
            status: CatchStatus::Available,
            photo: None,
            customers_coming: 0,
            created_at: now,
            expires_at: now + chrono::Duration::hours(12),
        };
        let Ok(()) = h.store.insert_catch(&catch).await else {
            panic!("insert catch");
        };
        let Ok(_) = h.queue.enqueue(Job::ProcessCatch { catch_id: catch.id }, Duration::ZERO).await else {
            panic!("enqueue");
        };
        assert_eq!(pool(&h).drain().await, Ok(1));
        assert_eq!(h.messenger.sent_to("919800000007").len(), 1);
    }

    #[tokio::test]
    async fn send_job_delivers() {
        let h = Harness::new();
        let job = Job::Send {
            message: OutboundMessage::text("919800000009", "queued hello"),
            lane: Lane::Broadcast,
            alert_ids: Vec::new(),
        };
        let Ok(()) = runner(&h).handle(job).await else {
            panic!("send job failed");
        };
        assert_eq!(h.last_text("919800000009"), "queued hello");
    }

    #[tokio::test]
    async fn sweeps_run_without_work() {
        let h = Harness::new();
        let r = runner(&h);
        for job in [
            Job::ExpireCatches,
            Job::AgreementReminders,
            Job::DigestSweep { frequency: DeliveryFrequency::MorningOnly },
            Job::CatchSoldOut { catch_id: CatchId::new() },
        ] {
            let label = job.label();
            let Ok(()) = r.handle(job).await else {
                panic!("{label} failed");
            };
        }
        assert!(h.messenger.sent().is_empty());
    }
}
