//! Service layer: ingestion, conversations and background jobs.
//!
//! [`Services::build`] wires the stores, the outbound sender and the flow
//! router into the pieces the HTTP layer and the worker pool run.

pub mod conversation;
pub mod dedup;
pub mod ingestion;
pub mod jobs;
pub mod normalizer;
pub mod signature;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use conversation::{ConversationService, SessionLocks};
pub use dedup::{DedupGate, DedupOutcome};
pub use ingestion::{IngestReport, IngestionService};
pub use jobs::JobRunner;

use crate::alerts::AlertEngine;
use crate::config::DocksideConfig;
use crate::dispatch::{JobQueue, Outbound};
use crate::flow::{FlowDeps, FlowRouter};
use crate::messaging::Messenger;
use crate::persistence::Stores;

/// Every long-lived service, built once at start-up.
#[derive(Debug, Clone)]
pub struct Services {
    /// Store handles.
    pub stores: Stores,
    /// Job queue shared by ingestion, flows, the scheduler and workers.
    pub queue: Arc<dyn JobQueue>,
    /// Rate-limited sender.
    pub outbound: Arc<Outbound>,
    /// Webhook ingestion.
    pub ingestion: Arc<IngestionService>,
    /// Session load/route/save.
    pub conversations: Arc<ConversationService>,
    /// Alert matching and sweeps.
    pub engine: Arc<AlertEngine>,
    /// Job executor for the worker pool.
    pub jobs: Arc<JobRunner>,
    /// Inbound dedup gate.
    pub dedup: Arc<DedupGate>,
}

impl Services {
    /// Wires every service from `config`.
    #[must_use]
    pub fn build(
        config: &DocksideConfig,
        stores: Stores,
        messenger: Arc<dyn Messenger>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let outbound = Arc::new(Outbound::new(
            messenger,
            Arc::new(config.outbound_limits()),
            Arc::clone(&queue),
            Arc::clone(&stores.alerts),
        ));
        let deps = FlowDeps {
            stores: stores.clone(),
            outbound: Arc::clone(&outbound),
            queue: Arc::clone(&queue),
            settings: config.flow_settings(),
        };
        let router = Arc::new(FlowRouter::new(&deps));
        let conversations = Arc::new(ConversationService::new(
            Arc::clone(&stores.sessions),
            router,
            Arc::new(SessionLocks::new()),
        ));
        let dedup = Arc::new(DedupGate::new(Arc::clone(&stores.processed), config.dedup_ttl()));
        let ingestion = Arc::new(IngestionService::new(
            Arc::clone(&dedup),
            Arc::clone(&conversations),
            Arc::clone(&stores.sessions),
            Arc::clone(&stores.alerts),
            Arc::clone(&queue),
            config.webhook_app_secret.clone(),
            config.sync_budget(),
        ));
        let engine = Arc::new(AlertEngine::new(
            stores.clone(),
            Arc::clone(&outbound),
            config.default_search_radius_km,
        ));
        let jobs = Arc::new(JobRunner::new(
            Arc::clone(&conversations),
            Arc::clone(&engine),
            Arc::clone(&outbound),
            config.batch_concurrency,
            config.agreement_reminder_days,
            config.alert_utc_offset_minutes,
        ));
        Self {
            stores,
            queue,
            outbound,
            ingestion,
            conversations,
            engine,
            jobs,
            dedup,
        }
    }

    /// Drops stale limiter windows, idle sender locks and expired dedup
    /// entries.
    pub fn prune(&self) {
        self.outbound.limits().prune();
        self.conversations.locks().prune();
        self.dedup.prune();
    }

    /// Runs [`Services::prune`] every `interval` until `shutdown` flips to
    /// `true`.
    #[must_use]
    pub fn spawn_maintenance(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let services = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        services.prune();
                        tracing::debug!(
                            dedup_cached = services.dedup.cached(),
                            sender_locks = services.conversations.locks().len(),
                            "maintenance pass"
                        );
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
