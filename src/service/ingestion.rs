//! Webhook body to processed messages and applied receipts.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::conversation::ConversationService;
use super::dedup::{DedupGate, DedupOutcome};
use super::normalizer::{self, ChangeBatch};
use super::signature::verify_signature;
use crate::dispatch::{Dispatch, Job, JobQueue, decide};
use crate::domain::{IncomingMessage, ReceiptStatus};
use crate::persistence::{AlertStore, SessionStore};

/// Counts from one webhook delivery, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Messages found in the payload.
    pub messages: usize,
    /// Messages dropped as already seen.
    pub duplicates: usize,
    /// Messages that could not be normalized.
    pub rejected: usize,
    /// Messages processed on the webhook task.
    pub inline: usize,
    /// Messages handed to the job queue.
    pub deferred: usize,
    /// Delivery receipts applied to an alert.
    pub receipts: usize,
    /// `true` if the body was dropped for a bad signature.
    pub signature_rejected: bool,
}

/// Everything the webhook handler needs to accept a delivery.
#[derive(Debug)]
pub struct IngestionService {
    dedup: Arc<DedupGate>,
    conversations: Arc<ConversationService>,
    sessions: Arc<dyn SessionStore>,
    alerts: Arc<dyn AlertStore>,
    queue: Arc<dyn JobQueue>,
    app_secret: Option<String>,
    sync_budget: Duration,
}

impl IngestionService {
    /// Creates the service. With `app_secret` set every body must carry a
    /// valid `X-Hub-Signature-256`.
    #[must_use]
    pub fn new(
        dedup: Arc<DedupGate>,
        conversations: Arc<ConversationService>,
        sessions: Arc<dyn SessionStore>,
        alerts: Arc<dyn AlertStore>,
        queue: Arc<dyn JobQueue>,
        app_secret: Option<String>,
        sync_budget: Duration,
    ) -> Self {
        Self {
            dedup,
            conversations,
            sessions,
            alerts,
            queue,
            app_secret,
            sync_budget,
        }
    }

    /// Accepts one webhook body. Never fails: every problem is logged and
    /// isolated to the message or status it came from.
    pub async fn ingest(&self, signature: Option<&str>, body: &[u8]) -> IngestReport {
        let mut report = IngestReport::default();

        if let Some(secret) = self.app_secret.as_deref() {
            if let Err(e) = verify_signature(secret, signature, body) {
                tracing::warn!(error = %e, "webhook signature rejected; payload dropped");
                report.signature_rejected = true;
                return report;
            }
        }

        let payload: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, bytes = body.len(), "webhook body is not JSON; ignored");
                return report;
            }
        };

        // One budget for the whole delivery, not one per message.
        let deadline = Instant::now() + self.sync_budget;
        for batch in normalizer::extract_changes(&payload) {
            self.ingest_batch(&batch, deadline, &mut report).await;
        }

        tracing::debug!(?report, "webhook ingested");
        report
    }

    async fn ingest_batch(&self, batch: &ChangeBatch, deadline: Instant, report: &mut IngestReport) {
        for raw in &batch.messages {
            report.messages = report.messages.saturating_add(1);
            let id = normalizer::message_id(raw).unwrap_or_default();
            if self.dedup.accept(id).await == DedupOutcome::Duplicate {
                report.duplicates = report.duplicates.saturating_add(1);
                continue;
            }
            let message = match normalizer::normalize_message(raw, &batch.contacts) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(message_id = id, error = %e, "message could not be normalized");
                    report.rejected = report.rejected.saturating_add(1);
                    continue;
                }
            };
            match self.dispatch(message, deadline).await {
                Dispatch::Inline => report.inline = report.inline.saturating_add(1),
                Dispatch::Deferred(_) => report.deferred = report.deferred.saturating_add(1),
            }
        }

        for raw in &batch.statuses {
            match normalizer::normalize_status(raw) {
                Ok(receipt) => {
                    if receipt.status == ReceiptStatus::Failed {
                        tracing::warn!(
                            provider_message_id = %receipt.provider_message_id,
                            recipient = %receipt.recipient,
                            error = receipt.error.as_deref().unwrap_or("unknown"),
                            "provider reported delivery failure"
                        );
                    }
                    match self.alerts.apply_receipt(&receipt).await {
                        Ok(true) => report.receipts = report.receipts.saturating_add(1),
                        Ok(false) => {}
                        Err(e) => tracing::error!(
                            provider_message_id = %receipt.provider_message_id,
                            error = %e,
                            "failed to apply receipt"
                        ),
                    }
                }
                Err(e) => tracing::debug!(error = %e, "status ignored"),
            }
        }
    }

    /// Runs `message` inline or enqueues it. Returns where it went.
    ///
    /// A sender with deferred messages still queued is deferred again so
    /// the new message lines up behind them.
    async fn dispatch(&self, message: IncomingMessage, deadline: Instant) -> Dispatch {
        let decision = match self.queue.has_pending(&message.from).await {
            Ok(true) => Dispatch::Deferred("sender_backlog"),
            Ok(false) => self.decision_for(&message).await,
            Err(e) => {
                tracing::warn!(phone = %message.from, error = %e, "backlog check failed");
                self.decision_for(&message).await
            }
        };

        if let Dispatch::Deferred(reason) = decision {
            let message_id = message.message_id.clone();
            match self.queue.enqueue(Job::ProcessMessage { message: message.clone() }, Duration::ZERO).await {
                Ok(job_id) => {
                    tracing::debug!(%message_id, reason, job_id, "message deferred");
                    return decision;
                }
                Err(e) => {
                    tracing::warn!(%message_id, error = %e, "enqueue failed; processing inline");
                }
            }
        }

        self.run_inline(message, deadline).await;
        Dispatch::Inline
    }

    async fn decision_for(&self, message: &IncomingMessage) -> Dispatch {
        match self.sessions.load_or_create(&message.from).await {
            Ok(session) => decide(message, &session),
            Err(e) => {
                tracing::warn!(phone = %message.from, error = %e, "session lookup failed; processing inline");
                Dispatch::Inline
            }
        }
    }

    /// Processes on a detached task, waiting until the delivery's deadline
    /// at most. Work past the deadline keeps running after the webhook has
    /// answered.
    async fn run_inline(&self, message: IncomingMessage, deadline: Instant) {
        let conversations = Arc::clone(&self.conversations);
        let message_id = message.message_id.clone();
        let mut task = tokio::spawn(async move { conversations.process(&message).await });
        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => tracing::error!(%message_id, error = %e, "message processing failed"),
            Ok(Err(e)) => tracing::error!(%message_id, error = %e, "message task aborted"),
            Err(_) => tracing::info!(%message_id, budget = ?self.sync_budget, "sync budget exceeded; continuing in background"),
        }
    }
}
