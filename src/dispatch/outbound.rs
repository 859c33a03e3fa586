//! Rate-limited outbound sender.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::queue::{Job, JobQueue};
use super::rate_limit::OutboundLimits;
use super::Lane;
use crate::domain::AlertId;
use crate::messaging::{Messenger, OutboundMessage, SentMessage};
use crate::persistence::AlertStore;

/// Delay applied when the provider itself throttles us.
const PROVIDER_THROTTLE_DELAY: Duration = Duration::from_secs(60);

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the provider.
    Sent(SentMessage),
    /// Over budget; re-queued to run after the given delay.
    Deferred(Duration),
    /// Rejected or undeliverable; logged and not retried.
    Failed(String),
}

impl Delivery {
    /// `true` for [`Delivery::Sent`].
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        matches!(self, Self::Sent(_))
    }
}

/// Single exit point for every message the service sends.
///
/// Sends are checked against [`OutboundLimits`]; a denied send becomes a
/// delayed [`Job::Send`] instead of being dropped. When alert ids are
/// attached, their lifecycle is updated with the result, and a deferred
/// send carries the ids along to the job that finally sends it.
#[derive(Debug)]
pub struct Outbound {
    messenger: Arc<dyn Messenger>,
    limits: Arc<OutboundLimits>,
    queue: Arc<dyn JobQueue>,
    alerts: Arc<dyn AlertStore>,
}

impl Outbound {
    /// Creates the sender.
    #[must_use]
    pub fn new(
        messenger: Arc<dyn Messenger>,
        limits: Arc<OutboundLimits>,
        queue: Arc<dyn JobQueue>,
        alerts: Arc<dyn AlertStore>,
    ) -> Self {
        Self {
            messenger,
            limits,
            queue,
            alerts,
        }
    }

    /// Shared limiter handle (pruned by the scheduler).
    #[must_use]
    pub fn limits(&self) -> &Arc<OutboundLimits> {
        &self.limits
    }

    /// Sends a conversational reply.
    pub async fn reply(&self, message: OutboundMessage) -> Delivery {
        self.deliver_tracked(message, Lane::Conversational, Vec::new()).await
    }

    /// Sends on `lane`.
    pub async fn deliver(&self, message: OutboundMessage, lane: Lane) -> Delivery {
        self.deliver_tracked(message, lane, Vec::new()).await
    }

    /// Sends an alert notification on the broadcast lane.
    pub async fn deliver_alert(&self, message: OutboundMessage, alert_id: AlertId) -> Delivery {
        self.deliver_tracked(message, Lane::Broadcast, vec![alert_id]).await
    }

    /// Sends one digest covering `alert_ids` on the broadcast lane. Every
    /// listed alert shares the digest's fate, including after a deferral.
    pub async fn deliver_digest(&self, message: OutboundMessage, alert_ids: Vec<AlertId>) -> Delivery {
        self.deliver_tracked(message, Lane::Broadcast, alert_ids).await
    }

    /// Sends on `lane`, recording the result on every alert in `alert_ids`.
    pub async fn deliver_tracked(
        &self,
        message: OutboundMessage,
        lane: Lane,
        alert_ids: Vec<AlertId>,
    ) -> Delivery {
        if let Err(wait) = self.limits.admit(lane, &message.to) {
            return self.defer(message, lane, alert_ids, wait).await;
        }

        match self.messenger.send(&message).await {
            Ok(sent) => {
                let now = Utc::now();
                for id in &alert_ids {
                    if let Err(e) = self
                        .alerts
                        .mark_alert_sent(*id, now, sent.provider_message_id.clone())
                        .await
                    {
                        tracing::error!(alert_id = %id, error = %e, "failed to record alert send");
                    }
                }
                Delivery::Sent(sent)
            }
            Err(crate::messaging::MessengerError::Rejected { status: 429, .. }) => {
                tracing::warn!(to = %message.to, "provider throttled send; re-queueing");
                self.defer(message, lane, alert_ids, PROVIDER_THROTTLE_DELAY).await
            }
            Err(e) => {
                tracing::warn!(to = %message.to, ?lane, error = %e, "outbound send failed");
                let reason = e.to_string();
                self.record_failure(&alert_ids, &reason).await;
                Delivery::Failed(reason)
            }
        }
    }

    async fn defer(
        &self,
        message: OutboundMessage,
        lane: Lane,
        alert_ids: Vec<AlertId>,
        wait: Duration,
    ) -> Delivery {
        let to = message.to.clone();
        let job = Job::Send {
            message,
            lane,
            alert_ids: alert_ids.clone(),
        };
        match self.queue.enqueue(job, wait).await {
            Ok(job_id) => {
                tracing::debug!(%to, ?lane, job_id, ?wait, alerts = alert_ids.len(), "send deferred by rate limit");
                Delivery::Deferred(wait)
            }
            Err(e) => {
                tracing::error!(%to, ?lane, error = %e, "could not re-queue deferred send");
                let reason = format!("deferral failed: {e}");
                self.record_failure(&alert_ids, &reason).await;
                Delivery::Failed(reason)
            }
        }
    }

    async fn record_failure(&self, alert_ids: &[AlertId], reason: &str) {
        let now = Utc::now();
        for id in alert_ids {
            if let Err(e) = self.alerts.mark_alert_failed(*id, now, reason).await {
                tracing::error!(alert_id = %id, error = %e, "failed to record alert failure");
            }
        }
    }
}
