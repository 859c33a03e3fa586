//! Digest sweeps for subscribers who asked for batched alerts.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use super::CATCH_UNAVAILABLE;
use super::engine::AlertEngine;
use crate::dispatch::Delivery;
use crate::domain::fish::{fish_label, format_rupees};
use crate::domain::{CatchId, DeliveryFrequency, FishAlert, FishCatch};
use crate::flow::Shortcut;
use crate::messaging::{ListRow, MAX_LIST_ROWS, OutboundMessage};
use crate::persistence::StoreError;

/// Outcome of one digest sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestSummary {
    /// Subscribers who got a digest.
    pub subscribers: usize,
    /// Alerts listed in a digest.
    pub listed: usize,
    /// Alerts dropped because the catch is no longer available.
    pub unavailable: usize,
    /// Alerts whose digest the provider rejected.
    pub failed: usize,
    /// Alerts whose digest was queued by the rate limiter.
    pub deferred: usize,
}

impl AlertEngine {
    /// Sends one digest per subscriber holding pending alerts of
    /// `frequency`.
    ///
    /// Alerts for catches that closed in the meantime are failed with
    /// [`CATCH_UNAVAILABLE`]. A digest lists at most ten catches; anything
    /// beyond that stays pending for the next sweep.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the pending alerts cannot be loaded.
    pub async fn flush_digests(
        &self,
        frequency: DeliveryFrequency,
        now: DateTime<Utc>,
    ) -> Result<DigestSummary, StoreError> {
        let pending = self.stores.alerts.pending_alerts(frequency).await?;
        let mut by_phone: BTreeMap<String, Vec<FishAlert>> = BTreeMap::new();
        for alert in pending {
            by_phone.entry(alert.phone.clone()).or_default().push(alert);
        }

        let mut catches: HashMap<CatchId, Option<FishCatch>> = HashMap::new();
        let mut summary = DigestSummary::default();
        for (phone, alerts) in by_phone {
            let mut listed: Vec<(FishAlert, FishCatch)> = Vec::new();
            for alert in alerts {
                let catch = match catches.get(&alert.catch_id) {
                    Some(cached) => cached.clone(),
                    None => {
                        let loaded = self.stores.catches.catch_by_id(alert.catch_id).await?;
                        catches.insert(alert.catch_id, loaded.clone());
                        loaded
                    }
                };
                match catch.filter(|c| c.is_open_at(now)) {
                    Some(catch) if listed.len() < MAX_LIST_ROWS => listed.push((alert, catch)),
                    Some(_) => {}
                    None => {
                        self.stores
                            .alerts
                            .mark_alert_failed(alert.id, now, CATCH_UNAVAILABLE)
                            .await?;
                        summary.unavailable = summary.unavailable.saturating_add(1);
                    }
                }
            }
            if listed.is_empty() {
                continue;
            }

            let rows = listed
                .iter()
                .map(|(_, c)| {
                    let detail = format!("{}/kg · {:.0} kg", format_rupees(c.price_per_kg), c.quantity_kg);
                    ListRow::new(Shortcut::ViewCatch(c.id).id(), &fish_label(c.fish_type), Some(&detail))
                })
                .collect();
            let message = OutboundMessage::list(
                &phone,
                format!("🐟 {} fresh catch(es) near you matched your alerts.", listed.len()),
                "View catches",
                frequency.label(),
                rows,
            );

            // The outbound sender records the result on every listed alert.
            let ids = listed.iter().map(|(alert, _)| alert.id).collect();
            match self.outbound.deliver_digest(message, ids).await {
                Delivery::Sent(_) => {
                    summary.subscribers = summary.subscribers.saturating_add(1);
                    summary.listed = summary.listed.saturating_add(listed.len());
                }
                // Alerts stay pending until the queued digest is sent.
                Delivery::Deferred(_) => {
                    summary.deferred = summary.deferred.saturating_add(listed.len());
                }
                Delivery::Failed(_) => {
                    summary.failed = summary.failed.saturating_add(listed.len());
                }
            }
        }

        tracing::info!(
            frequency = frequency.as_str(),
            subscribers = summary.subscribers,
            listed = summary.listed,
            unavailable = summary.unavailable,
            failed = summary.failed,
            "digest sweep finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::alerts::engine::tests::{fixture, fixture_with_limits, point, post_catch, subscribe};
    use crate::dispatch::{Job, JobQueue, OutboundLimits};
    use crate::domain::{CatchStatus, FishTypeFilter};
    use crate::messaging::OutboundBody;
    use crate::persistence::CatchStore;

    #[tokio::test]
    async fn digest_groups_alerts_and_drops_unavailable_catches() {
        let f = fixture();
        let here = point(9.9312, 76.2673);
        subscribe(&f, "9101", here, 20.0, FishTypeFilter::All, DeliveryFrequency::TwiceDaily).await;
        let a = post_catch(&f, "9500", 1, Some(point(9.95, 76.25))).await;
        let b = post_catch(&f, "9501", 2, Some(point(9.92, 76.28))).await;
        let gone = post_catch(&f, "9502", 4, Some(point(9.94, 76.26))).await;
        for c in [&a, &b, &gone] {
            let _ = f.engine.process_new_catch(c.id).await;
        }
        let _ = f.store.set_catch_status(gone.id, CatchStatus::SoldOut).await;
        assert!(f.messenger.sent().is_empty(), "twice-daily alerts wait for the sweep");

        let Ok(summary) = f.engine.flush_digests(DeliveryFrequency::TwiceDaily, Utc::now()).await else {
            panic!("sweep failed");
        };
        assert_eq!(summary, DigestSummary { subscribers: 1, listed: 2, unavailable: 1, failed: 0, deferred: 0 });

        let sent = f.messenger.sent_to("9101");
        let [digest] = sent.as_slice() else {
            panic!("exactly one digest expected");
        };
        let OutboundBody::List { sections, .. } = &digest.body else {
            panic!("digest should be a list");
        };
        assert_eq!(sections.iter().map(|s| s.rows.len()).sum::<usize>(), 2);

        let alerts = f.store.all_alerts().await;
        let failed: Vec<_> = alerts.iter().filter(|a| a.failed_at.is_some()).collect();
        let [failed] = failed.as_slice() else {
            panic!("one failed alert expected");
        };
        assert_eq!(failed.catch_id, gone.id);
        assert_eq!(failed.failure_reason.as_deref(), Some(CATCH_UNAVAILABLE));
        assert_eq!(alerts.iter().filter(|a| a.sent_at.is_some()).count(), 2);
    }

    #[tokio::test]
    async fn second_sweep_sends_nothing() {
        let f = fixture();
        subscribe(&f, "9102", point(9.9312, 76.2673), 20.0, FishTypeFilter::All, DeliveryFrequency::MorningOnly).await;
        let c = post_catch(&f, "9500", 1, Some(point(9.95, 76.25))).await;
        let _ = f.engine.process_new_catch(c.id).await;
        let _ = f.engine.flush_digests(DeliveryFrequency::MorningOnly, Utc::now()).await;
        let Ok(again) = f.engine.flush_digests(DeliveryFrequency::MorningOnly, Utc::now()).await else {
            panic!("sweep failed");
        };
        assert_eq!(again, DigestSummary::default());
        assert_eq!(f.messenger.sent_to("9102").len(), 1);
    }

    #[tokio::test]
    async fn sweep_only_touches_its_frequency() {
        let f = fixture();
        subscribe(&f, "9103", point(9.9312, 76.2673), 20.0, FishTypeFilter::All, DeliveryFrequency::WeeklyDigest).await;
        let c = post_catch(&f, "9500", 1, Some(point(9.95, 76.25))).await;
        let _ = f.engine.process_new_catch(c.id).await;
        let Ok(summary) = f.engine.flush_digests(DeliveryFrequency::MorningOnly, Utc::now()).await else {
            panic!("sweep failed");
        };
        assert_eq!(summary, DigestSummary::default());
        assert!(f.store.all_alerts().await.iter().all(FishAlert::is_pending));
    }

    #[tokio::test]
    async fn deferred_digest_settles_its_alerts_when_finally_sent() {
        tokio::time::pause();
        // One broadcast per second: the first digest goes out, the rest queue.
        let f = fixture_with_limits(OutboundLimits::new(1_000, 1_000, 1));
        let here = point(9.9312, 76.2673);
        for phone in ["9104", "9105", "9106"] {
            subscribe(&f, phone, here, 20.0, FishTypeFilter::All, DeliveryFrequency::TwiceDaily).await;
        }
        let c = post_catch(&f, "9500", 1, Some(point(9.95, 76.25))).await;
        let _ = f.engine.process_new_catch(c.id).await;

        let Ok(summary) = f.engine.flush_digests(DeliveryFrequency::TwiceDaily, Utc::now()).await else {
            panic!("sweep failed");
        };
        assert_eq!(summary, DigestSummary { subscribers: 1, listed: 1, deferred: 2, ..DigestSummary::default() });
        let alert_of = |alerts: &[FishAlert], phone: &str| alerts.iter().find(|a| a.phone == phone).cloned();
        let alerts = f.store.all_alerts().await;
        for phone in ["9105", "9106"] {
            let Some(alert) = alert_of(&alerts, phone) else {
                panic!("alert for {phone} missing");
            };
            assert!(alert.is_pending(), "queued digest must not stamp {phone}");
        }

        f.messenger.fail_for("9106");
        loop {
            tokio::time::advance(Duration::from_secs(2)).await;
            let Ok(Some(claimed)) = f.queue.dequeue().await else {
                break;
            };
            let Job::Send { message, lane, alert_ids } = claimed.job else {
                panic!("send job expected");
            };
            assert_eq!(alert_ids.len(), 1);
            let _ = f.outbound.deliver_tracked(message, lane, alert_ids).await;
            let _ = f.queue.ack(claimed.id).await;
        }

        let alerts = f.store.all_alerts().await;
        let (Some(sent), Some(failed)) = (alert_of(&alerts, "9105"), alert_of(&alerts, "9106")) else {
            panic!("alerts missing");
        };
        assert!(sent.sent_at.is_some());
        assert!(sent.provider_message_id.is_some());
        assert!(failed.failed_at.is_some());
        assert!(failed.sent_at.is_none());
    }
}
