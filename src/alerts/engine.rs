//! Fan-out of a newly posted catch to matching subscribers.

use std::sync::Arc;

use chrono::Utc;

use crate::dispatch::{Delivery, Outbound};
use crate::domain::fish::fish_label;
use crate::domain::{CatchId, DeliveryFrequency, FishAlert, FishCatch, Radius};
use crate::flow::Shortcut;
use crate::messaging::{Button, OutboundMessage};
use crate::persistence::{StoreError, Stores};

/// Outcome of matching one catch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchSummary {
    /// Subscriptions whose area and species filter matched.
    pub total_subscribers: usize,
    /// Immediate alerts sent now.
    pub sent: usize,
    /// Immediate alerts the provider rejected.
    pub failed: usize,
    /// Alerts waiting for a digest or a rate-limited retry.
    pub pending: usize,
}

/// Matches catches to subscriptions and sends the resulting alerts.
#[derive(Debug, Clone)]
pub struct AlertEngine {
    pub(crate) stores: Stores,
    pub(crate) outbound: Arc<Outbound>,
    pub(crate) default_radius_km: f64,
}

impl AlertEngine {
    /// Creates an engine. `default_radius_km` bounds the search for
    /// sold-out alternatives when a buyer has no subscription.
    #[must_use]
    pub fn new(stores: Stores, outbound: Arc<Outbound>, default_radius_km: f64) -> Self {
        Self {
            stores,
            outbound,
            default_radius_km,
        }
    }

    /// Creates alerts for every listening subscription that matches
    /// `catch_id` and sends the immediate ones.
    ///
    /// Re-running for the same catch sends nothing new: alerts are
    /// inserted only if absent per (subscription, catch).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if loading the catch or candidates fails.
    pub async fn process_new_catch(&self, catch_id: CatchId) -> Result<MatchSummary, StoreError> {
        let Some(catch) = self.stores.catches.catch_by_id(catch_id).await? else {
            tracing::warn!(%catch_id, "catch vanished before matching");
            return Ok(MatchSummary::default());
        };
        if !catch.is_open_at(Utc::now()) {
            tracing::info!(%catch_id, status = catch.status.as_str(), "catch closed before matching");
            return Ok(MatchSummary::default());
        }
        let Some(at) = catch.location else {
            tracing::warn!(%catch_id, "catch has no coordinates; skipping alerts");
            return Ok(MatchSummary::default());
        };

        // Every subscription radius is at most MAX_KM, so this box holds
        // every candidate.
        let area = at.bounding_box(Radius::MAX_KM);
        let candidates = self.stores.subscriptions.listening_subscriptions_in(&area).await?;

        let mut summary = MatchSummary::default();
        for sub in candidates {
            if sub.phone == catch.seller_phone {
                continue;
            }
            let Some(distance) = sub.match_distance(&catch) else {
                continue;
            };
            summary.total_subscribers = summary.total_subscribers.saturating_add(1);

            let alert = FishAlert::new(&sub, catch.id);
            match self.stores.alerts.insert_alert_if_absent(&alert).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(subscription_id = %sub.id, %catch_id, "alert already exists");
                    continue;
                }
                Err(e) => {
                    tracing::error!(subscription_id = %sub.id, %catch_id, error = %e, "alert insert failed");
                    summary.failed = summary.failed.saturating_add(1);
                    continue;
                }
            }

            if sub.frequency != DeliveryFrequency::Immediate {
                summary.pending = summary.pending.saturating_add(1);
                continue;
            }
            match self
                .outbound
                .deliver_alert(alert_message(&alert, &catch, distance), alert.id)
                .await
            {
                Delivery::Sent(_) => summary.sent = summary.sent.saturating_add(1),
                Delivery::Deferred(_) => summary.pending = summary.pending.saturating_add(1),
                Delivery::Failed(_) => summary.failed = summary.failed.saturating_add(1),
            }
        }

        tracing::info!(
            %catch_id,
            matched = summary.total_subscribers,
            sent = summary.sent,
            failed = summary.failed,
            pending = summary.pending,
            "catch fan-out finished"
        );
        Ok(summary)
    }
}

fn alert_message(alert: &FishAlert, catch: &FishCatch, distance_km: f64) -> OutboundMessage {
    OutboundMessage::buttons(
        &alert.phone,
        format!("{}\n📍 {distance_km:.1} km from you", catch.headline()),
        vec![
            Button::new(Shortcut::AlertClick(alert.id).id(), "View"),
            Button::new(Shortcut::Coming(catch.id).id(), "I'm coming"),
        ],
    )
    .with_header(format!("🐟 Fresh {}", fish_label(catch.fish_type)))
}

#[cfg(test)]
#[allow(clippy::panic)]
pub(crate) mod tests {
    use chrono::Duration;

    use super::*;
    use crate::dispatch::{Job, JobQueue, MemoryJobQueue, OutboundLimits};
    use crate::domain::{CatchStatus, FishSubscription, FishTypeFilter, FishTypeId, GeoPoint};
    use crate::messaging::{Messenger, RecordingMessenger};
    use crate::persistence::memory::MemoryStore;
    use crate::persistence::{CatchStore, SubscriptionStore};

    pub(crate) struct Fixture {
        pub engine: AlertEngine,
        pub outbound: Arc<Outbound>,
        pub store: Arc<MemoryStore>,
        pub messenger: Arc<RecordingMessenger>,
        pub queue: Arc<MemoryJobQueue>,
    }

    pub(crate) fn fixture_with_limits(limits: OutboundLimits) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let messenger = Arc::new(RecordingMessenger::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let stores = Stores::memory(&store);
        let outbound = Arc::new(Outbound::new(
            Arc::clone(&messenger) as Arc<dyn Messenger>,
            Arc::new(limits),
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::clone(&stores.alerts),
        ));
        Fixture {
            engine: AlertEngine::new(stores, Arc::clone(&outbound), 10.0),
            outbound,
            store,
            messenger,
            queue,
        }
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with_limits(OutboundLimits::new(1_000, 1_000, 1_000))
    }

    pub(crate) fn point(lat: f64, lon: f64) -> GeoPoint {
        let Ok(p) = GeoPoint::new(lat, lon) else {
            panic!("valid coordinates");
        };
        p
    }

    pub(crate) async fn subscribe(
        f: &Fixture,
        phone: &str,
        at: GeoPoint,
        radius_km: f64,
        fish: FishTypeFilter,
        frequency: DeliveryFrequency,
    ) -> FishSubscription {
        let Ok(radius) = Radius::new(radius_km) else {
            panic!("valid radius");
        };
        let sub = FishSubscription::new(phone, at, radius, fish, frequency);
        let Ok(()) = f.store.insert_subscription(&sub).await else {
            panic!("insert subscription");
        };
        sub
    }

    pub(crate) async fn post_catch(f: &Fixture, seller: &str, fish: i32, at: Option<GeoPoint>) -> FishCatch {
        let now = Utc::now();
        let catch = FishCatch {
            id: CatchId::new(),
            seller_phone: seller.to_string(),
            fish_type: FishTypeId(fish),
            location: at,
            price_per_kg: 25_000,
            quantity_kg: 40.0,
            status: CatchStatus::Available,
            photo: None,
            customers_coming: 0,
            created_at: now,
            expires_at: now + Duration::hours(12),
        };
        let Ok(()) = f.store.insert_catch(&catch).await else {
            panic!("insert catch");
        };
        catch
    }

    const KOCHI: (f64, f64) = (9.9312, 76.2673);

    #[tokio::test]
    async fn immediate_subscriber_within_radius_gets_alert() {
        let f = fixture();
        let sub = subscribe(
            &f,
            "9001",
            point(KOCHI.0, KOCHI.1),
            10.0,
            FishTypeFilter::All,
            DeliveryFrequency::Immediate,
        )
        .await;
        // ~4 km away.
        let catch = post_catch(&f, "9500", 1, Some(point(9.9658, 76.2421))).await;

        let Ok(summary) = f.engine.process_new_catch(catch.id).await else {
            panic!("matching failed");
        };
        assert_eq!(summary, MatchSummary { total_subscribers: 1, sent: 1, failed: 0, pending: 0 });
        assert_eq!(f.messenger.sent_to("9001").len(), 1);

        let alerts = f.store.all_alerts().await;
        let [alert] = alerts.as_slice() else {
            panic!("one alert expected");
        };
        assert_eq!(alert.subscription_id, sub.id);
        assert!(alert.sent_at.is_some());
        assert!(alert.provider_message_id.is_some());
    }

    // About 2.5 km apart.
    const HOME: (f64, f64) = (9.93, 76.26);
    const LANDING: (f64, f64) = (9.95, 76.27);

    #[tokio::test]
    async fn catch_inside_five_km_alerts_once() {
        let f = fixture();
        let home = point(HOME.0, HOME.1);
        let sub = subscribe(&f, "9010", home, 5.0, FishTypeFilter::All, DeliveryFrequency::Immediate).await;
        let catch = post_catch(&f, "9510", 1, Some(point(LANDING.0, LANDING.1))).await;

        let Ok(summary) = f.engine.process_new_catch(catch.id).await else {
            panic!("matching failed");
        };
        assert_eq!(summary.sent, 1);
        let alerts = f.store.all_alerts().await;
        let [alert] = alerts.as_slice() else {
            panic!("exactly one alert expected, got {}", alerts.len());
        };
        assert_eq!(alert.subscription_id, sub.id);
        assert_eq!(alert.catch_id, catch.id);
        assert!(alert.sent_at.is_some());
        assert_eq!(f.messenger.sent_to("9010").len(), 1);
    }

    #[tokio::test]
    async fn catch_outside_two_km_records_nothing() {
        let f = fixture();
        let home = point(HOME.0, HOME.1);
        let _ = subscribe(&f, "9011", home, 2.0, FishTypeFilter::All, DeliveryFrequency::Immediate).await;
        let catch = post_catch(&f, "9511", 1, Some(point(LANDING.0, LANDING.1))).await;

        let Ok(summary) = f.engine.process_new_catch(catch.id).await else {
            panic!("matching failed");
        };
        assert_eq!(summary, MatchSummary::default());
        assert!(f.store.all_alerts().await.is_empty());
        assert!(f.messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn rerun_does_not_send_twice() {
        let f = fixture();
        subscribe(&f, "9002", point(KOCHI.0, KOCHI.1), 10.0, FishTypeFilter::All, DeliveryFrequency::Immediate).await;
        let catch = post_catch(&f, "9500", 1, Some(point(9.9658, 76.2421))).await;
        let _ = f.engine.process_new_catch(catch.id).await;
        let Ok(again) = f.engine.process_new_catch(catch.id).await else {
            panic!("matching failed");
        };
        assert_eq!(again.sent, 0);
        assert_eq!(f.messenger.sent_to("9002").len(), 1);
    }

    #[tokio::test]
    async fn species_filter_radius_and_seller_are_respected() {
        let f = fixture();
        let here = point(KOCHI.0, KOCHI.1);
        let Ok(only_prawns) = FishTypeFilter::only([FishTypeId(3)]) else {
            panic!("valid filter");
        };
        subscribe(&f, "9003", here, 10.0, only_prawns, DeliveryFrequency::Immediate).await;
        subscribe(&f, "9004", here, 1.0, FishTypeFilter::All, DeliveryFrequency::Immediate).await;
        subscribe(&f, "9500", here, 10.0, FishTypeFilter::All, DeliveryFrequency::Immediate).await;

        let catch = post_catch(&f, "9500", 1, Some(point(9.9658, 76.2421))).await;
        let Ok(summary) = f.engine.process_new_catch(catch.id).await else {
            panic!("matching failed");
        };
        assert_eq!(summary.total_subscribers, 0);
        assert!(f.messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn radius_boundary_is_inclusive_and_exact() {
        let f = fixture();
        let here = point(0.0, 0.0);
        // One degree of longitude on the equator is ~111.2 km, so 0.09°
        // is just above 10 km and 0.089° just below.
        subscribe(&f, "9005", here, 10.0, FishTypeFilter::All, DeliveryFrequency::Immediate).await;
        let outside = post_catch(&f, "9500", 1, Some(point(0.0, 0.09))).await;
        let inside = post_catch(&f, "9501", 1, Some(point(0.0, 0.089))).await;

        let Ok(out) = f.engine.process_new_catch(outside.id).await else {
            panic!("matching failed");
        };
        let Ok(inn) = f.engine.process_new_catch(inside.id).await else {
            panic!("matching failed");
        };
        assert_eq!(out.total_subscribers, 0);
        assert_eq!(inn.total_subscribers, 1);
    }

    #[tokio::test]
    async fn batched_frequencies_stay_pending() {
        let f = fixture();
        subscribe(&f, "9006", point(KOCHI.0, KOCHI.1), 10.0, FishTypeFilter::All, DeliveryFrequency::MorningOnly).await;
        let catch = post_catch(&f, "9500", 1, Some(point(9.9658, 76.2421))).await;
        let Ok(summary) = f.engine.process_new_catch(catch.id).await else {
            panic!("matching failed");
        };
        assert_eq!(summary.pending, 1);
        assert!(f.messenger.sent().is_empty());
        assert!(f.store.all_alerts().await.iter().all(FishAlert::is_pending));
    }

    #[tokio::test]
    async fn catch_without_coordinates_matches_nobody() {
        let f = fixture();
        subscribe(&f, "9007", point(KOCHI.0, KOCHI.1), 50.0, FishTypeFilter::All, DeliveryFrequency::Immediate).await;
        let catch = post_catch(&f, "9500", 1, None).await;
        let Ok(summary) = f.engine.process_new_catch(catch.id).await else {
            panic!("matching failed");
        };
        assert_eq!(summary, MatchSummary::default());
    }

    #[tokio::test]
    async fn rate_limited_alerts_are_deferred_not_dropped() {
        let f = fixture_with_limits(OutboundLimits::new(1_000, 1_000, 2));
        for i in 0..5 {
            subscribe(
                &f,
                &format!("91{i}"),
                point(KOCHI.0, KOCHI.1),
                10.0,
                FishTypeFilter::All,
                DeliveryFrequency::Immediate,
            )
            .await;
        }
        let catch = post_catch(&f, "9500", 1, Some(point(9.9658, 76.2421))).await;
        let Ok(summary) = f.engine.process_new_catch(catch.id).await else {
            panic!("matching failed");
        };
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.pending, 3);
        let deferred = f
            .queue
            .snapshot()
            .await
            .into_iter()
            .filter(|j| matches!(j, Job::Send { alert_ids, .. } if alert_ids.len() == 1))
            .count();
        assert_eq!(deferred, 3);
    }
}
