//! Alternatives for buyers whose catch sold out while they were on the
//! way.

use chrono::Utc;

use super::MAX_ALTERNATIVES;
use super::engine::AlertEngine;
use crate::dispatch::Lane;
use crate::domain::fish::{fish_label, format_rupees};
use crate::domain::{CatchId, CatchStatus, FlowKind};
use crate::flow::Shortcut;
use crate::flow::fish_browse::nearby_catches;
use crate::flow::router::NAV_MENU;
use crate::messaging::{Button, ListRow, OutboundMessage};
use crate::persistence::StoreError;

/// Outcome of notifying the buyers of a sold-out catch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoldOutSummary {
    /// Buyers who had said they were coming.
    pub responders: usize,
    /// Buyers offered at least one alternative.
    pub with_alternatives: usize,
    /// Buyers offered alert sign-up instead.
    pub fallback: usize,
}

impl AlertEngine {
    /// Tells every buyer who was coming for `catch_id` that it sold out
    /// and offers up to three open catches of the same species nearby,
    /// nearest first.
    ///
    /// Alternatives are searched within the buyer's subscription radius
    /// (or the default search radius) around the buyer's shared location,
    /// falling back to the sold-out catch's location.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if loading the catch, its responders or
    /// candidate catches fails.
    pub async fn process_sold_out(&self, catch_id: CatchId) -> Result<SoldOutSummary, StoreError> {
        let Some(catch) = self.stores.catches.catch_by_id(catch_id).await? else {
            tracing::warn!(%catch_id, "sold-out catch not found");
            return Ok(SoldOutSummary::default());
        };
        if catch.status != CatchStatus::SoldOut {
            tracing::info!(%catch_id, status = catch.status.as_str(), "catch no longer sold out; skipping");
            return Ok(SoldOutSummary::default());
        }

        let responders = self.stores.catches.coming_responses(catch_id).await?;
        let mut summary = SoldOutSummary {
            responders: responders.len(),
            ..SoldOutSummary::default()
        };
        let label = fish_label(catch.fish_type);

        for response in responders {
            let subscription = self
                .stores
                .subscriptions
                .active_subscription_for(&response.phone)
                .await?;
            let radius_km = subscription
                .as_ref()
                .map_or(self.default_radius_km, |s| s.radius.km());
            let origin = response
                .location
                .or_else(|| subscription.as_ref().map(|s| s.location))
                .or(catch.location);

            let mut alternatives = match origin {
                Some(at) => {
                    nearby_catches(
                        self.stores.catches.as_ref(),
                        at,
                        radius_km,
                        Some(catch.fish_type),
                        Some(catch.id),
                    )
                    .await?
                }
                None => {
                    tracing::warn!(%catch_id, buyer = %response.phone, "no location to search alternatives from");
                    Vec::new()
                }
            };
            alternatives.truncate(MAX_ALTERNATIVES);

            let message = if alternatives.is_empty() {
                summary.fallback = summary.fallback.saturating_add(1);
                OutboundMessage::buttons(
                    &response.phone,
                    format!("😔 The {label} you were going for just sold out. Want an alert when fresh {label} lands nearby?"),
                    vec![
                        Button::new(Shortcut::Open(FlowKind::FishAlertSubscribe).id(), "Get alerts"),
                        Button::new(NAV_MENU, "Main menu"),
                    ],
                )
            } else {
                summary.with_alternatives = summary.with_alternatives.saturating_add(1);
                let rows = alternatives
                    .iter()
                    .map(|(c, d)| {
                        let detail = format!("{}/kg · {d:.1} km", format_rupees(c.price_per_kg));
                        ListRow::new(Shortcut::ViewCatch(c.id).id(), &fish_label(c.fish_type), Some(&detail))
                    })
                    .collect();
                OutboundMessage::list(
                    &response.phone,
                    format!("😔 The {label} you were going for just sold out. These are still available nearby:"),
                    "See catches",
                    "Alternatives",
                    rows,
                )
            };
            self.outbound.deliver(message, Lane::Broadcast).await;
        }

        tracing::info!(
            %catch_id,
            responders = summary.responders,
            with_alternatives = summary.with_alternatives,
            fallback = summary.fallback,
            "sold-out notifications sent"
        );
        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::alerts::engine::tests::{fixture, point, post_catch};
    use crate::domain::ComingResponse;
    use crate::messaging::OutboundBody;
    use crate::persistence::CatchStore;

    async fn coming(f: &crate::alerts::engine::tests::Fixture, catch: CatchId, phone: &str, lat: f64, lon: f64) {
        let response = ComingResponse {
            catch_id: catch,
            phone: phone.to_string(),
            location: Some(point(lat, lon)),
            created_at: Utc::now(),
        };
        let Ok(true) = f.store.record_coming(&response).await else {
            panic!("response should be recorded");
        };
    }

    #[tokio::test]
    async fn buyers_get_nearest_alternatives_or_fallback() {
        let f = fixture();
        let sold = post_catch(&f, "9500", 1, Some(point(9.95, 76.25))).await;
        let near = post_catch(&f, "9501", 1, Some(point(9.951, 76.251))).await;
        let mid = post_catch(&f, "9502", 1, Some(point(9.96, 76.26))).await;
        let far = post_catch(&f, "9503", 1, Some(point(9.97, 76.27))).await;
        let farthest = post_catch(&f, "9504", 1, Some(point(9.98, 76.28))).await;
        let _other_species = post_catch(&f, "9505", 2, Some(point(9.95, 76.25))).await;

        coming(&f, sold.id, "9201", 9.95, 76.25).await;
        // Far away from every catch: nothing within the default radius.
        coming(&f, sold.id, "9202", 11.25, 75.78).await;
        let _ = f.store.set_catch_status(sold.id, CatchStatus::SoldOut).await;

        let Ok(summary) = f.engine.process_sold_out(sold.id).await else {
            panic!("sold-out processing failed");
        };
        assert_eq!(summary, SoldOutSummary { responders: 2, with_alternatives: 1, fallback: 1 });

        let Some(offer) = f.messenger.sent_to("9201").pop() else {
            panic!("buyer should be notified");
        };
        let OutboundBody::List { sections, .. } = offer.body else {
            panic!("expected a list of alternatives");
        };
        let ids: Vec<String> = sections.into_iter().flat_map(|s| s.rows).map(|r| r.id).collect();
        assert_eq!(
            ids,
            vec![
                Shortcut::ViewCatch(near.id).id(),
                Shortcut::ViewCatch(mid.id).id(),
                Shortcut::ViewCatch(far.id).id(),
            ]
        );
        assert!(!ids.contains(&Shortcut::ViewCatch(farthest.id).id()));

        let Some(fallback) = f.messenger.sent_to("9202").pop() else {
            panic!("buyer should be notified");
        };
        assert!(matches!(fallback.body, OutboundBody::Buttons { .. }));
    }

    #[tokio::test]
    async fn three_buyers_two_alternatives_get_three_lists() {
        let f = fixture();
        let sold = post_catch(&f, "9510", 3, Some(point(9.93, 76.26))).await;
        let closer = post_catch(&f, "9511", 3, Some(point(9.935, 76.265))).await;
        let further = post_catch(&f, "9512", 3, Some(point(9.95, 76.27))).await;
        for buyer in ["9211", "9212", "9213"] {
            coming(&f, sold.id, buyer, 9.93, 76.26).await;
        }
        let _ = f.store.set_catch_status(sold.id, CatchStatus::SoldOut).await;

        let Ok(summary) = f.engine.process_sold_out(sold.id).await else {
            panic!("sold-out processing failed");
        };
        assert_eq!(summary, SoldOutSummary { responders: 3, with_alternatives: 3, fallback: 0 });
        assert_eq!(f.messenger.sent().len(), 3);

        for buyer in ["9211", "9212", "9213"] {
            let sent = f.messenger.sent_to(buyer);
            assert_eq!(sent.len(), 1);
            let Some(OutboundBody::List { sections, .. }) = sent.into_iter().next().map(|m| m.body) else {
                panic!("expected a list of alternatives");
            };
            let ids: Vec<String> = sections.into_iter().flat_map(|s| s.rows).map(|r| r.id).collect();
            assert_eq!(ids, vec![Shortcut::ViewCatch(closer.id).id(), Shortcut::ViewCatch(further.id).id()]);
        }
    }

    #[tokio::test]
    async fn catch_back_in_stock_is_skipped() {
        let f = fixture();
        let c = post_catch(&f, "9500", 1, Some(point(9.95, 76.25))).await;
        coming(&f, c.id, "9203", 9.95, 76.25).await;
        let Ok(summary) = f.engine.process_sold_out(c.id).await else {
            panic!("sold-out processing failed");
        };
        assert_eq!(summary, SoldOutSummary::default());
        assert!(f.messenger.sent().is_empty());
    }
}
