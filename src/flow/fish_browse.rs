//! Buyer browses open catches near a location, opens one, and can tell
//! the seller they are coming. Alert and catch buttons from broadcasts
//! land here too.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::input::{location_of, parse_index};
use super::router::{NAV_MENU, Shortcut};
use super::{
    FlowDeps, FlowError, FlowHandler, FlowSettings, FlowStep, NOT_UNDERSTOOD, Seed, Transition,
    current_step, draft,
};
use crate::dispatch::{Lane, Outbound};
use crate::domain::fish::{fish_label, format_rupees};
use crate::domain::{
    AlertId, CatchId, ComingResponse, FishCatch, FishTypeId, FlowKind, GeoPoint, IncomingMessage,
    Session,
};
use crate::messaging::{Button, ListRow, MAX_LIST_ROWS, OutboundMessage};
use crate::persistence::{AlertStore, CatchStore, StoreError, SubscriptionStore};

flow_steps! {
    enum Step {
        AskLocation => "ask_location",
        PickCatch => "pick_catch",
        CatchDetail => "catch_detail",
    }
}

const BACK: &str = "browse:back";
const GET_ALERTS: &str = "browse:alerts";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Draft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<GeoPoint>,
    #[serde(default)]
    results: Vec<CatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    selected: Option<CatchId>,
}

/// Open catches within `radius_km` of `origin`, nearest first, paired
/// with their distance in km.
///
/// # Errors
///
/// Returns [`StoreError`] if the catch store fails.
pub async fn nearby_catches(
    catches: &dyn CatchStore,
    origin: GeoPoint,
    radius_km: f64,
    fish_type: Option<FishTypeId>,
    exclude: Option<CatchId>,
) -> Result<Vec<(FishCatch, f64)>, StoreError> {
    let area = origin.bounding_box(radius_km);
    let mut found: Vec<(FishCatch, f64)> = catches
        .open_catches_in(&area, fish_type, Utc::now())
        .await?
        .into_iter()
        .filter(|c| Some(c.id) != exclude)
        .filter_map(|c| {
            let d = origin.distance_km(c.location.as_ref()?);
            (d <= radius_km).then_some((c, d))
        })
        .collect();
    found.sort_by(|a, b| a.1.total_cmp(&b.1));
    Ok(found)
}

/// Browsing and buyer responses.
#[derive(Debug)]
pub struct FishBrowseFlow {
    catches: Arc<dyn CatchStore>,
    alerts: Arc<dyn AlertStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    outbound: Arc<Outbound>,
    settings: FlowSettings,
}

impl FishBrowseFlow {
    /// Creates the handler.
    #[must_use]
    pub fn new(deps: &FlowDeps) -> Self {
        Self {
            catches: Arc::clone(&deps.stores.catches),
            alerts: Arc::clone(&deps.stores.alerts),
            subscriptions: Arc::clone(&deps.stores.subscriptions),
            outbound: Arc::clone(&deps.outbound),
            settings: deps.settings,
        }
    }

    async fn ask_location(&self, phone: &str) -> Transition {
        self.outbound
            .reply(OutboundMessage::location_request(
                phone,
                "Share your location and we'll show fresh catches nearby.",
            ))
            .await;
        Transition::goto(Step::AskLocation, &Draft::default())
    }

    async fn search(&self, phone: &str, origin: GeoPoint) -> Result<Transition, FlowError> {
        let radius = self.settings.default_search_radius_km;
        let mut found = nearby_catches(self.catches.as_ref(), origin, radius, None, None).await?;
        found.truncate(MAX_LIST_ROWS);
        let next = Draft {
            location: Some(origin),
            results: found.iter().map(|(c, _)| c.id).collect(),
            selected: None,
        };

        if found.is_empty() {
            self.outbound
                .reply(OutboundMessage::buttons(
                    phone,
                    format!("No fresh catches within {radius} km right now."),
                    vec![
                        Button::new(GET_ALERTS, "Alert me"),
                        Button::new(NAV_MENU, "Main menu"),
                    ],
                ))
                .await;
            return Ok(Transition::goto(Step::PickCatch, &next));
        }

        let rows = found
            .iter()
            .map(|(c, d)| {
                let detail = format!("{}/kg · {d:.1} km", format_rupees(c.price_per_kg));
                ListRow::new(Shortcut::ViewCatch(c.id).id(), &fish_label(c.fish_type), Some(&detail))
            })
            .collect();
        self.outbound
            .reply(OutboundMessage::list(
                phone,
                format!("{} catch(es) within {radius} km. Pick one to see details.", found.len()),
                "View catches",
                "Nearby",
                rows,
            ))
            .await;
        Ok(Transition::goto(Step::PickCatch, &next))
    }

    async fn show_detail(
        &self,
        phone: &str,
        id: CatchId,
        from: Option<GeoPoint>,
    ) -> Result<Transition, FlowError> {
        let Some(catch) = self
            .catches
            .catch_by_id(id)
            .await?
            .filter(|c| c.is_open_at(Utc::now()))
        else {
            self.outbound
                .reply(OutboundMessage::text(phone, "Sorry, that catch is no longer available."))
                .await;
            return Ok(Transition::Complete);
        };

        if let Some(photo) = &catch.photo {
            self.outbound
                .reply(OutboundMessage::image(phone, photo.id.clone(), Some(fish_label(catch.fish_type))))
                .await;
        }
        if let Some(at) = catch.location {
            self.outbound
                .reply(OutboundMessage::location(phone, at, Some(fish_label(catch.fish_type))))
                .await;
        }
        let distance = match (from, catch.location) {
            (Some(a), Some(b)) => format!("\n📍 {:.1} km away", a.distance_km(&b)),
            _ => String::new(),
        };
        let coming = if catch.customers_coming > 0 {
            format!("\n🛒 {} buyer(s) on the way", catch.customers_coming)
        } else {
            String::new()
        };
        self.outbound
            .reply(OutboundMessage::buttons(
                phone,
                format!(
                    "{}{distance}{coming}\nSeller: +{}",
                    catch.headline(),
                    catch.seller_phone
                ),
                vec![
                    Button::new(Shortcut::Coming(catch.id).id(), "I'm coming"),
                    Button::new(BACK, "Back to list"),
                    Button::new(NAV_MENU, "Main menu"),
                ],
            ))
            .await;
        let next = Draft {
            location: from,
            results: Vec::new(),
            selected: Some(catch.id),
        };
        Ok(Transition::goto(Step::CatchDetail, &next))
    }

    async fn alert_click(&self, phone: &str, id: AlertId) -> Result<Transition, FlowError> {
        let Some(alert) = self.alerts.alert_by_id(id).await?.filter(|a| a.phone == phone) else {
            self.outbound
                .reply(OutboundMessage::text(phone, "Sorry, that alert has expired."))
                .await;
            return Ok(Transition::Complete);
        };
        self.alerts.mark_alert_clicked(id, Utc::now()).await?;
        let from = self
            .subscriptions
            .active_subscription_for(phone)
            .await?
            .map(|s| s.location);
        self.show_detail(phone, alert.catch_id, from).await
    }

    async fn coming(&self, phone: &str, id: CatchId) -> Result<Transition, FlowError> {
        let Some(catch) = self
            .catches
            .catch_by_id(id)
            .await?
            .filter(|c| c.is_open_at(Utc::now()))
        else {
            self.outbound
                .reply(OutboundMessage::text(phone, "Sorry, that catch is sold out or no longer listed."))
                .await;
            return Ok(Transition::Complete);
        };
        if catch.seller_phone == phone {
            self.outbound
                .reply(OutboundMessage::text(phone, "That's your own catch."))
                .await;
            return Ok(Transition::Complete);
        }

        let location = self
            .subscriptions
            .active_subscription_for(phone)
            .await?
            .map(|s| s.location);
        let response = ComingResponse {
            catch_id: id,
            phone: phone.to_string(),
            location,
            created_at: Utc::now(),
        };
        if !self.catches.record_coming(&response).await? {
            self.outbound
                .reply(OutboundMessage::text(phone, "You've already told the seller you're coming."))
                .await;
            return Ok(Transition::Complete);
        }
        tracing::info!(buyer = %phone, catch_id = %id, "buyer coming");

        let count = catch.customers_coming.saturating_add(1);
        self.outbound
            .deliver(
                OutboundMessage::text(
                    &catch.seller_phone,
                    format!(
                        "🛒 A buyer (+{phone}) is on the way for your {}. {count} buyer(s) coming so far.",
                        fish_label(catch.fish_type)
                    ),
                ),
                Lane::Conversational,
            )
            .await;
        self.outbound
            .reply(OutboundMessage::text(
                phone,
                format!("👍 We told the seller you're coming. Call +{} if you need directions.", catch.seller_phone),
            ))
            .await;
        if let Some(at) = catch.location {
            self.outbound
                .reply(OutboundMessage::location(phone, at, Some(fish_label(catch.fish_type))))
                .await;
        }
        Ok(Transition::Complete)
    }
}

#[async_trait]
impl FlowHandler for FishBrowseFlow {
    fn kind(&self) -> FlowKind {
        FlowKind::FishBrowse
    }

    fn steps(&self) -> &'static [&'static str] {
        Step::IDS
    }

    async fn start(&self, session: &Session, seed: Option<Seed>) -> Result<Transition, FlowError> {
        let phone = session.phone.as_str();
        match seed {
            Some(Seed::Catch(id)) => {
                let from = self
                    .subscriptions
                    .active_subscription_for(phone)
                    .await?
                    .map(|s| s.location);
                self.show_detail(phone, id, from).await
            }
            Some(Seed::AlertClick(id)) => self.alert_click(phone, id).await,
            Some(Seed::Coming(id)) => self.coming(phone, id).await,
            Some(Seed::Location(at)) => self.search(phone, at).await,
            Some(Seed::AgreementReply { .. }) | None => Ok(self.ask_location(phone).await),
        }
    }

    async fn handle(&self, message: &IncomingMessage, session: &Session) -> Result<Transition, FlowError> {
        let Some(step) = current_step::<Step>(session) else {
            return self.start(session, None).await;
        };
        let phone = session.phone.as_str();
        let state: Draft = draft(session);
        if let Some(at) = location_of(message) {
            return self.search(phone, at).await;
        }
        let choice = message.choice().unwrap_or_default();

        match step {
            Step::AskLocation => {}
            Step::PickCatch => {
                if choice == GET_ALERTS {
                    return Ok(Transition::Handoff {
                        flow: FlowKind::FishAlertSubscribe,
                        seed: state.location.map(Seed::Location),
                    });
                }
                if let Some(id) = parse_index(choice, state.results.len())
                    .and_then(|i| state.results.get(i).copied())
                {
                    return self.show_detail(phone, id, state.location).await;
                }
            }
            Step::CatchDetail => {
                if choice == BACK {
                    return match state.location {
                        Some(at) => self.search(phone, at).await,
                        None => Ok(self.ask_location(phone).await),
                    };
                }
            }
        }
        self.handle_invalid_input(message, session).await
    }

    async fn handle_invalid_input(
        &self,
        _message: &IncomingMessage,
        session: &Session,
    ) -> Result<Transition, FlowError> {
        let phone = session.phone.as_str();
        let state: Draft = draft(session);
        let hint = match current_step::<Step>(session) {
            Some(Step::AskLocation) | None => "Please share a location pin.",
            Some(Step::PickCatch) if state.results.is_empty() => {
                "Tap Alert me to hear about new catches, or share another location."
            }
            Some(Step::PickCatch) => "Pick a catch from the list, or type its number.",
            Some(Step::CatchDetail) => "Tap I'm coming, Back to list, or Main menu.",
        };
        self.outbound
            .reply(OutboundMessage::text(phone, format!("{NOT_UNDERSTOOD} {hint}")))
            .await;
        Ok(Transition::Stay)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{
        CatchStatus, DeliveryFrequency, FishAlert, FishSubscription, FishTypeFilter, Radius,
    };
    use crate::flow::testing::{Harness, point};

    async fn seed_catch(h: &Harness, seller: &str, at: GeoPoint) -> FishCatch {
        let now = Utc::now();
        let catch = FishCatch {
            id: CatchId::new(),
            seller_phone: seller.to_string(),
            fish_type: FishTypeId(1),
            location: Some(at),
            price_per_kg: 18_000,
            quantity_kg: 30.0,
            status: CatchStatus::Available,
            photo: None,
            customers_coming: 0,
            created_at: now,
            expires_at: now + chrono::Duration::hours(6),
        };
        let Ok(()) = h.store.insert_catch(&catch).await else {
            panic!("insert failed");
        };
        catch
    }

    #[tokio::test]
    async fn search_lists_nearby_catches_nearest_first() {
        let h = Harness::new();
        let near = seed_catch(&h, "9601", point(9.9658, 76.2421)).await;
        let far = seed_catch(&h, "9602", point(10.02, 76.30)).await;
        let _out_of_range = seed_catch(&h, "9603", point(11.25, 75.78)).await;

        let Ok(found) = nearby_catches(h.store.as_ref(), point(9.9312, 76.2673), 10.0, None, None).await else {
            panic!("search failed");
        };
        let ids: Vec<CatchId> = found.iter().map(|(c, _)| c.id).collect();
        assert_eq!(ids, vec![near.id, far.id]);
    }

    #[tokio::test]
    async fn browse_pick_and_come() {
        let h = Harness::new();
        let catch = seed_catch(&h, "9611", point(9.9658, 76.2421)).await;
        let mut s = Session::new("9612");
        h.tap(&mut s, "menu:fish_browse").await;
        assert_eq!(s.step(), Some("ask_location"));
        h.say(&mut s, "what").await;
        assert_eq!(s.step(), Some("ask_location"));

        h.share_location(&mut s, point(9.9312, 76.2673)).await;
        assert_eq!(s.step(), Some("pick_catch"));
        h.say(&mut s, "7").await;
        assert_eq!(s.step(), Some("pick_catch"), "index out of range");
        h.say(&mut s, "1").await;
        assert_eq!(s.step(), Some("catch_detail"));
        h.say(&mut s, "hmm").await;
        assert_eq!(s.step(), Some("catch_detail"));

        h.tap(&mut s, &Shortcut::Coming(catch.id).id()).await;
        assert_eq!(s.flow, FlowKind::MainMenu);
        let Ok(Some(stored)) = h.store.catch_by_id(catch.id).await else {
            panic!("catch missing");
        };
        assert_eq!(stored.customers_coming, 1);
        assert!(h.last_text("9611").contains("on the way"));

        h.tap(&mut s, &Shortcut::Coming(catch.id).id()).await;
        let Ok(Some(stored)) = h.store.catch_by_id(catch.id).await else {
            panic!("catch missing");
        };
        assert_eq!(stored.customers_coming, 1, "second tap is not counted");
    }

    #[tokio::test]
    async fn back_from_detail_returns_to_results() {
        let h = Harness::new();
        seed_catch(&h, "9621", point(9.9658, 76.2421)).await;
        let mut s = Session::new("9622");
        h.tap(&mut s, "menu:fish_browse").await;
        h.share_location(&mut s, point(9.9312, 76.2673)).await;
        h.say(&mut s, "1").await;
        h.tap(&mut s, BACK).await;
        assert_eq!(s.step(), Some("pick_catch"));
    }

    #[tokio::test]
    async fn empty_results_hand_off_to_alerts_with_location() {
        let h = Harness::new();
        let mut s = Session::new("9631");
        h.tap(&mut s, "menu:fish_browse").await;
        h.share_location(&mut s, point(9.9312, 76.2673)).await;
        assert_eq!(s.step(), Some("pick_catch"));
        h.tap(&mut s, GET_ALERTS).await;
        assert_eq!(s.flow, FlowKind::FishAlertSubscribe);
        assert_eq!(s.step(), Some("ask_radius"));
    }

    #[tokio::test]
    async fn alert_click_marks_clicked_and_shows_catch() {
        let h = Harness::new();
        let catch = seed_catch(&h, "9641", point(9.9658, 76.2421)).await;
        let Ok(radius) = Radius::new(5.0) else {
            panic!("valid radius");
        };
        let sub = FishSubscription::new(
            "9642",
            point(9.9312, 76.2673),
            radius,
            FishTypeFilter::All,
            DeliveryFrequency::Immediate,
        );
        let _ = h.store.insert_subscription(&sub).await;
        let alert = FishAlert::new(&sub, catch.id);
        let _ = h.store.insert_alert_if_absent(&alert).await;

        let mut s = Session::new("9642");
        h.tap(&mut s, &Shortcut::AlertClick(alert.id).id()).await;
        assert_eq!(s.flow, FlowKind::FishBrowse);
        assert_eq!(s.step(), Some("catch_detail"));
        let Ok(Some(stored)) = h.store.alert_by_id(alert.id).await else {
            panic!("alert missing");
        };
        assert!(stored.clicked_at.is_some());
        assert!(h.last_text("9642").contains("km away"));
    }

    #[tokio::test]
    async fn sold_out_catch_cannot_be_opened() {
        let h = Harness::new();
        let catch = seed_catch(&h, "9651", point(9.9658, 76.2421)).await;
        let _ = h.store.set_catch_status(catch.id, CatchStatus::SoldOut).await;
        let mut s = Session::new("9652");
        h.tap(&mut s, &Shortcut::ViewCatch(catch.id).id()).await;
        assert_eq!(s.flow, FlowKind::MainMenu);
        assert!(h.last_text("9652").contains("no longer available"));
    }
}
