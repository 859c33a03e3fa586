//! Seller posts a catch. Confirming it enqueues alert fan-out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::input::{
    CONFIRM_EDIT, CONFIRM_YES, is_affirmative, location_of, parse_fish_type, parse_number,
    parse_rupees,
};
use super::router::NAV_CANCEL;
use super::{
    FlowDeps, FlowError, FlowHandler, FlowSettings, FlowStep, NOT_UNDERSTOOD, Seed, Transition,
    current_step, draft,
};
use crate::dispatch::{Job, JobQueue, Outbound};
use crate::domain::fish::{FISH_TYPES, fish_label, format_rupees};
use crate::domain::{
    CatchId, CatchStatus, FishCatch, FishTypeId, FlowKind, GeoPoint, IncomingMessage, MediaRef,
    MessageKind, Session,
};
use crate::messaging::{Button, ListRow, OutboundMessage};
use crate::persistence::CatchStore;

flow_steps! {
    enum Step {
        AskFishType => "ask_fish_type",
        AskQuantity => "ask_quantity",
        AskPrice => "ask_price",
        AskLocation => "ask_location",
        AskPhoto => "ask_photo",
        Confirm => "confirm",
    }
}

const MAX_QUANTITY_KG: f64 = 100_000.0;
const SKIP_PHOTO: &str = "photo:skip";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Draft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fish_type: Option<FishTypeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quantity_kg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    price_per_kg: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    photo: Option<MediaRef>,
}

/// Catch posting.
#[derive(Debug)]
pub struct FishSellFlow {
    catches: Arc<dyn CatchStore>,
    queue: Arc<dyn JobQueue>,
    outbound: Arc<Outbound>,
    settings: FlowSettings,
}

impl FishSellFlow {
    /// Creates the handler.
    #[must_use]
    pub fn new(deps: &FlowDeps) -> Self {
        Self {
            catches: Arc::clone(&deps.stores.catches),
            queue: Arc::clone(&deps.queue),
            outbound: Arc::clone(&deps.outbound),
            settings: deps.settings,
        }
    }

    async fn prompt(&self, phone: &str, step: Step, draft: &Draft) {
        let message = match step {
            Step::AskFishType => OutboundMessage::list(
                phone,
                "What did you catch?",
                "Choose fish",
                "Fish",
                FISH_TYPES
                    .iter()
                    .map(|t| ListRow::new(format!("fish:{}", t.id), t.name, Some(t.local_name)))
                    .collect(),
            ),
            Step::AskQuantity => OutboundMessage::text(phone, "How many kg do you have? (e.g. 25)"),
            Step::AskPrice => OutboundMessage::text(phone, "Price per kg in ₹? (e.g. 180)"),
            Step::AskLocation => OutboundMessage::location_request(
                phone,
                "Where can buyers collect it? Share a location pin.",
            ),
            Step::AskPhoto => OutboundMessage::buttons(
                phone,
                "Send a photo of the catch, it helps buyers decide.",
                vec![Button::new(SKIP_PHOTO, "Skip photo")],
            ),
            Step::Confirm => OutboundMessage::buttons(
                phone,
                format!(
                    "Post {} kg of {} at {}/kg{}?",
                    draft.quantity_kg.unwrap_or_default(),
                    draft.fish_type.map(fish_label).unwrap_or_default(),
                    format_rupees(draft.price_per_kg.unwrap_or_default()),
                    if draft.photo.is_some() { " with photo" } else { "" }
                ),
                vec![
                    Button::new(CONFIRM_YES, "Post it"),
                    Button::new(CONFIRM_EDIT, "Change"),
                    Button::new(NAV_CANCEL, "Cancel"),
                ],
            ),
        };
        self.outbound.reply(message).await;
    }

    async fn advance(&self, phone: &str, step: Step, draft: &Draft) -> Transition {
        self.prompt(phone, step, draft).await;
        Transition::goto(step, draft)
    }

    async fn publish(&self, session: &Session, draft: Draft) -> Result<Transition, FlowError> {
        let phone = session.phone.as_str();
        let (Some(fish_type), Some(quantity_kg), Some(price_per_kg), Some(location)) =
            (draft.fish_type, draft.quantity_kg, draft.price_per_kg, draft.location)
        else {
            return self.start(session, None).await;
        };
        let now = Utc::now();
        let catch = FishCatch {
            id: CatchId::new(),
            seller_phone: phone.to_string(),
            fish_type,
            location: Some(location),
            price_per_kg,
            quantity_kg,
            status: CatchStatus::Available,
            photo: draft.photo,
            customers_coming: 0,
            created_at: now,
            expires_at: now + chrono::Duration::hours(self.settings.catch_ttl_hours),
        };
        self.catches.insert_catch(&catch).await?;
        tracing::info!(%phone, catch_id = %catch.id, fish_type = %fish_type, "catch posted");

        if let Err(e) = self
            .queue
            .enqueue(Job::ProcessCatch { catch_id: catch.id }, Duration::ZERO)
            .await
        {
            tracing::error!(catch_id = %catch.id, error = %e, "could not enqueue alert fan-out");
        }
        self.outbound
            .reply(OutboundMessage::text(
                phone,
                format!(
                    "✅ {} is live for {} hours. We're alerting buyers nearby.",
                    catch.headline(),
                    self.settings.catch_ttl_hours
                ),
            ))
            .await;
        Ok(Transition::Complete)
    }
}

#[async_trait]
impl FlowHandler for FishSellFlow {
    fn kind(&self) -> FlowKind {
        FlowKind::FishSell
    }

    fn steps(&self) -> &'static [&'static str] {
        Step::IDS
    }

    async fn start(&self, session: &Session, _seed: Option<Seed>) -> Result<Transition, FlowError> {
        let phone = session.phone.as_str();
        let since = Utc::now() - chrono::Duration::hours(24);
        let posted = self.catches.count_catches_since(phone, since).await?;
        let cap = self.settings.max_daily_catches_per_seller;
        if posted >= cap {
            tracing::info!(%phone, posted, cap, "seller daily cap reached");
            self.outbound
                .reply(OutboundMessage::text(
                    phone,
                    format!("You've posted {cap} catches in the last 24 hours, the daily limit. Please try again later."),
                ))
                .await;
            return Ok(Transition::Complete);
        }
        Ok(self.advance(phone, Step::AskFishType, &Draft::default()).await)
    }

    async fn handle(&self, message: &IncomingMessage, session: &Session) -> Result<Transition, FlowError> {
        let Some(step) = current_step::<Step>(session) else {
            return self.start(session, None).await;
        };
        let phone = session.phone.as_str();
        let mut next: Draft = draft(session);
        let choice = message.choice().unwrap_or_default();

        match step {
            Step::AskFishType => {
                if let Some(id) = parse_fish_type(choice) {
                    next.fish_type = Some(id);
                    return Ok(self.advance(phone, Step::AskQuantity, &next).await);
                }
            }
            Step::AskQuantity => {
                if let Some(kg) = parse_number(choice).filter(|kg| *kg <= MAX_QUANTITY_KG) {
                    next.quantity_kg = Some(kg);
                    return Ok(self.advance(phone, Step::AskPrice, &next).await);
                }
            }
            Step::AskPrice => {
                if let Some(paise) = parse_rupees(choice) {
                    next.price_per_kg = Some(paise);
                    return Ok(self.advance(phone, Step::AskLocation, &next).await);
                }
            }
            Step::AskLocation => {
                if let Some(at) = location_of(message) {
                    next.location = Some(at);
                    return Ok(self.advance(phone, Step::AskPhoto, &next).await);
                }
            }
            Step::AskPhoto => {
                let photo = message
                    .media
                    .clone()
                    .filter(|m| message.kind == MessageKind::Media && m.media_type == "image");
                if photo.is_some() || choice == SKIP_PHOTO {
                    next.photo = photo;
                    return Ok(self.advance(phone, Step::Confirm, &next).await);
                }
            }
            Step::Confirm => {
                if is_affirmative(choice) {
                    return self.publish(session, next).await;
                }
                if choice == CONFIRM_EDIT {
                    return Ok(self.advance(phone, Step::AskFishType, &Draft::default()).await);
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
        let Some(step) = current_step::<Step>(session) else {
            return self.start(session, None).await;
        };
        let hint = match step {
            Step::AskQuantity => " Please send the weight in kg as a number.",
            Step::AskPrice => " Please send the price per kg in rupees.",
            Step::AskPhoto => " Please send a photo or tap Skip photo.",
            _ => "",
        };
        self.outbound
            .reply(OutboundMessage::text(&session.phone, format!("{NOT_UNDERSTOOD}{hint}")))
            .await;
        self.prompt(&session.phone, step, &draft(session)).await;
        Ok(Transition::Stay)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::flow::testing::{Harness, point};

    async fn post_catch(h: &Harness, phone: &str) -> Session {
        let mut s = Session::new(phone);
        h.tap(&mut s, "menu:fish_sell").await;
        assert_eq!(s.step(), Some("ask_fish_type"));
        h.tap(&mut s, "fish:1").await;
        assert_eq!(s.step(), Some("ask_quantity"));
        h.say(&mut s, "25 kg").await;
        assert_eq!(s.step(), Some("ask_price"));
        h.say(&mut s, "₹180").await;
        assert_eq!(s.step(), Some("ask_location"));
        h.share_location(&mut s, point(9.9658, 76.2421)).await;
        assert_eq!(s.step(), Some("ask_photo"));
        h.send_photo(&mut s).await;
        assert_eq!(s.step(), Some("confirm"));
        h.tap(&mut s, CONFIRM_YES).await;
        s
    }

    #[tokio::test]
    async fn confirmed_catch_is_stored_and_fanned_out() {
        let h = Harness::new();
        let s = post_catch(&h, "9401").await;
        assert_eq!(s.flow, FlowKind::MainMenu);

        let Ok(open) = h.store.open_catches_by_seller("9401", Utc::now()).await else {
            panic!("query failed");
        };
        let [catch] = open.as_slice() else {
            panic!("exactly one catch expected, got {}", open.len());
        };
        assert_eq!(catch.price_per_kg, 18_000);
        assert!(catch.photo.is_some());
        assert_eq!(
            h.queue.snapshot().await,
            vec![Job::ProcessCatch { catch_id: catch.id }]
        );
    }

    #[tokio::test]
    async fn invalid_answers_keep_each_step() {
        let h = Harness::new();
        let mut s = Session::new("9402");
        h.tap(&mut s, "menu:fish_sell").await;
        let steps = [
            ("ask_fish_type", "whale", "fish:2"),
            ("ask_quantity", "plenty", "10"),
            ("ask_price", "free", "200"),
            ("ask_location", "the harbour", "9.96,76.24"),
            ("ask_photo", "no", SKIP_PHOTO),
            ("confirm", "maybe", CONFIRM_YES),
        ];
        for (step, bad, good) in steps {
            assert_eq!(s.step(), Some(step));
            h.say(&mut s, bad).await;
            assert_eq!(s.step(), Some(step), "{bad:?} must not advance {step}");
            if good.contains(':') && !good.contains(',') {
                h.tap(&mut s, good).await;
            } else {
                h.say(&mut s, good).await;
            }
        }
        assert_eq!(s.flow, FlowKind::MainMenu);
    }

    #[tokio::test]
    async fn daily_cap_blocks_new_posts() {
        let h = Harness::with_settings(FlowSettings {
            max_daily_catches_per_seller: 1,
            ..FlowSettings::default()
        });
        post_catch(&h, "9403").await;
        let mut s = Session::new("9403");
        h.tap(&mut s, "menu:fish_sell").await;
        assert_eq!(s.flow, FlowKind::MainMenu);
        assert!(h.last_text("9403").contains("daily limit"));
    }
}
