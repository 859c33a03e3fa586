//! Subscribe to fresh-catch alerts, or pause, resume and stop an existing
//! subscription.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::input::{
    CONFIRM_EDIT, CONFIRM_YES, is_affirmative, location_of, parse_fish_filter, parse_frequency,
    parse_number, selected,
};
use super::router::NAV_CANCEL;
use super::{
    FlowDeps, FlowError, FlowHandler, FlowStep, NOT_UNDERSTOOD, Seed, Transition, current_step,
    draft,
};
use crate::dispatch::Outbound;
use crate::domain::fish::{FISH_TYPES, fish_label};
use crate::domain::{
    DeliveryFrequency, FishSubscription, FishTypeFilter, FlowKind, GeoPoint, IncomingMessage,
    Radius, Session, SubscriptionId,
};
use crate::messaging::{Button, ListRow, OutboundMessage};
use crate::persistence::SubscriptionStore;

flow_steps! {
    enum Step {
        Manage => "manage",
        AskLocation => "ask_location",
        AskRadius => "ask_radius",
        AskFishTypes => "ask_fish_types",
        AskFrequency => "ask_frequency",
        Confirm => "confirm",
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Draft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    existing: Option<SubscriptionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    radius: Option<Radius>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fish_types: Option<FishTypeFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    frequency: Option<DeliveryFrequency>,
}

/// Alert subscription management.
#[derive(Debug)]
pub struct AlertSubscribeFlow {
    subscriptions: Arc<dyn SubscriptionStore>,
    outbound: Arc<Outbound>,
}

fn describe_filter(filter: &FishTypeFilter) -> String {
    match filter {
        FishTypeFilter::All => "all fish".to_string(),
        FishTypeFilter::Only(ids) => ids
            .iter()
            .map(|id| fish_label(*id))
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn describe(sub: &FishSubscription) -> String {
    format!(
        "{} within {} km, {}",
        describe_filter(&sub.fish_types),
        sub.radius.km(),
        sub.frequency.label().to_lowercase()
    )
}

impl AlertSubscribeFlow {
    /// Creates the handler.
    #[must_use]
    pub fn new(deps: &FlowDeps) -> Self {
        Self {
            subscriptions: Arc::clone(&deps.stores.subscriptions),
            outbound: Arc::clone(&deps.outbound),
        }
    }

    async fn prompt(&self, phone: &str, step: Step, draft: &Draft) -> Result<(), FlowError> {
        let message = match step {
            Step::Manage => {
                let Some(sub) = self.subscriptions.active_subscription_for(phone).await? else {
                    return Ok(());
                };
                let (toggle_id, toggle_title, state) = if sub.paused {
                    ("sub:resume", "Resume alerts", "paused")
                } else {
                    ("sub:pause", "Pause alerts", "active")
                };
                OutboundMessage::buttons(
                    phone,
                    format!("Your alerts are {state}: {}.", describe(&sub)),
                    vec![
                        Button::new(toggle_id, toggle_title),
                        Button::new("sub:new", "Change settings"),
                        Button::new("sub:stop", "Stop alerts"),
                    ],
                )
            }
            Step::AskLocation => OutboundMessage::location_request(
                phone,
                "Share the location you buy fish around (📎 → Location), or type it as lat,lon.",
            ),
            Step::AskRadius => OutboundMessage::buttons(
                phone,
                "How far are you willing to travel? Pick one or type a distance from 1 to 50 km.",
                vec![
                    Button::new("radius:2", "2 km"),
                    Button::new("radius:5", "5 km"),
                    Button::new("radius:10", "10 km"),
                ],
            ),
            Step::AskFishTypes => {
                let mut rows = vec![ListRow::new("fish:all", "All fish", Some("Every species"))];
                rows.extend(FISH_TYPES.iter().map(|t| {
                    ListRow::new(format!("fish:{}", t.id), t.name, Some(t.local_name))
                }));
                OutboundMessage::list(
                    phone,
                    "Which fish do you want alerts for? Pick one, or type numbers like 1,4.",
                    "Choose fish",
                    "Fish",
                    rows,
                )
            }
            Step::AskFrequency => OutboundMessage::list(
                phone,
                "How often should we message you?",
                "Choose",
                "Frequency",
                DeliveryFrequency::ALL
                    .iter()
                    .map(|f| ListRow::new(format!("freq:{}", f.as_str()), f.label(), None))
                    .collect(),
            ),
            Step::Confirm => {
                let (Some(radius), Some(fish_types), Some(frequency)) =
                    (draft.radius, draft.fish_types.as_ref(), draft.frequency)
                else {
                    return Ok(());
                };
                OutboundMessage::buttons(
                    phone,
                    format!(
                        "Alert me about {} within {} km, {}?",
                        describe_filter(fish_types),
                        radius.km(),
                        frequency.label().to_lowercase()
                    ),
                    vec![
                        Button::new(CONFIRM_YES, "Confirm"),
                        Button::new(CONFIRM_EDIT, "Change"),
                        Button::new(NAV_CANCEL, "Cancel"),
                    ],
                )
            }
        };
        self.outbound.reply(message).await;
        Ok(())
    }

    async fn advance(&self, phone: &str, step: Step, draft: &Draft) -> Result<Transition, FlowError> {
        self.prompt(phone, step, draft).await?;
        Ok(Transition::goto(step, draft))
    }

    async fn manage(&self, choice: &str, session: &Session) -> Result<Option<Transition>, FlowError> {
        let phone = session.phone.as_str();
        let Some(sub) = self.subscriptions.active_subscription_for(phone).await? else {
            return Ok(Some(self.advance(phone, Step::AskLocation, &Draft::default()).await?));
        };
        let reply = match choice {
            "sub:pause" => {
                self.subscriptions.set_subscription_state(sub.id, true, true).await?;
                "⏸️ Alerts paused. Open Catch alerts from the menu to resume."
            }
            "sub:resume" => {
                self.subscriptions.set_subscription_state(sub.id, false, true).await?;
                "▶️ Alerts resumed."
            }
            "sub:stop" => {
                self.subscriptions.set_subscription_state(sub.id, sub.paused, false).await?;
                "You won't get catch alerts any more."
            }
            "sub:new" => {
                let next = Draft {
                    existing: Some(sub.id),
                    ..Draft::default()
                };
                return Ok(Some(self.advance(phone, Step::AskLocation, &next).await?));
            }
            _ => return Ok(None),
        };
        self.outbound.reply(OutboundMessage::text(phone, reply)).await;
        Ok(Some(Transition::Complete))
    }

    async fn save(&self, session: &Session, draft: &Draft) -> Result<Transition, FlowError> {
        let phone = session.phone.as_str();
        let (Some(location), Some(radius), Some(fish_types), Some(frequency)) =
            (draft.location, draft.radius, draft.fish_types.clone(), draft.frequency)
        else {
            return self.start(session, None).await;
        };
        if let Some(current) = self.subscriptions.active_subscription_for(phone).await? {
            self.subscriptions
                .set_subscription_state(current.id, current.paused, false)
                .await?;
        }
        let sub = FishSubscription::new(phone, location, radius, fish_types, frequency);
        self.subscriptions.insert_subscription(&sub).await?;
        tracing::info!(%phone, subscription_id = %sub.id, radius_km = radius.km(), "alert subscription saved");
        self.outbound
            .reply(OutboundMessage::text(
                phone,
                format!("✅ Done! We'll alert you about {}.", describe(&sub)),
            ))
            .await;
        Ok(Transition::Complete)
    }
}

#[async_trait]
impl FlowHandler for AlertSubscribeFlow {
    fn kind(&self) -> FlowKind {
        FlowKind::FishAlertSubscribe
    }

    fn steps(&self) -> &'static [&'static str] {
        Step::IDS
    }

    async fn start(&self, session: &Session, seed: Option<Seed>) -> Result<Transition, FlowError> {
        let phone = session.phone.as_str();
        if self.subscriptions.active_subscription_for(phone).await?.is_some() {
            return self.advance(phone, Step::Manage, &Draft::default()).await;
        }
        if let Some(Seed::Location(at)) = seed {
            let next = Draft {
                location: Some(at),
                ..Draft::default()
            };
            return self.advance(phone, Step::AskRadius, &next).await;
        }
        self.advance(phone, Step::AskLocation, &Draft::default()).await
    }

    async fn handle(&self, message: &IncomingMessage, session: &Session) -> Result<Transition, FlowError> {
        let Some(step) = current_step::<Step>(session) else {
            return self.start(session, None).await;
        };
        let phone = session.phone.as_str();
        let mut next: Draft = draft(session);
        let choice = message.choice().unwrap_or_default();

        match step {
            Step::Manage => {
                if let Some(t) = self.manage(choice, session).await? {
                    return Ok(t);
                }
            }
            Step::AskLocation => {
                if let Some(at) = location_of(message) {
                    next.location = Some(at);
                    return self.advance(phone, Step::AskRadius, &next).await;
                }
            }
            Step::AskRadius => {
                let value = selected(choice, "radius:").unwrap_or(choice);
                if let Some(radius) = parse_number(value).and_then(|km| Radius::new(km).ok()) {
                    next.radius = Some(radius);
                    return self.advance(phone, Step::AskFishTypes, &next).await;
                }
            }
            Step::AskFishTypes => {
                if let Some(filter) = parse_fish_filter(choice) {
                    next.fish_types = Some(filter);
                    return self.advance(phone, Step::AskFrequency, &next).await;
                }
            }
            Step::AskFrequency => {
                if let Some(frequency) = parse_frequency(choice) {
                    next.frequency = Some(frequency);
                    return self.advance(phone, Step::Confirm, &next).await;
                }
            }
            Step::Confirm => {
                if is_affirmative(choice) {
                    return self.save(session, &next).await;
                }
                if choice == CONFIRM_EDIT {
                    let restart = Draft {
                        existing: next.existing,
                        ..Draft::default()
                    };
                    return self.advance(phone, Step::AskLocation, &restart).await;
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
            Step::AskRadius => " Please send a distance between 1 and 50 km.",
            Step::AskLocation => " Please share a location pin.",
            _ => "",
        };
        self.outbound
            .reply(OutboundMessage::text(&session.phone, format!("{NOT_UNDERSTOOD}{hint}")))
            .await;
        self.prompt(&session.phone, step, &draft(session)).await?;
        Ok(Transition::Stay)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::flow::testing::{Harness, point};

    async fn subscribed(h: &Harness, phone: &str) -> Session {
        let mut s = Session::new(phone);
        h.tap(&mut s, "menu:fish_alert_subscribe").await;
        assert_eq!(s.step(), Some("ask_location"));
        h.share_location(&mut s, point(9.9312, 76.2673)).await;
        assert_eq!(s.step(), Some("ask_radius"));
        h.tap(&mut s, "radius:5").await;
        assert_eq!(s.step(), Some("ask_fish_types"));
        h.tap(&mut s, "fish:all").await;
        assert_eq!(s.step(), Some("ask_frequency"));
        h.tap(&mut s, "freq:immediate").await;
        assert_eq!(s.step(), Some("confirm"));
        h.tap(&mut s, CONFIRM_YES).await;
        assert_eq!(s.flow, FlowKind::MainMenu);
        s
    }

    #[tokio::test]
    async fn full_subscription_is_saved() {
        let h = Harness::new();
        subscribed(&h, "9301").await;
        let Ok(Some(sub)) = h.store.active_subscription_for("9301").await else {
            panic!("subscription should be stored");
        };
        assert_eq!(sub.radius.km(), 5.0);
        assert_eq!(sub.fish_types, FishTypeFilter::All);
        assert_eq!(sub.frequency, DeliveryFrequency::Immediate);
        assert!(sub.is_listening());
    }

    #[tokio::test]
    async fn every_step_rejects_garbage_and_stays() {
        let h = Harness::new();
        let mut s = Session::new("9302");
        h.tap(&mut s, "menu:fish_alert_subscribe").await;
        for (expected_step, good) in [
            ("ask_location", None),
            ("ask_radius", Some("radius:5")),
            ("ask_fish_types", Some("1,4")),
            ("ask_frequency", Some("freq:twice_daily")),
            ("confirm", None),
        ] {
            assert_eq!(s.step(), Some(expected_step));
            h.say(&mut s, "blorp").await;
            assert_eq!(s.step(), Some(expected_step), "invalid input must not move the step");
            assert!(h.messenger.sent_to("9302").len() >= 2);
            match good {
                Some(id) => {
                    h.tap(&mut s, id).await;
                }
                None if expected_step == "ask_location" => {
                    h.say(&mut s, "9.93, 76.26").await;
                }
                None => {}
            }
        }
    }

    #[tokio::test]
    async fn out_of_range_radius_is_rejected() {
        let h = Harness::new();
        let mut s = Session::new("9303");
        h.tap(&mut s, "menu:fish_alert_subscribe").await;
        h.share_location(&mut s, point(9.93, 76.26)).await;
        h.say(&mut s, "75 km").await;
        assert_eq!(s.step(), Some("ask_radius"));
        h.say(&mut s, "12 km").await;
        assert_eq!(s.step(), Some("ask_fish_types"));
    }

    #[tokio::test]
    async fn existing_subscriber_can_pause_resume_and_stop() {
        let h = Harness::new();
        let mut s = subscribed(&h, "9304").await;

        h.tap(&mut s, "menu:fish_alert_subscribe").await;
        assert_eq!(s.step(), Some("manage"));
        h.tap(&mut s, "sub:pause").await;
        let Ok(Some(sub)) = h.store.active_subscription_for("9304").await else {
            panic!("still active while paused");
        };
        assert!(sub.paused);

        h.tap(&mut s, "menu:fish_alert_subscribe").await;
        h.tap(&mut s, "sub:resume").await;
        let Ok(Some(sub)) = h.store.active_subscription_for("9304").await else {
            panic!("still active");
        };
        assert!(!sub.paused);

        h.tap(&mut s, "menu:fish_alert_subscribe").await;
        h.tap(&mut s, "sub:stop").await;
        assert_eq!(h.store.active_subscription_for("9304").await, Ok(None));
    }

    #[tokio::test]
    async fn changing_settings_replaces_the_subscription() {
        let h = Harness::new();
        let mut s = subscribed(&h, "9305").await;
        let Ok(Some(old)) = h.store.active_subscription_for("9305").await else {
            panic!("subscription missing");
        };
        h.tap(&mut s, "menu:fish_alert_subscribe").await;
        h.tap(&mut s, "sub:new").await;
        h.share_location(&mut s, point(9.95, 76.28)).await;
        h.say(&mut s, "20").await;
        h.say(&mut s, "karimeen").await;
        h.say(&mut s, "2").await;
        h.say(&mut s, "yes").await;
        let Ok(Some(new)) = h.store.active_subscription_for("9305").await else {
            panic!("replacement missing");
        };
        assert_ne!(new.id, old.id);
        assert_eq!(new.radius.km(), 20.0);
        assert_eq!(new.frequency, DeliveryFrequency::MorningOnly);
    }

    #[tokio::test]
    async fn location_seed_skips_the_location_prompt() {
        let h = Harness::new();
        let mut s = Session::new("9306");
        let Ok(()) = h
            .router
            .start_flow(&mut s, FlowKind::FishAlertSubscribe, Some(Seed::Location(point(9.9, 76.2))))
            .await
        else {
            panic!("start should succeed");
        };
        assert_eq!(s.step(), Some("ask_radius"));
    }
}
