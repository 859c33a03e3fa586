//! Post a daily-wage job opening.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::input::{CONFIRM_EDIT, CONFIRM_YES, is_affirmative, location_of, parse_rupees};
use super::router::NAV_CANCEL;
use super::{
    FlowDeps, FlowError, FlowHandler, FlowStep, NOT_UNDERSTOOD, Seed, Transition, current_step,
    draft,
};
use crate::dispatch::Outbound;
use crate::domain::fish::format_rupees;
use crate::domain::{FlowKind, GeoPoint, IncomingMessage, JobPost, JobPostId, Session};
use crate::messaging::{Button, OutboundMessage};
use crate::persistence::JobPostStore;

flow_steps! {
    enum Step {
        AskTitle => "ask_title",
        AskPay => "ask_pay",
        AskLocation => "ask_location",
        Confirm => "confirm",
    }
}

const SKIP_LOCATION: &str = "job:skip";
const TITLE_MIN: usize = 3;
const TITLE_MAX: usize = 60;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Draft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    daily_pay: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<GeoPoint>,
}

/// Job posting.
#[derive(Debug)]
pub struct JobPostFlow {
    jobs: Arc<dyn JobPostStore>,
    outbound: Arc<Outbound>,
}

impl JobPostFlow {
    /// Creates the handler.
    #[must_use]
    pub fn new(deps: &FlowDeps) -> Self {
        Self {
            jobs: Arc::clone(&deps.stores.jobs),
            outbound: Arc::clone(&deps.outbound),
        }
    }

    async fn prompt(&self, phone: &str, step: Step, draft: &Draft) {
        let message = match step {
            Step::AskTitle => OutboundMessage::text(
                phone,
                "What's the job? A short title like \"Boat crew for 3 days\".",
            ),
            Step::AskPay => OutboundMessage::text(phone, "Daily pay in rupees?"),
            Step::AskLocation => OutboundMessage::buttons(
                phone,
                "Share where the work is (📎 → Location), or skip.",
                vec![Button::new(SKIP_LOCATION, "Skip")],
            ),
            Step::Confirm => {
                let (Some(title), Some(pay)) = (draft.title.as_deref(), draft.daily_pay) else {
                    return;
                };
                let place = if draft.location.is_some() { " (location shared)" } else { "" };
                OutboundMessage::buttons(
                    phone,
                    format!("Post \"{title}\" at {}/day{place}?", format_rupees(pay)),
                    vec![
                        Button::new(CONFIRM_YES, "Post"),
                        Button::new(CONFIRM_EDIT, "Start over"),
                        Button::new(NAV_CANCEL, "Cancel"),
                    ],
                )
            }
        };
        self.outbound.reply(message).await;
    }

    async fn advance(&self, phone: &str, step: Step, draft: &Draft) -> Transition {
        self.prompt(phone, step, draft).await;
        Transition::goto(step, draft)
    }
}

#[async_trait]
impl FlowHandler for JobPostFlow {
    fn kind(&self) -> FlowKind {
        FlowKind::JobPost
    }

    fn steps(&self) -> &'static [&'static str] {
        Step::IDS
    }

    async fn start(&self, session: &Session, _seed: Option<Seed>) -> Result<Transition, FlowError> {
        Ok(self.advance(&session.phone, Step::AskTitle, &Draft::default()).await)
    }

    async fn handle(&self, message: &IncomingMessage, session: &Session) -> Result<Transition, FlowError> {
        let Some(step) = current_step::<Step>(session) else {
            return self.start(session, None).await;
        };
        let phone = session.phone.as_str();
        let mut next: Draft = draft(session);
        let choice = message.choice().unwrap_or_default();

        match step {
            Step::AskTitle => {
                if (TITLE_MIN..=TITLE_MAX).contains(&choice.chars().count()) {
                    next.title = Some(choice.to_string());
                    return Ok(self.advance(phone, Step::AskPay, &next).await);
                }
            }
            Step::AskPay => {
                if let Some(pay) = parse_rupees(choice) {
                    next.daily_pay = Some(pay);
                    return Ok(self.advance(phone, Step::AskLocation, &next).await);
                }
            }
            Step::AskLocation => {
                if let Some(at) = location_of(message) {
                    next.location = Some(at);
                    return Ok(self.advance(phone, Step::Confirm, &next).await);
                }
                if choice == SKIP_LOCATION {
                    return Ok(self.advance(phone, Step::Confirm, &next).await);
                }
            }
            Step::Confirm => {
                if is_affirmative(choice) {
                    let (Some(title), Some(daily_pay)) = (next.title, next.daily_pay) else {
                        return self.start(session, None).await;
                    };
                    let post = JobPost {
                        id: JobPostId::new(),
                        employer_phone: phone.to_string(),
                        title,
                        daily_pay,
                        location: next.location,
                        created_at: Utc::now(),
                    };
                    self.jobs.insert_job_post(&post).await?;
                    tracing::info!(job_post_id = %post.id, employer = %phone, "job posted");
                    self.outbound
                        .reply(OutboundMessage::text(phone, "✅ Your job is posted."))
                        .await;
                    return Ok(Transition::Complete);
                }
                if choice == CONFIRM_EDIT {
                    return Ok(self.advance(phone, Step::AskTitle, &Draft::default()).await);
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
            Step::AskTitle => " Use 3 to 60 characters.",
            Step::AskPay => " Send an amount like 800.",
            Step::AskLocation | Step::Confirm => "",
        };
        self.outbound
            .reply(OutboundMessage::text(&session.phone, format!("{NOT_UNDERSTOOD}{hint}")))
            .await;
        self.prompt(&session.phone, step, &draft(session)).await;
        Ok(Transition::Stay)
    }
}
