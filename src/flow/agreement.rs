//! Record money lent or borrowed and get the other party to confirm it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::input::{CONFIRM_EDIT, CONFIRM_YES, is_affirmative, parse_date, parse_phone, parse_rupees};
use super::router::{NAV_CANCEL, Shortcut};
use super::{
    FlowDeps, FlowError, FlowHandler, FlowStep, NOT_UNDERSTOOD, Seed, Transition, current_step,
    draft,
};
use crate::dispatch::{Lane, Outbound};
use crate::domain::fish::format_rupees;
use crate::domain::{
    Agreement, AgreementDirection, AgreementId, AgreementStatus, FlowKind, IncomingMessage,
    Session,
};
use crate::messaging::{Button, OutboundMessage};
use crate::persistence::AgreementStore;

flow_steps! {
    enum Step {
        AskDirection => "ask_direction",
        AskCounterparty => "ask_counterparty",
        AskAmount => "ask_amount",
        AskPurpose => "ask_purpose",
        AskDueDate => "ask_due_date",
        Confirm => "confirm",
    }
}

const PURPOSE_MIN: usize = 2;
const PURPOSE_MAX: usize = 120;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Draft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    direction: Option<AgreementDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    counterparty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    due_date: Option<NaiveDate>,
}

fn parse_direction(choice: &str) -> Option<AgreementDirection> {
    match choice.trim().to_lowercase().as_str() {
        "dir:lent" | "lent" | "lend" | "i lent" => Some(AgreementDirection::Lent),
        "dir:borrowed" | "borrowed" | "borrow" | "i borrowed" => Some(AgreementDirection::Borrowed),
        _ => None,
    }
}

fn summary(direction: AgreementDirection, other: &str, amount: i64, purpose: &str, due: NaiveDate) -> String {
    let verb = match direction {
        AgreementDirection::Lent => "lent",
        AgreementDirection::Borrowed => "borrowed",
    };
    let prep = match direction {
        AgreementDirection::Lent => "to",
        AgreementDirection::Borrowed => "from",
    };
    format!(
        "{verb} {} {prep} +{other} for \"{purpose}\", due {}",
        format_rupees(amount),
        due.format("%d %b %Y")
    )
}

/// Agreement recording and counterparty confirmation.
#[derive(Debug)]
pub struct AgreementFlow {
    agreements: Arc<dyn AgreementStore>,
    outbound: Arc<Outbound>,
}

impl AgreementFlow {
    /// Creates the handler.
    #[must_use]
    pub fn new(deps: &FlowDeps) -> Self {
        Self {
            agreements: Arc::clone(&deps.stores.agreements),
            outbound: Arc::clone(&deps.outbound),
        }
    }

    async fn prompt(&self, phone: &str, step: Step, draft: &Draft) {
        let message = match step {
            Step::AskDirection => OutboundMessage::buttons(
                phone,
                "Did you lend money, or borrow it?",
                vec![
                    Button::new("dir:lent", "I lent"),
                    Button::new("dir:borrowed", "I borrowed"),
                    Button::new(NAV_CANCEL, "Cancel"),
                ],
            ),
            Step::AskCounterparty => OutboundMessage::text(
                phone,
                "What is the other person's WhatsApp number? (10-digit mobile or with country code)",
            ),
            Step::AskAmount => OutboundMessage::text(phone, "How much, in rupees?"),
            Step::AskPurpose => OutboundMessage::text(phone, "What was it for? (a few words)"),
            Step::AskDueDate => OutboundMessage::text(
                phone,
                "When should it be repaid? Type a date like 25-12-2026, or \"tomorrow\".",
            ),
            Step::Confirm => {
                let (Some(direction), Some(other), Some(amount), Some(purpose), Some(due)) = (
                    draft.direction,
                    draft.counterparty.as_deref(),
                    draft.amount,
                    draft.purpose.as_deref(),
                    draft.due_date,
                ) else {
                    return;
                };
                OutboundMessage::buttons(
                    phone,
                    format!(
                        "You {}. We'll ask them to confirm. Save it?",
                        summary(direction, other, amount, purpose, due)
                    ),
                    vec![
                        Button::new(CONFIRM_YES, "Save"),
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

    async fn save(&self, session: &Session, draft: &Draft) -> Result<Transition, FlowError> {
        let phone = session.phone.as_str();
        let (Some(direction), Some(other), Some(amount), Some(purpose), Some(due_date)) = (
            draft.direction,
            draft.counterparty.clone(),
            draft.amount,
            draft.purpose.clone(),
            draft.due_date,
        ) else {
            return self.start(session, None).await;
        };
        let agreement = Agreement {
            id: AgreementId::new(),
            creator_phone: phone.to_string(),
            counterparty_phone: other,
            direction,
            amount,
            purpose,
            due_date,
            status: AgreementStatus::Pending,
            reminded_at: None,
            created_at: Utc::now(),
        };
        self.agreements.insert_agreement(&agreement).await?;
        tracing::info!(agreement_id = %agreement.id, creator = %phone, "agreement recorded");

        // Counterparty sees it from their side.
        let their_direction = match direction {
            AgreementDirection::Lent => AgreementDirection::Borrowed,
            AgreementDirection::Borrowed => AgreementDirection::Lent,
        };
        self.outbound
            .deliver(
                OutboundMessage::buttons(
                    &agreement.counterparty_phone,
                    format!(
                        "+{phone} recorded that you {}. Is that right?",
                        summary(
                            their_direction,
                            phone,
                            agreement.amount,
                            &agreement.purpose,
                            agreement.due_date
                        )
                    ),
                    vec![
                        Button::new(
                            Shortcut::AgreementReply { id: agreement.id, accept: true }.id(),
                            "Yes, confirm",
                        ),
                        Button::new(
                            Shortcut::AgreementReply { id: agreement.id, accept: false }.id(),
                            "No, dispute",
                        ),
                    ],
                ),
                Lane::Conversational,
            )
            .await;
        self.outbound
            .reply(OutboundMessage::text(
                phone,
                format!(
                    "✅ Saved. We've asked +{} to confirm and will remind you both on the due date.",
                    agreement.counterparty_phone
                ),
            ))
            .await;
        Ok(Transition::Complete)
    }

    async fn answer(&self, phone: &str, id: AgreementId, accept: bool) -> Result<Transition, FlowError> {
        let Some(agreement) = self
            .agreements
            .agreement_by_id(id)
            .await?
            .filter(|a| a.counterparty_phone == phone)
        else {
            self.outbound
                .reply(OutboundMessage::text(phone, "We couldn't find that agreement."))
                .await;
            return Ok(Transition::Complete);
        };
        let status = if accept {
            AgreementStatus::Accepted
        } else {
            AgreementStatus::Rejected
        };
        let Some(resolved) = self.agreements.resolve_agreement(id, status).await? else {
            self.outbound
                .reply(OutboundMessage::text(phone, "You've already answered this one."))
                .await;
            return Ok(Transition::Complete);
        };
        tracing::info!(agreement_id = %id, status = resolved.status.as_str(), "agreement answered");

        let (to_creator, to_replier) = if accept {
            (
                format!("✅ +{phone} confirmed your agreement of {}.", format_rupees(agreement.amount)),
                "✅ Confirmed. We'll remind you both on the due date.".to_string(),
            )
        } else {
            (
                format!(
                    "⚠️ +{phone} disputed your agreement of {}. Please talk to them directly.",
                    format_rupees(agreement.amount)
                ),
                "Noted. We told them you disagree.".to_string(),
            )
        };
        self.outbound
            .deliver(
                OutboundMessage::text(&agreement.creator_phone, to_creator),
                Lane::Conversational,
            )
            .await;
        self.outbound.reply(OutboundMessage::text(phone, to_replier)).await;
        Ok(Transition::Complete)
    }
}

#[async_trait]
impl FlowHandler for AgreementFlow {
    fn kind(&self) -> FlowKind {
        FlowKind::Agreement
    }

    fn steps(&self) -> &'static [&'static str] {
        Step::IDS
    }

    async fn start(&self, session: &Session, seed: Option<Seed>) -> Result<Transition, FlowError> {
        if let Some(Seed::AgreementReply { id, accept }) = seed {
            return self.answer(&session.phone, id, accept).await;
        }
        Ok(self.advance(&session.phone, Step::AskDirection, &Draft::default()).await)
    }

    async fn handle(&self, message: &IncomingMessage, session: &Session) -> Result<Transition, FlowError> {
        let Some(step) = current_step::<Step>(session) else {
            return self.start(session, None).await;
        };
        let phone = session.phone.as_str();
        let mut next: Draft = draft(session);
        let choice = message.choice().unwrap_or_default();

        match step {
            Step::AskDirection => {
                if let Some(direction) = parse_direction(choice) {
                    next.direction = Some(direction);
                    return Ok(self.advance(phone, Step::AskCounterparty, &next).await);
                }
            }
            Step::AskCounterparty => {
                if let Some(other) = parse_phone(choice).filter(|other| other != phone) {
                    next.counterparty = Some(other);
                    return Ok(self.advance(phone, Step::AskAmount, &next).await);
                }
            }
            Step::AskAmount => {
                if let Some(amount) = parse_rupees(choice) {
                    next.amount = Some(amount);
                    return Ok(self.advance(phone, Step::AskPurpose, &next).await);
                }
            }
            Step::AskPurpose => {
                let len = choice.chars().count();
                if (PURPOSE_MIN..=PURPOSE_MAX).contains(&len) {
                    next.purpose = Some(choice.to_string());
                    return Ok(self.advance(phone, Step::AskDueDate, &next).await);
                }
            }
            Step::AskDueDate => {
                let today = Utc::now().date_naive();
                if let Some(due) = parse_date(choice, today).filter(|d| *d >= today) {
                    next.due_date = Some(due);
                    return Ok(self.advance(phone, Step::Confirm, &next).await);
                }
            }
            Step::Confirm => {
                if is_affirmative(choice) {
                    return self.save(session, &next).await;
                }
                if choice == CONFIRM_EDIT {
                    return Ok(self.advance(phone, Step::AskDirection, &Draft::default()).await);
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
            Step::AskCounterparty => " Send a valid number that isn't your own.",
            Step::AskAmount => " Send an amount like 500.",
            Step::AskPurpose => " Keep it between 2 and 120 characters.",
            Step::AskDueDate => " The date can't be in the past.",
            Step::AskDirection | Step::Confirm => "",
        };
        self.outbound
            .reply(OutboundMessage::text(&session.phone, format!("{NOT_UNDERSTOOD}{hint}")))
            .await;
        self.prompt(&session.phone, step, &draft(session)).await;
        Ok(Transition::Stay)
    }
}
