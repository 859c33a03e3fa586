//! Seller updates the stock status of an open catch. Marking it sold out
//! enqueues alternatives for buyers who said they were coming.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::input::{parse_index, selected};
use super::{
    FlowDeps, FlowError, FlowHandler, FlowStep, NOT_UNDERSTOOD, Seed, Transition, current_step,
    draft,
};
use crate::dispatch::{Job, JobQueue, Outbound};
use crate::domain::fish::{fish_label, format_rupees};
use crate::domain::{CatchId, CatchStatus, FishCatch, FlowKind, IncomingMessage, Session};
use crate::messaging::{Button, ListRow, OutboundMessage};
use crate::persistence::CatchStore;

flow_steps! {
    enum Step {
        SelectCatch => "select_catch",
        SelectStatus => "select_status",
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Draft {
    #[serde(default)]
    catches: Vec<CatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    catch_id: Option<CatchId>,
}

fn status_label(status: CatchStatus) -> &'static str {
    match status {
        CatchStatus::Available => "Available",
        CatchStatus::LowStock => "Low stock",
        CatchStatus::SoldOut => "Sold out",
        CatchStatus::Expired => "Expired",
    }
}

fn parse_status(choice: &str) -> Option<CatchStatus> {
    let token = selected(choice, "status:").unwrap_or(choice).trim().to_lowercase();
    let status = CatchStatus::parse(&token).or_else(|| match token.as_str() {
        "low" | "low stock" => Some(CatchStatus::LowStock),
        "sold" | "sold out" => Some(CatchStatus::SoldOut),
        _ => None,
    })?;
    (status != CatchStatus::Expired).then_some(status)
}

/// Stock updates.
#[derive(Debug)]
pub struct FishStockFlow {
    catches: Arc<dyn CatchStore>,
    queue: Arc<dyn JobQueue>,
    outbound: Arc<Outbound>,
}

impl FishStockFlow {
    /// Creates the handler.
    #[must_use]
    pub fn new(deps: &FlowDeps) -> Self {
        Self {
            catches: Arc::clone(&deps.stores.catches),
            queue: Arc::clone(&deps.queue),
            outbound: Arc::clone(&deps.outbound),
        }
    }

    async fn open_catches(&self, phone: &str) -> Result<Vec<FishCatch>, FlowError> {
        let mut open = self.catches.open_catches_by_seller(phone, Utc::now()).await?;
        open.truncate(crate::messaging::MAX_LIST_ROWS);
        Ok(open)
    }

    async fn prompt(&self, phone: &str, step: Step, draft: &Draft) -> Result<(), FlowError> {
        let message = match step {
            Step::SelectCatch => {
                let open = self.open_catches(phone).await?;
                let rows = open
                    .iter()
                    .map(|c| {
                        let detail = format!(
                            "{}/kg · {:.0} kg · {}",
                            format_rupees(c.price_per_kg),
                            c.quantity_kg,
                            status_label(c.status)
                        );
                        ListRow::new(format!("stock:{}", c.id), &fish_label(c.fish_type), Some(&detail))
                    })
                    .collect();
                OutboundMessage::list(phone, "Which catch do you want to update?", "Choose catch", "Your catches", rows)
            }
            Step::SelectStatus => {
                let name = match draft.catch_id {
                    Some(id) => self
                        .catches
                        .catch_by_id(id)
                        .await?
                        .map(|c| fish_label(c.fish_type))
                        .unwrap_or_default(),
                    None => String::new(),
                };
                OutboundMessage::buttons(
                    phone,
                    format!("How much {name} is left?"),
                    vec![
                        Button::new("status:available", "Available"),
                        Button::new("status:low_stock", "Low stock"),
                        Button::new("status:sold_out", "Sold out"),
                    ],
                )
            }
        };
        self.outbound.reply(message).await;
        Ok(())
    }

    async fn pick(&self, choice: &str, session: &Session, next: &Draft) -> Result<Option<CatchId>, FlowError> {
        let id = match selected(choice, "stock:") {
            Some(raw) => raw.parse::<CatchId>().ok(),
            None => parse_index(choice, next.catches.len()).and_then(|i| next.catches.get(i).copied()),
        };
        let Some(id) = id else {
            return Ok(None);
        };
        let owned_and_open = self
            .catches
            .catch_by_id(id)
            .await?
            .is_some_and(|c| c.seller_phone == session.phone && c.is_open_at(Utc::now()));
        Ok(owned_and_open.then_some(id))
    }

    async fn update(&self, phone: &str, id: CatchId, status: CatchStatus) -> Result<Transition, FlowError> {
        let previous = self.catches.set_catch_status(id, status).await?;
        tracing::info!(%phone, catch_id = %id, from = previous.as_str(), to = status.as_str(), "catch status updated");
        if status == CatchStatus::SoldOut && previous != CatchStatus::SoldOut {
            if let Err(e) = self
                .queue
                .enqueue(Job::CatchSoldOut { catch_id: id }, Duration::ZERO)
                .await
            {
                tracing::error!(catch_id = %id, error = %e, "could not enqueue sold-out notifications");
            }
        }
        self.outbound
            .reply(OutboundMessage::text(
                phone,
                format!("Updated to {}.", status_label(status)),
            ))
            .await;
        Ok(Transition::Complete)
    }
}

#[async_trait]
impl FlowHandler for FishStockFlow {
    fn kind(&self) -> FlowKind {
        FlowKind::FishStock
    }

    fn steps(&self) -> &'static [&'static str] {
        Step::IDS
    }

    async fn start(&self, session: &Session, _seed: Option<Seed>) -> Result<Transition, FlowError> {
        let phone = session.phone.as_str();
        let open = self.open_catches(phone).await?;
        if open.is_empty() {
            self.outbound
                .reply(OutboundMessage::text(
                    phone,
                    "You have no open catches. Post one with Sell catch from the menu.",
                ))
                .await;
            return Ok(Transition::Complete);
        }
        let next = Draft {
            catches: open.iter().map(|c| c.id).collect(),
            catch_id: None,
        };
        self.prompt(phone, Step::SelectCatch, &next).await?;
        Ok(Transition::goto(Step::SelectCatch, &next))
    }

    async fn handle(&self, message: &IncomingMessage, session: &Session) -> Result<Transition, FlowError> {
        let Some(step) = current_step::<Step>(session) else {
            return self.start(session, None).await;
        };
        let phone = session.phone.as_str();
        let mut next: Draft = draft(session);
        let choice = message.choice().unwrap_or_default();

        match step {
            Step::SelectCatch => {
                if let Some(id) = self.pick(choice, session, &next).await? {
                    next.catch_id = Some(id);
                    self.prompt(phone, Step::SelectStatus, &next).await?;
                    return Ok(Transition::goto(Step::SelectStatus, &next));
                }
            }
            Step::SelectStatus => {
                if let (Some(id), Some(status)) = (next.catch_id, parse_status(choice)) {
                    return self.update(phone, id, status).await;
                }
                if next.catch_id.is_none() {
                    return self.start(session, None).await;
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
        self.outbound
            .reply(OutboundMessage::text(&session.phone, NOT_UNDERSTOOD))
            .await;
        self.prompt(&session.phone, step, &draft(session)).await?;
        Ok(Transition::Stay)
    }
}
