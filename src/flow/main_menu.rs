//! The resting flow: shows the menu and waits for a pick.

use std::sync::Arc;

use async_trait::async_trait;

use super::{FlowDeps, FlowError, FlowHandler, FlowStep, Seed, Transition};
use crate::dispatch::Outbound;
use crate::domain::{FlowKind, IncomingMessage, Session};
use crate::messaging::{ListRow, OutboundMessage};

flow_steps! {
    enum Step {
        Idle => "idle",
    }
}

const ENTRIES: &[(FlowKind, &str, &str)] = &[
    (FlowKind::FishBrowse, "Buy fish", "Fresh catches near you"),
    (FlowKind::FishAlertSubscribe, "Catch alerts", "Get told when fish lands nearby"),
    (FlowKind::FishSell, "Sell catch", "Post today's catch"),
    (FlowKind::FishStock, "Update stock", "Mark a catch low or sold out"),
    (FlowKind::Agreement, "Record a loan", "Lend or borrow with a reminder"),
    (FlowKind::JobPost, "Post a job", "Find workers nearby"),
];

/// Main menu.
#[derive(Debug)]
pub struct MainMenuFlow {
    outbound: Arc<Outbound>,
}

impl MainMenuFlow {
    /// Creates the handler.
    #[must_use]
    pub fn new(deps: &FlowDeps) -> Self {
        Self {
            outbound: Arc::clone(&deps.outbound),
        }
    }

    /// The menu message sent to `phone`.
    #[must_use]
    pub fn menu(phone: &str) -> OutboundMessage {
        let rows = ENTRIES
            .iter()
            .map(|(flow, title, description)| {
                ListRow::new(format!("menu:{flow}"), title, Some(description))
            })
            .collect();
        OutboundMessage::list(
            phone,
            "What would you like to do today?",
            "Open menu",
            "Dockside",
            rows,
        )
    }
}

#[async_trait]
impl FlowHandler for MainMenuFlow {
    fn kind(&self) -> FlowKind {
        FlowKind::MainMenu
    }

    fn steps(&self) -> &'static [&'static str] {
        Step::IDS
    }

    async fn start(&self, session: &Session, _seed: Option<Seed>) -> Result<Transition, FlowError> {
        self.outbound.reply(Self::menu(&session.phone)).await;
        Ok(Transition::goto(Step::Idle, &serde_json::Value::Null))
    }

    async fn handle(&self, message: &IncomingMessage, session: &Session) -> Result<Transition, FlowError> {
        // Menu picks arrive as `menu:<flow>` shortcuts before reaching here.
        self.handle_invalid_input(message, session).await
    }

    async fn handle_invalid_input(
        &self,
        _message: &IncomingMessage,
        session: &Session,
    ) -> Result<Transition, FlowError> {
        self.outbound.reply(Self::menu(&session.phone)).await;
        Ok(Transition::Stay)
    }
}
