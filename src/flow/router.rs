//! Routes an inbound message to the active flow and applies the resulting
//! transition to the session.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::Outbound;
use crate::domain::{AgreementId, AlertId, CatchId, FlowKind, IncomingMessage, Session};
use crate::messaging::{Button, OutboundMessage};

use super::{
    FlowDeps, FlowError, FlowHandler, MAX_HANDOFFS, Seed, Transition, agreement, alert_subscribe,
    fish_browse, fish_sell, fish_stock, job_post, main_menu,
};

/// Selection id of the "main menu" button.
pub const NAV_MENU: &str = "nav:menu";
/// Selection id of the "cancel" button.
pub const NAV_CANCEL: &str = "nav:cancel";

/// Typed words that return to the main menu from anywhere.
const MENU_WORDS: &[&str] = &["menu", "main menu", "hi", "hello", "start"];
/// Typed words that abandon the current flow.
const CANCEL_WORDS: &[&str] = &["cancel", "quit", "exit"];

const RETRY_PROMPT: &str =
    "Sorry, something went wrong on our side. Please try again, or tap Main menu to start over.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nav {
    Menu,
    Cancel,
}

fn nav_token(message: &IncomingMessage) -> Option<Nav> {
    match message.selection_id.as_deref() {
        Some(NAV_MENU) => return Some(Nav::Menu),
        Some(NAV_CANCEL) => return Some(Nav::Cancel),
        Some(_) => return None,
        None => {}
    }
    let text = message.trimmed_text()?.to_lowercase();
    if MENU_WORDS.contains(&text.as_str()) {
        Some(Nav::Menu)
    } else if CANCEL_WORDS.contains(&text.as_str()) {
        Some(Nav::Cancel)
    } else {
        None
    }
}

/// Cross-flow buttons that work regardless of the active flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortcut {
    /// `menu:<flow>`: open a flow from the main menu.
    Open(FlowKind),
    /// `catch:<id>`: show a catch.
    ViewCatch(CatchId),
    /// `coming:<id>`: tell the seller you are on the way.
    Coming(CatchId),
    /// `alert:<id>`: open the catch behind an alert.
    AlertClick(AlertId),
    /// `agree:accept:<id>` / `agree:reject:<id>`.
    AgreementReply {
        /// Agreement answered.
        id: AgreementId,
        /// Accepted or rejected.
        accept: bool,
    },
}

impl Shortcut {
    /// Parses a selection id.
    #[must_use]
    pub fn parse(id: &str) -> Option<Self> {
        let (kind, rest) = id.split_once(':')?;
        match kind {
            "menu" => FlowKind::parse(rest).map(Self::Open),
            "catch" => rest.parse().ok().map(Self::ViewCatch),
            "coming" => rest.parse().ok().map(Self::Coming),
            "alert" => rest.parse().ok().map(Self::AlertClick),
            "agree" => {
                let (answer, id) = rest.split_once(':')?;
                let accept = match answer {
                    "accept" => true,
                    "reject" => false,
                    _ => return None,
                };
                id.parse().ok().map(|id| Self::AgreementReply { id, accept })
            }
            _ => None,
        }
    }

    /// Selection id form.
    #[must_use]
    pub fn id(self) -> String {
        match self {
            Self::Open(flow) => format!("menu:{flow}"),
            Self::ViewCatch(id) => format!("catch:{id}"),
            Self::Coming(id) => format!("coming:{id}"),
            Self::AlertClick(id) => format!("alert:{id}"),
            Self::AgreementReply { id, accept: true } => format!("agree:accept:{id}"),
            Self::AgreementReply { id, accept: false } => format!("agree:reject:{id}"),
        }
    }

    fn target(self) -> (FlowKind, Option<Seed>) {
        match self {
            Self::Open(flow) => (flow, None),
            Self::ViewCatch(id) => (FlowKind::FishBrowse, Some(Seed::Catch(id))),
            Self::Coming(id) => (FlowKind::FishBrowse, Some(Seed::Coming(id))),
            Self::AlertClick(id) => (FlowKind::FishBrowse, Some(Seed::AlertClick(id))),
            Self::AgreementReply { id, accept } => {
                (FlowKind::Agreement, Some(Seed::AgreementReply { id, accept }))
            }
        }
    }
}

/// Result of routing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The handler's transition was applied.
    Handled,
    /// A handler failed; the session was left as it was and the user got a
    /// retry prompt.
    Recovered(String),
}

/// Owns one handler per flow and is the only writer of session flow state.
#[derive(Debug)]
pub struct FlowRouter {
    handlers: HashMap<FlowKind, Arc<dyn FlowHandler>>,
    outbound: Arc<Outbound>,
}

impl FlowRouter {
    /// Registers every flow handler.
    #[must_use]
    pub fn new(deps: &FlowDeps) -> Self {
        let handlers: Vec<Arc<dyn FlowHandler>> = vec![
            Arc::new(main_menu::MainMenuFlow::new(deps)),
            Arc::new(alert_subscribe::AlertSubscribeFlow::new(deps)),
            Arc::new(fish_sell::FishSellFlow::new(deps)),
            Arc::new(fish_stock::FishStockFlow::new(deps)),
            Arc::new(fish_browse::FishBrowseFlow::new(deps)),
            Arc::new(agreement::AgreementFlow::new(deps)),
            Arc::new(job_post::JobPostFlow::new(deps)),
        ];
        Self {
            handlers: handlers.into_iter().map(|h| (h.kind(), h)).collect(),
            outbound: Arc::clone(&deps.outbound),
        }
    }

    pub(crate) fn handler(&self, flow: FlowKind) -> Result<&Arc<dyn FlowHandler>, FlowError> {
        self.handlers.get(&flow).ok_or(FlowError::UnknownFlow(flow))
    }

    /// Routes `message` and applies the transition to `session`.
    ///
    /// Global navigation words and cross-flow shortcuts are handled before
    /// the active flow sees the message. Handler failures are contained:
    /// the session is restored and a generic retry prompt is sent.
    pub async fn route(&self, message: &IncomingMessage, session: &mut Session) -> RouteOutcome {
        let before = session.clone();
        match self.dispatch(message, session).await {
            Ok(()) => RouteOutcome::Handled,
            Err(e) => {
                tracing::error!(
                    phone = %session.phone,
                    flow = %before.flow,
                    step = ?before.step,
                    message_id = %message.message_id,
                    error = %e,
                    "flow handler failed"
                );
                *session = before;
                self.outbound
                    .reply(OutboundMessage::buttons(
                        &session.phone,
                        RETRY_PROMPT,
                        vec![Button::new(NAV_MENU, "Main menu")],
                    ))
                    .await;
                RouteOutcome::Recovered(e.to_string())
            }
        }
    }

    async fn dispatch(&self, message: &IncomingMessage, session: &mut Session) -> Result<(), FlowError> {
        if let Some(nav) = nav_token(message) {
            if nav == Nav::Cancel && session.flow != FlowKind::MainMenu {
                self.outbound
                    .reply(OutboundMessage::text(&session.phone, "Cancelled."))
                    .await;
            }
            return self.start_flow(session, FlowKind::MainMenu, None).await;
        }

        if let Some(shortcut) = message.selection_id.as_deref().and_then(Shortcut::parse) {
            return self.handle_menu_selection(shortcut, session).await;
        }

        let handler = self.handler(session.flow)?;
        match session.step() {
            Some(step) if handler.declares(step) => {
                let transition = handler.handle(message, session).await?;
                self.apply(session, transition).await
            }
            step => {
                if let Some(step) = step {
                    tracing::warn!(phone = %session.phone, flow = %session.flow, step, "unknown step; restarting flow");
                }
                let flow = session.flow;
                self.start_flow(session, flow, None).await
            }
        }
    }

    /// Starts the flow a shortcut points at.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError`] if the target flow's `start` fails.
    pub async fn handle_menu_selection(
        &self,
        shortcut: Shortcut,
        session: &mut Session,
    ) -> Result<(), FlowError> {
        let (flow, seed) = shortcut.target();
        tracing::debug!(phone = %session.phone, from = %session.flow, to = %flow, "shortcut");
        self.start_flow(session, flow, seed).await
    }

    /// Resets `session` into `flow` and runs its `start`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError`] if the handler fails or handoffs loop.
    pub async fn start_flow(
        &self,
        session: &mut Session,
        flow: FlowKind,
        seed: Option<Seed>,
    ) -> Result<(), FlowError> {
        self.apply(session, Transition::Handoff { flow, seed }).await
    }

    async fn apply(&self, session: &mut Session, transition: Transition) -> Result<(), FlowError> {
        let mut transition = transition;
        let mut hops = 0usize;
        loop {
            match transition {
                Transition::Stay => return Ok(()),
                Transition::Goto { step, data } => {
                    if !self.handler(session.flow)?.declares(step) {
                        return Err(FlowError::UndeclaredStep {
                            flow: session.flow,
                            step,
                        });
                    }
                    session.step = Some(step.to_string());
                    session.temp_data = data;
                    return Ok(());
                }
                Transition::Complete => {
                    session.reset();
                    return Ok(());
                }
                Transition::Handoff { flow, seed } => {
                    hops = hops.saturating_add(1);
                    if hops > MAX_HANDOFFS {
                        return Err(FlowError::HandoffLoop);
                    }
                    let handler = self.handler(flow)?;
                    session.flow = flow;
                    session.step = None;
                    session.temp_data = serde_json::Value::Null;
                    transition = handler.start(session, seed).await?;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::flow::testing::Harness;

    #[test]
    fn shortcuts_round_trip() {
        let catch = CatchId::new();
        for shortcut in [
            Shortcut::Open(FlowKind::FishSell),
            Shortcut::ViewCatch(catch),
            Shortcut::Coming(catch),
            Shortcut::AlertClick(AlertId::new()),
            Shortcut::AgreementReply { id: AgreementId::new(), accept: false },
        ] {
            assert_eq!(Shortcut::parse(&shortcut.id()), Some(shortcut));
        }
        assert_eq!(Shortcut::parse("menu:nonsense"), None);
        assert_eq!(Shortcut::parse("agree:maybe:x"), None);
        assert_eq!(Shortcut::parse("confirm:yes"), None);
    }

    #[tokio::test]
    async fn greeting_shows_menu_from_any_flow() {
        let h = Harness::new();
        let mut session = Session::new("9101");
        session.enter(FlowKind::JobPost, "ask_pay", serde_json::json!({"title": "Net mender"}));
        let outcome = h.router.route(&IncomingMessage::text("m1", "9101", "Hi"), &mut session).await;
        assert_eq!(outcome, RouteOutcome::Handled);
        assert_eq!(session.flow, FlowKind::MainMenu);
        assert_eq!(session.step(), Some(Session::IDLE));
        assert!(session.temp_data.is_null());
        assert_eq!(h.messenger.sent_to("9101").len(), 1, "menu only, no cancel notice");
    }

    #[tokio::test]
    async fn cancel_button_abandons_flow_with_notice() {
        let h = Harness::new();
        let mut session = Session::new("9102");
        session.enter(FlowKind::FishSell, "ask_quantity", serde_json::json!({"fish_type": 1}));
        h.router
            .route(&IncomingMessage::button("m1", "9102", NAV_CANCEL), &mut session)
            .await;
        assert_eq!(session.flow, FlowKind::MainMenu);
        assert_eq!(h.messenger.sent_to("9102").len(), 2);
    }

    #[tokio::test]
    async fn menu_shortcut_starts_flow_mid_conversation() {
        let h = Harness::new();
        let mut session = Session::new("9103");
        session.enter(FlowKind::Agreement, "ask_amount", serde_json::Value::Null);
        h.router
            .route(&IncomingMessage::list("m1", "9103", "menu:job_post"), &mut session)
            .await;
        assert_eq!(session.flow, FlowKind::JobPost);
        assert_eq!(session.step(), Some("ask_title"));
    }

    #[tokio::test]
    async fn unknown_step_restarts_the_flow() {
        let h = Harness::new();
        let mut session = Session::new("9104");
        session.enter(FlowKind::JobPost, "ask_shoe_size", serde_json::json!({"title": "x"}));
        h.router
            .route(&IncomingMessage::text("m1", "9104", "42"), &mut session)
            .await;
        assert_eq!(session.flow, FlowKind::JobPost);
        assert_eq!(session.step(), Some("ask_title"));
        assert!(session.temp_data.is_null() || session.temp_data == serde_json::json!({}));
    }

    #[tokio::test]
    async fn unset_step_restarts_main_menu() {
        let h = Harness::new();
        let mut session = Session::from_columns(
            "9105".to_string(),
            "retired_flow",
            Some("whatever".to_string()),
            None,
            chrono::Utc::now(),
            0,
        );
        h.router
            .route(&IncomingMessage::text("m1", "9105", "hmm"), &mut session)
            .await;
        assert_eq!(session.flow, FlowKind::MainMenu);
        assert_eq!(session.step(), Some(Session::IDLE));
    }
}
