//! Conversation flows.
//!
//! Each business workflow is a [`FlowHandler`] with a closed set of steps.
//! Handlers never write session state themselves: they return a
//! [`Transition`] and the [`router::FlowRouter`] applies it, so `flow`,
//! `step` and `temp_data` always change together.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::dispatch::{JobQueue, Outbound, QueueError};
use crate::domain::{
    AgreementId, AlertId, CatchId, DomainError, FlowKind, GeoPoint, IncomingMessage, Session,
};
use crate::persistence::{StoreError, Stores};

/// Declares a flow's step enum and its [`FlowStep`] impl.
macro_rules! flow_steps {
    ($(#[$meta:meta])* enum $name:ident { $($variant:ident => $id:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        enum $name {
            $($variant),+
        }

        impl $crate::flow::FlowStep for $name {
            const ALL: &'static [Self] = &[$(Self::$variant),+];
            const IDS: &'static [&'static str] = &[$($id),+];

            fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $id),+
                }
            }
        }
    };
}

pub mod agreement;
pub mod alert_subscribe;
pub mod fish_browse;
pub mod fish_sell;
pub mod fish_stock;
pub mod input;
pub mod job_post;
pub mod main_menu;
pub mod router;

#[cfg(test)]
pub(crate) mod testing;

pub use router::{FlowRouter, RouteOutcome, Shortcut};

/// Maximum number of chained handoffs applied for one inbound message.
pub const MAX_HANDOFFS: usize = 4;

/// A flow's step vocabulary.
pub trait FlowStep: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
    /// Every step, first step first.
    const ALL: &'static [Self];

    /// Persisted ids of [`FlowStep::ALL`], in the same order.
    const IDS: &'static [&'static str];

    /// Persisted step id.
    fn as_str(self) -> &'static str;

    /// Parses a persisted step id.
    fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|step| step.as_str() == s)
    }
}

/// Context handed to a flow when it is started by a shortcut or handoff.
#[derive(Debug, Clone, PartialEq)]
pub enum Seed {
    /// A location the user already shared.
    Location(GeoPoint),
    /// Open a catch's detail view.
    Catch(CatchId),
    /// Buyer tapped "I'm coming" on a catch.
    Coming(CatchId),
    /// Recipient tapped an alert.
    AlertClick(AlertId),
    /// Counterparty answered an agreement confirmation.
    AgreementReply {
        /// Agreement answered.
        id: AgreementId,
        /// `true` to accept, `false` to reject.
        accept: bool,
    },
}

/// What a handler wants done with the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Keep flow, step and draft.
    Stay,
    /// Move to `step` of the current flow with a new draft.
    Goto {
        /// Target step id; must be declared by the current flow.
        step: &'static str,
        /// Serialized draft.
        data: serde_json::Value,
    },
    /// Start another flow, optionally seeded.
    Handoff {
        /// Target flow.
        flow: FlowKind,
        /// Context for the target's `start`.
        seed: Option<Seed>,
    },
    /// Flow finished; return to the idle main menu.
    Complete,
}

impl Transition {
    /// Moves to `step`, persisting `draft`.
    #[must_use]
    pub fn goto<S: FlowStep, D: Serialize>(step: S, draft: &D) -> Self {
        Self::Goto {
            step: step.as_str(),
            data: serde_json::to_value(draft).unwrap_or_default(),
        }
    }
}

/// Errors a handler may raise. The router logs them, sends a generic
/// retry prompt and leaves the session untouched.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// A store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Follow-up work could not be enqueued.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A domain invariant was violated.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// No handler is registered for a flow.
    #[error("no handler registered for flow {0}")]
    UnknownFlow(FlowKind),

    /// A handler asked to go to a step its flow does not declare.
    #[error("flow {flow} has no step {step}")]
    UndeclaredStep {
        /// Active flow.
        flow: FlowKind,
        /// Requested step.
        step: &'static str,
    },

    /// Handoffs kept chaining past [`MAX_HANDOFFS`].
    #[error("handoff chain exceeded {MAX_HANDOFFS} hops")]
    HandoffLoop,
}

/// Tunables the flows consult.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowSettings {
    /// Radius used by "browse nearby" and sold-out alternatives.
    pub default_search_radius_km: f64,
    /// How long a posted catch stays listed.
    pub catch_ttl_hours: i64,
    /// Catch posts allowed per seller per rolling day.
    pub max_daily_catches_per_seller: u32,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            default_search_radius_km: 10.0,
            catch_ttl_hours: 12,
            max_daily_catches_per_seller: 5,
        }
    }
}

/// Everything handlers are constructed from.
#[derive(Debug, Clone)]
pub struct FlowDeps {
    /// Store handles.
    pub stores: Stores,
    /// Rate-limited sender.
    pub outbound: Arc<Outbound>,
    /// Job queue for follow-up work.
    pub queue: Arc<dyn JobQueue>,
    /// Tunables.
    pub settings: FlowSettings,
}

/// One business workflow.
#[async_trait]
pub trait FlowHandler: Send + Sync + std::fmt::Debug {
    /// Flow this handler implements.
    fn kind(&self) -> FlowKind;

    /// Persisted ids of every step this flow can be in.
    fn steps(&self) -> &'static [&'static str];

    /// `true` if `step` is one of this flow's steps.
    fn declares(&self, step: &str) -> bool {
        self.steps().contains(&step)
    }

    /// Enters the flow: sends the first prompt and names the first step.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError`] when a store or queue call fails.
    async fn start(&self, session: &Session, seed: Option<Seed>) -> Result<Transition, FlowError>;

    /// Handles a message at the session's current step.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError`] when a store or queue call fails.
    async fn handle(
        &self,
        message: &IncomingMessage,
        session: &Session,
    ) -> Result<Transition, FlowError>;

    /// Explains what was expected and re-prompts the current step.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError`] when a store call needed for the prompt fails.
    async fn handle_invalid_input(
        &self,
        message: &IncomingMessage,
        session: &Session,
    ) -> Result<Transition, FlowError>;
}

/// Decodes the session's draft, falling back to an empty one.
pub(crate) fn draft<D: DeserializeOwned + Default>(session: &Session) -> D {
    if session.temp_data.is_null() {
        return D::default();
    }
    serde_json::from_value(session.temp_data.clone()).unwrap_or_else(|e| {
        tracing::warn!(phone = %session.phone, flow = %session.flow, error = %e, "discarding undecodable draft");
        D::default()
    })
}

/// Current step of `session` as `S`, if it parses.
pub(crate) fn current_step<S: FlowStep>(session: &Session) -> Option<S> {
    session.step().and_then(S::parse)
}

/// Shared "didn't understand" preface.
pub(crate) const NOT_UNDERSTOOD: &str = "Sorry, I didn't understand that.";
