//! Durable per-sender conversation state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Business workflows a session can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Top-level menu; the resting state.
    MainMenu,
    /// Subscribe to (or manage) fresh-catch alerts.
    FishAlertSubscribe,
    /// Seller posts a new catch.
    FishSell,
    /// Seller updates stock status of a posted catch.
    FishStock,
    /// Buyer browses nearby catches.
    FishBrowse,
    /// Record a lend/borrow agreement.
    Agreement,
    /// Post a job opening.
    JobPost,
}

impl FlowKind {
    /// Every flow.
    pub const ALL: [Self; 7] = [
        Self::MainMenu,
        Self::FishAlertSubscribe,
        Self::FishSell,
        Self::FishStock,
        Self::FishBrowse,
        Self::Agreement,
        Self::JobPost,
    ];

    /// Storage form persisted in `current_flow`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MainMenu => "main_menu",
            Self::FishAlertSubscribe => "fish_alert_subscribe",
            Self::FishSell => "fish_sell",
            Self::FishStock => "fish_stock",
            Self::FishBrowse => "fish_browse",
            Self::Agreement => "agreement",
            Self::JobPost => "job_post",
        }
    }

    /// Parses the storage form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == s)
    }

    /// Flows whose steps trigger multi-service side effects. Messages for
    /// these are processed by the worker pool rather than inline.
    #[must_use]
    pub const fn is_complex(self) -> bool {
        matches!(self, Self::FishSell | Self::Agreement)
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per sender phone.
///
/// `step` is scoped to `flow` and is `None` when unset; `temp_data` holds
/// the serialized draft of the active flow only. Only the flow router
/// writes `flow`, `step` and `temp_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Sender phone; unique key.
    pub phone: String,
    /// Active flow.
    pub flow: FlowKind,
    /// Active step within `flow`.
    pub step: Option<String>,
    /// Typed draft of the active flow, serialized.
    pub temp_data: serde_json::Value,
    /// Last time a message for this sender was handled.
    pub last_activity_at: DateTime<Utc>,
    /// Optimistic-concurrency token, bumped on every save.
    pub version: i64,
}

impl Session {
    /// Idle step of the main menu flow.
    pub const IDLE: &'static str = "idle";

    /// A fresh session parked at the main menu.
    #[must_use]
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            flow: FlowKind::MainMenu,
            step: Some(Self::IDLE.to_string()),
            temp_data: serde_json::Value::Null,
            last_activity_at: Utc::now(),
            version: 0,
        }
    }

    /// Rebuilds a session from its persisted columns. An unknown flow id
    /// decodes as the main menu with no step so the router restarts it.
    #[must_use]
    pub fn from_columns(
        phone: String,
        flow: &str,
        step: Option<String>,
        temp_data: Option<serde_json::Value>,
        last_activity_at: DateTime<Utc>,
        version: i64,
    ) -> Self {
        let (flow, step) = match FlowKind::parse(flow) {
            Some(kind) => (kind, step),
            None => {
                tracing::warn!(%phone, flow, "unknown flow id in stored session");
                (FlowKind::MainMenu, None)
            }
        };
        Self {
            phone,
            flow,
            step,
            temp_data: temp_data.unwrap_or(serde_json::Value::Null),
            last_activity_at,
            version,
        }
    }

    /// Current step as a string slice.
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        self.step.as_deref()
    }

    /// Moves to `flow`/`step`, replacing the scratch data.
    pub fn enter(&mut self, flow: FlowKind, step: &str, temp_data: serde_json::Value) {
        self.flow = flow;
        self.step = Some(step.to_string());
        self.temp_data = temp_data;
    }

    /// Returns to the idle main menu and clears scratch data.
    pub fn reset(&mut self) {
        self.enter(FlowKind::MainMenu, Self::IDLE, serde_json::Value::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_idle_main_menu() {
        let s = Session::new("919800000001");
        assert_eq!(s.flow, FlowKind::MainMenu);
        assert_eq!(s.step(), Some(Session::IDLE));
        assert!(s.temp_data.is_null());
        assert_eq!(s.version, 0);
    }

    #[test]
    fn unknown_flow_column_decodes_as_unset_main_menu() {
        let s = Session::from_columns(
            "91".to_string(),
            "legacy_flow",
            Some("ask_x".to_string()),
            None,
            Utc::now(),
            3,
        );
        assert_eq!(s.flow, FlowKind::MainMenu);
        assert_eq!(s.step(), None);
        assert_eq!(s.version, 3);
    }

    #[test]
    fn flow_kind_round_trips() {
        for kind in FlowKind::ALL {
            assert_eq!(FlowKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn reset_clears_scratch() {
        let mut s = Session::new("91");
        s.enter(FlowKind::JobPost, "ask_pay", serde_json::json!({"title": "Deckhand"}));
        s.reset();
        assert_eq!(s.flow, FlowKind::MainMenu);
        assert!(s.temp_data.is_null());
    }
}
