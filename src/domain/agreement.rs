//! Lend/borrow agreements recorded between two chat users.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ids::AgreementId;

/// Which side of the debt the creator is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementDirection {
    /// Creator lent money to the counterparty.
    Lent,
    /// Creator borrowed money from the counterparty.
    Borrowed,
}

impl AgreementDirection {
    /// Storage form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lent => "lent",
            Self::Borrowed => "borrowed",
        }
    }

    /// Parses the storage form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lent" => Some(Self::Lent),
            "borrowed" => Some(Self::Borrowed),
            _ => None,
        }
    }
}

/// Counterparty confirmation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementStatus {
    /// Waiting for the counterparty.
    Pending,
    /// Counterparty confirmed.
    Accepted,
    /// Counterparty disputed.
    Rejected,
}

impl AgreementStatus {
    /// Storage form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    /// Parses the storage form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A recorded debt between two phones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agreement {
    /// Agreement id.
    pub id: AgreementId,
    /// Phone that recorded it.
    pub creator_phone: String,
    /// The other party.
    pub counterparty_phone: String,
    /// Creator's side.
    pub direction: AgreementDirection,
    /// Amount in paise.
    pub amount: i64,
    /// Free-text purpose.
    pub purpose: String,
    /// Repayment date.
    pub due_date: NaiveDate,
    /// Confirmation state.
    pub status: AgreementStatus,
    /// When the due-date reminder went out.
    pub reminded_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}
