//! Job openings posted over chat.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geo::GeoPoint;
use super::ids::JobPostId;

/// A posted job opening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPost {
    /// Job post id.
    pub id: JobPostId,
    /// Employer phone.
    pub employer_phone: String,
    /// Short role title.
    pub title: String,
    /// Daily pay in paise.
    pub daily_pay: i64,
    /// Work site, when shared.
    pub location: Option<GeoPoint>,
    /// Posting time.
    pub created_at: DateTime<Utc>,
}
