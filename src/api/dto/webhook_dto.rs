//! Webhook verification query and acknowledgement body.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Query string of the provider's subscription handshake.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct VerifyQuery {
    /// Always `subscribe` for a real handshake.
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    /// Token configured on the provider side.
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    /// Value to echo back on success.
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Body of every `POST /webhook` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AckResponse {
    /// Always `received`.
    pub status: String,
}

impl AckResponse {
    /// The one acknowledgement the endpoint ever sends.
    #[must_use]
    pub fn received() -> Self {
        Self {
            status: "received".to_string(),
        }
    }
}
