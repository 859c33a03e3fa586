//! Provider webhook: subscription handshake and event delivery.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::api::dto::{AckResponse, VerifyQuery};
use crate::app_state::AppState;
use crate::error::{DocksideError, ErrorResponse};

/// Header carrying the body's HMAC-SHA256.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Longest a delivery is held before it is acknowledged. Ingestion keeps
/// running afterwards. Stays below the server's request timeout.
pub const ACK_DEADLINE: Duration = Duration::from_secs(10);

/// `GET /webhook` — Subscription handshake.
///
/// # Errors
///
/// Returns [`DocksideError::VerificationFailed`] unless the mode is
/// `subscribe` and the token matches the configured one.
#[utoipa::path(
    get,
    path = "/webhook",
    tag = "Webhook",
    summary = "Verify webhook subscription",
    description = "Echoes `hub.challenge` when `hub.verify_token` matches the configured token.",
    params(VerifyQuery),
    responses(
        (status = 200, description = "Challenge echoed", body = String),
        (status = 403, description = "Token mismatch", body = ErrorResponse),
    )
)]
pub async fn verify_webhook(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Result<impl IntoResponse, DocksideError> {
    let expected = state.verify_token.trim();
    let observed = query.verify_token.as_deref().map(str::trim).unwrap_or_default();
    if query.mode.as_deref() == Some("subscribe") && !expected.is_empty() && observed == expected {
        tracing::info!("webhook subscription verified");
        return Ok((StatusCode::OK, query.challenge.unwrap_or_default()));
    }
    tracing::warn!(mode = ?query.mode, "webhook verification rejected");
    Err(DocksideError::VerificationFailed)
}

/// `POST /webhook` — Event delivery.
///
/// Always answers 200 so the provider never retries a payload we have
/// already seen; every failure is logged instead. Bodies of any size are
/// accepted, and a delivery still ingesting after [`ACK_DEADLINE`] is
/// acknowledged while ingestion finishes in the background.
#[utoipa::path(
    post,
    path = "/webhook",
    tag = "Webhook",
    summary = "Receive webhook events",
    description = "Accepts message and status notifications. Responds 200 regardless of payload validity.",
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 200, description = "Payload acknowledged", body = AckResponse),
    )
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let ingestion = Arc::clone(&state.services.ingestion);
    let bytes = body.len();
    let mut task = tokio::spawn(async move { ingestion.ingest(signature.as_deref(), &body).await });

    match tokio::time::timeout(ACK_DEADLINE, &mut task).await {
        Ok(Ok(report)) => tracing::debug!(
            messages = report.messages,
            duplicates = report.duplicates,
            deferred = report.deferred,
            "webhook acknowledged"
        ),
        Ok(Err(e)) => tracing::error!(error = %e, bytes, "webhook ingestion aborted"),
        Err(_) => tracing::warn!(deadline = ?ACK_DEADLINE, bytes, "ingestion still running; acknowledged early"),
    }
    (StatusCode::OK, Json(AckResponse::received()))
}

/// Webhook routes. The body limit is lifted: a large batch is still a
/// delivery to acknowledge.
pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/webhook",
        get(verify_webhook).post(receive_webhook).layer(DefaultBodyLimit::disable()),
    )
}
