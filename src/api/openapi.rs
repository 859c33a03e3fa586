//! OpenAPI document for the HTTP surface.

use utoipa::OpenApi;

use crate::api::dto::AckResponse;
use crate::api::handlers::{system, webhook};
use crate::error::{ErrorBody, ErrorResponse};

/// Generated OpenAPI description.
#[derive(Debug, OpenApi)]
#[openapi(
    info(title = "dockside", description = "Chat marketplace webhook gateway"),
    paths(
        webhook::verify_webhook,
        webhook::receive_webhook,
        system::health_handler,
    ),
    components(schemas(AckResponse, ErrorResponse, ErrorBody, system::HealthResponse)),
    tags(
        (name = "Webhook", description = "Provider webhook"),
        (name = "System", description = "Operational endpoints"),
    )
)]
pub struct ApiDoc;

/// Path of the generated JSON document.
pub const OPENAPI_PATH: &str = "/api-docs/openapi.json";
