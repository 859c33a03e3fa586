//! HTTP layer: webhook and system handlers, DTOs, router composition.

pub mod dto;
pub mod handlers;
pub mod openapi;

use std::time::Duration;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::app_state::AppState;
use openapi::{ApiDoc, OPENAPI_PATH};

/// Server-side cap on any request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Builds the complete router: webhook, health and the OpenAPI document
/// (plus Swagger UI with the `swagger-ui` feature).
pub fn build_router() -> Router<AppState> {
    Router::new()
        .merge(handlers::webhook::routes())
        .merge(handlers::system::routes())
        .merge(docs_routes())
}

/// The served application: [`build_router`] with tracing, permissive CORS
/// and [`REQUEST_TIMEOUT`], bound to `state`.
pub fn build_app(state: AppState) -> Router {
    build_router()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(state)
}

#[cfg(feature = "swagger-ui")]
fn docs_routes() -> Router<AppState> {
    Router::new().merge(utoipa_swagger_ui::SwaggerUi::new("/swagger-ui").url(OPENAPI_PATH, ApiDoc::openapi()))
}

#[cfg(not(feature = "swagger-ui"))]
fn docs_routes() -> Router<AppState> {
    use axum::routing::get;

    Router::new().route(OPENAPI_PATH, get(|| async { axum::Json(ApiDoc::openapi()) }))
}
