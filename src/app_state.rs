//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::service::Services;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Every long-lived service.
    pub services: Services,
    /// Token expected during the webhook handshake.
    pub verify_token: Arc<str>,
}

impl AppState {
    /// Creates the state.
    #[must_use]
    pub fn new(services: Services, verify_token: &str) -> Self {
        Self {
            services,
            verify_token: Arc::from(verify_token),
        }
    }
}
