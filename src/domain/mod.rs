//! Domain layer: identifiers, geography, conversation and marketplace model.
//!
//! Everything here is plain data plus invariant-preserving constructors;
//! no I/O happens in this module.

pub mod agreement;
pub mod fish;
pub mod geo;
pub mod ids;
pub mod job;
pub mod message;
pub mod session;

pub use agreement::{Agreement, AgreementDirection, AgreementStatus};
pub use fish::{
    CatchStatus, ComingResponse, DeliveryFrequency, FishAlert, FishCatch, FishSubscription,
    FishTypeFilter, FishTypeId, Radius,
};
pub use geo::GeoPoint;
pub use ids::{AgreementId, AlertId, CatchId, JobPostId, SubscriptionId};
pub use job::JobPost;
pub use message::{DeliveryReceipt, IncomingMessage, MediaRef, MessageKind, ReceiptStatus};
pub use session::{FlowKind, Session};

/// Invariant violations raised when constructing domain values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DomainError {
    /// Latitude/longitude outside the valid range.
    #[error("invalid coordinates: ({lat}, {lon})")]
    InvalidCoordinates {
        /// Rejected latitude.
        lat: f64,
        /// Rejected longitude.
        lon: f64,
    },

    /// Alert radius outside 1–50 km.
    #[error("radius must be between 1 and 50 km, got {0}")]
    InvalidRadius(f64),

    /// Explicit species filter with no species.
    #[error("fish type filter must list at least one type or allow all")]
    EmptyFishTypeFilter,
}
