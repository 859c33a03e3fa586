//! # dockside
//!
//! Chat-driven marketplace gateway. Buyers and sellers of fresh fish,
//! people recording small loans and employers posting day jobs all talk to
//! the service through a messaging provider's webhook.
//!
//! Every inbound message is deduplicated, routed to the one conversation
//! flow its sender is in, and answered through a rate-limited sender.
//! New catches are matched against nearby subscribers and fanned out as
//! alerts, immediately or in scheduled digests.
//!
//! ## Architecture
//!
//! ```text
//! Provider webhook (api/)
//!     │
//!     ├── IngestionService (service/)
//!     │     ├── DedupGate
//!     │     ├── Normalizer
//!     │     └── Dispatch decision (dispatch/)
//!     │
//!     ├── ConversationService ── FlowRouter ── flow handlers (flow/)
//!     │
//!     ├── Job queue + WorkerPool (dispatch/)
//!     │     └── AlertEngine (alerts/)
//!     │
//!     ├── Outbound ── Messenger (messaging/)
//!     │
//!     └── Stores: in-memory or PostgreSQL (persistence/)
//! ```

pub mod alerts;
pub mod api;
pub mod app_state;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod flow;
pub mod messaging;
pub mod persistence;
pub mod service;
