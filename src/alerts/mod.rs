//! Proximity alert matching and notification.
//!
//! [`AlertEngine`] is driven entirely by jobs: a new catch fans out to
//! matching subscribers, digest sweeps flush batched alerts, and a catch
//! selling out offers nearby alternatives to buyers who were on their way.
//! Every send goes through the broadcast lane of
//! [`crate::dispatch::Outbound`].

pub mod digest;
pub mod engine;
pub mod housekeeping;
pub mod scheduler;
pub mod sold_out;

pub use digest::DigestSummary;
pub use engine::{AlertEngine, MatchSummary};
pub use scheduler::{Scheduler, due_sweeps};
pub use sold_out::SoldOutSummary;

/// Reason recorded on alerts whose catch sold out or expired before the
/// digest went out.
pub const CATCH_UNAVAILABLE: &str = "catch_unavailable";

/// Alternatives offered per buyer when a catch sells out.
pub const MAX_ALTERNATIVES: usize = 3;
