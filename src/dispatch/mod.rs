//! Dispatch engine: rate-limited outbound sends, the background job queue,
//! the inline-versus-background decision and the worker pool.

pub mod decision;
pub mod outbound;
pub mod queue;
pub mod rate_limit;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use decision::{Dispatch, decide};
pub use outbound::{Delivery, Outbound};
pub use queue::{
    FailOutcome, Job, JobQueue, MAX_ATTEMPTS, MemoryJobQueue, QueueError, QueuedJob, backoff,
};
pub use rate_limit::{FixedWindowLimiter, OutboundLimits};
pub use worker::{JobError, JobHandler, WorkerPool};

/// Which outbound budget a send draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Replies inside a conversation.
    Conversational,
    /// Alert fan-out, digests and other bulk notifications.
    Broadcast,
}
