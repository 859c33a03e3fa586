//! At-most-once gate for inbound message ids.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::persistence::ProcessedStore;

/// Verdict for one message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting; process it.
    New,
    /// Seen before; drop it.
    Duplicate,
}

/// Two-tier deduplication: an in-process TTL cache in front of the durable
/// processed-id store.
///
/// An id is recorded before any processing happens, so a crash between
/// the mark and the effect loses that message instead of running it twice.
/// The durable insert-if-absent decides races between processes; the cache
/// decides races within one process and covers durable-store outages.
#[derive(Debug)]
pub struct DedupGate {
    seen: DashMap<String, Instant>,
    ttl: Duration,
    processed: Arc<dyn ProcessedStore>,
}

impl DedupGate {
    /// Creates a gate whose cache entries live for `ttl`.
    #[must_use]
    pub fn new(processed: Arc<dyn ProcessedStore>, ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
            processed,
        }
    }

    /// Records `message_id` and reports whether this call saw it first.
    pub async fn accept(&self, message_id: &str) -> DedupOutcome {
        if message_id.trim().is_empty() {
            tracing::warn!("message without id; dropping");
            return DedupOutcome::Duplicate;
        }

        let now = Instant::now();
        match self.seen.entry(message_id.to_string()) {
            Entry::Occupied(mut e) => {
                if now.duration_since(*e.get()) < self.ttl {
                    tracing::debug!(message_id, "duplicate (cache)");
                    return DedupOutcome::Duplicate;
                }
                e.insert(now);
            }
            Entry::Vacant(e) => {
                e.insert(now);
            }
        }

        match self.processed.mark_processed(message_id, Utc::now()).await {
            Ok(true) => DedupOutcome::New,
            Ok(false) => {
                tracing::debug!(message_id, "duplicate (store)");
                DedupOutcome::Duplicate
            }
            Err(e) => {
                tracing::warn!(message_id, error = %e, "processed store unavailable; trusting cache");
                DedupOutcome::New
            }
        }
    }

    /// Drops cache entries older than the TTL.
    pub fn prune(&self) {
        let ttl = self.ttl;
        self.seen.retain(|_, at| at.elapsed() < ttl);
    }

    /// Ids currently cached.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.seen.len()
    }
}
