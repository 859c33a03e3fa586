//! Load, route and save one sender's session under a per-sender lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::domain::IncomingMessage;
use crate::flow::{FlowRouter, RouteOutcome};
use crate::persistence::{SessionStore, StoreError};

/// One async mutex per sender so two messages from the same phone never
/// interleave their load, route and save.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `phone`, created on first use.
    #[must_use]
    pub fn lock_for(&self, phone: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(phone.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Drops locks nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Senders currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// `true` when no sender is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Runs inbound messages through the flow router.
#[derive(Debug)]
pub struct ConversationService {
    sessions: Arc<dyn SessionStore>,
    router: Arc<FlowRouter>,
    locks: Arc<SessionLocks>,
}

impl ConversationService {
    /// Creates the service.
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionStore>, router: Arc<FlowRouter>, locks: Arc<SessionLocks>) -> Self {
        Self {
            sessions,
            router,
            locks,
        }
    }

    /// Lock table shared with the maintenance loop.
    #[must_use]
    pub fn locks(&self) -> &Arc<SessionLocks> {
        &self.locks
    }

    /// Processes `message` for its sender.
    ///
    /// A save that loses the version check is logged and its transition
    /// discarded; messages already sent by the handler stay sent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the session cannot be loaded or saved for
    /// a reason other than a concurrent update.
    pub async fn process(&self, message: &IncomingMessage) -> Result<RouteOutcome, StoreError> {
        let lock = self.locks.lock_for(&message.from);
        let _guard = lock.lock().await;

        let mut session = self.sessions.load_or_create(&message.from).await?;
        let outcome = self.router.route(message, &mut session).await;

        match self.sessions.save(&session).await {
            Ok(saved) => {
                tracing::debug!(
                    phone = %saved.phone,
                    flow = %saved.flow,
                    step = ?saved.step,
                    version = saved.version,
                    message_id = %message.message_id,
                    "session saved"
                );
            }
            Err(StoreError::Conflict { phone, expected }) => {
                tracing::warn!(
                    %phone,
                    expected,
                    message_id = %message.message_id,
                    "session changed concurrently; transition discarded"
                );
            }
            Err(e) => return Err(e),
        }
        Ok(outcome)
    }
}
