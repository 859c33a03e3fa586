//! Messenger that records instead of calling the provider.
//!
//! Backs `OUTBOUND_DRY_RUN` deployments and every test that needs to see
//! what the bot said.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Messenger, MessengerError, OutboundMessage, SentMessage};

/// Records every message and answers with synthetic provider ids.
#[derive(Debug, Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<OutboundMessage>>,
    failing: Mutex<HashSet<String>>,
    latency: Mutex<Duration>,
    counter: AtomicU64,
}

impl RecordingMessenger {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later send to `phone` fail with a provider rejection.
    pub fn fail_for(&self, phone: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(phone.to_string());
        }
    }

    /// Makes every later send take `latency` before it is recorded.
    pub fn slow_down(&self, latency: Duration) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    /// Every message sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Messages sent to `phone`.
    #[must_use]
    pub fn sent_to(&self, phone: &str) -> Vec<OutboundMessage> {
        self.sent().into_iter().filter(|m| m.to == phone).collect()
    }

    /// Forgets recorded messages.
    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send(&self, message: &OutboundMessage) -> Result<SentMessage, MessengerError> {
        message.validate()?;
        let latency = self.latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let rejected = self
            .failing
            .lock()
            .map(|f| f.contains(&message.to))
            .unwrap_or(false);
        if rejected {
            return Err(MessengerError::Rejected {
                status: 400,
                body: "recipient unavailable".to_string(),
            });
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        tracing::info!(to = %message.to, body = ?message.body, "dry-run send");
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.clone());
        }
        Ok(SentMessage {
            provider_message_id: Some(format!("wamid.dry-run.{n}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_assigns_ids() {
        let messenger = RecordingMessenger::new();
        let first = messenger.send(&OutboundMessage::text("91", "a")).await;
        let second = messenger.send(&OutboundMessage::text("92", "b")).await;
        assert_ne!(first, second);
        assert_eq!(messenger.sent().len(), 2);
        assert_eq!(messenger.sent_to("92").len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_not_recorded() {
        let messenger = RecordingMessenger::new();
        messenger.fail_for("91");
        let result = messenger.send(&OutboundMessage::text("91", "a")).await;
        assert!(matches!(result, Err(MessengerError::Rejected { status: 400, .. })));
        assert!(messenger.sent().is_empty());
    }
}
