//! Fixed-window rate limiters for outbound sends.
//!
//! Each limiter counts sends per key inside the current window and denies
//! once the window's budget is spent, reporting how long until the window
//! rolls over. Denied sends are re-queued by the caller, never dropped.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::Lane;

/// Counts events per key in fixed windows of `window`.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    name: &'static str,
    limit: u32,
    window: Duration,
    epoch: Instant,
    counters: DashMap<String, (u64, u32)>,
}

impl FixedWindowLimiter {
    /// Creates a limiter allowing `limit` events per `window` per key. A
    /// zero limit is raised to one.
    #[must_use]
    pub fn new(name: &'static str, limit: u32, window: Duration) -> Self {
        Self {
            name,
            limit: limit.max(1),
            window: window.max(Duration::from_millis(1)),
            epoch: Instant::now(),
            counters: DashMap::new(),
        }
    }

    fn window_index(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch).as_millis();
        let index = elapsed / self.window.as_millis().max(1);
        u64::try_from(index).unwrap_or(u64::MAX)
    }

    fn until_next_window(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.epoch).as_millis();
        let window = self.window.as_millis().max(1);
        let remaining = window.saturating_sub(elapsed % window);
        Duration::from_millis(u64::try_from(remaining).unwrap_or(u64::MAX))
    }

    /// Takes one unit of budget for `key`.
    ///
    /// # Errors
    ///
    /// Returns the delay until the current window ends when the budget is
    /// spent.
    pub fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let index = self.window_index(now);
        let mut slot = self.counters.entry(key.to_string()).or_insert((index, 0));
        let (slot_index, count) = slot.value_mut();
        if *slot_index != index {
            *slot_index = index;
            *count = 0;
        }
        if *count >= self.limit {
            let retry_after = self.until_next_window(now);
            tracing::debug!(limiter = self.name, key, ?retry_after, "rate limit reached");
            return Err(retry_after);
        }
        *count = count.saturating_add(1);
        Ok(())
    }

    /// Gives back a unit taken by [`FixedWindowLimiter::try_acquire`] in
    /// the current window. No-op once the window has rolled over.
    pub fn release(&self, key: &str) {
        let index = self.window_index(Instant::now());
        if let Some(mut slot) = self.counters.get_mut(key) {
            let (slot_index, count) = slot.value_mut();
            if *slot_index == index {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Drops counters of past windows.
    pub fn prune(&self) {
        let index = self.window_index(Instant::now());
        self.counters.retain(|_, (slot_index, _)| *slot_index == index);
    }

    /// Keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }
}

/// The three outbound budgets.
#[derive(Debug)]
pub struct OutboundLimits {
    /// All conversational sends, per second.
    pub global: FixedWindowLimiter,
    /// Sends to one recipient, per minute.
    pub per_recipient: FixedWindowLimiter,
    /// Broadcast (alert) sends, per second.
    pub broadcast: FixedWindowLimiter,
}

/// Key shared by the global and broadcast limiters.
const ALL: &str = "*";

impl OutboundLimits {
    /// Builds the limiters from per-window budgets.
    #[must_use]
    pub fn new(global_per_second: u32, per_recipient_per_minute: u32, broadcast_per_second: u32) -> Self {
        Self {
            global: FixedWindowLimiter::new("global", global_per_second, Duration::from_secs(1)),
            per_recipient: FixedWindowLimiter::new(
                "per_recipient",
                per_recipient_per_minute,
                Duration::from_secs(60),
            ),
            broadcast: FixedWindowLimiter::new(
                "broadcast",
                broadcast_per_second,
                Duration::from_secs(1),
            ),
        }
    }

    /// Checks the per-recipient budget, then the lane budget. A send the
    /// lane denies does not keep its recipient unit.
    ///
    /// # Errors
    ///
    /// Returns the delay after which a retry may succeed.
    pub fn admit(&self, lane: Lane, recipient: &str) -> Result<(), Duration> {
        self.per_recipient.try_acquire(recipient)?;
        let lane_limiter = match lane {
            Lane::Conversational => &self.global,
            Lane::Broadcast => &self.broadcast,
        };
        lane_limiter.try_acquire(ALL).inspect_err(|_| self.per_recipient.release(recipient))
    }

    /// Drops stale counters.
    pub fn prune(&self) {
        self.global.prune();
        self.per_recipient.prune();
        self.broadcast.prune();
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denies_after_budget_and_resets_next_window() {
        tokio::time::pause();
        let limiter = FixedWindowLimiter::new("t", 2, Duration::from_secs(1));
        assert!(limiter.try_acquire("a").is_ok());
        assert!(limiter.try_acquire("a").is_ok());
        let Err(wait) = limiter.try_acquire("a") else {
            panic!("third acquire must be denied");
        };
        assert!(wait <= Duration::from_secs(1));
        assert!(limiter.try_acquire("b").is_ok(), "keys are independent");

        tokio::time::advance(wait).await;
        assert!(limiter.try_acquire("a").is_ok());
    }

    #[tokio::test]
    async fn prune_forgets_old_windows() {
        tokio::time::pause();
        let limiter = FixedWindowLimiter::new("t", 1, Duration::from_secs(1));
        let _ = limiter.try_acquire("a");
        let _ = limiter.try_acquire("b");
        assert_eq!(limiter.tracked_keys(), 2);
        tokio::time::advance(Duration::from_secs(2)).await;
        limiter.prune();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn recipient_budget_applies_across_lanes() {
        tokio::time::pause();
        let limits = OutboundLimits::new(100, 1, 100);
        assert!(limits.admit(Lane::Conversational, "91").is_ok());
        assert!(limits.admit(Lane::Broadcast, "91").is_err());
        assert!(limits.admit(Lane::Broadcast, "92").is_ok());
    }

    #[tokio::test]
    async fn lane_denial_keeps_the_recipient_budget() {
        tokio::time::pause();
        let limits = OutboundLimits::new(1, 1, 100);
        assert!(limits.admit(Lane::Conversational, "a").is_ok());
        let Err(wait) = limits.admit(Lane::Conversational, "b") else {
            panic!("global budget is spent");
        };
        assert!(wait <= Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limits.admit(Lane::Conversational, "b").is_ok());
    }

    #[tokio::test]
    async fn release_only_refunds_the_current_window() {
        tokio::time::pause();
        let limiter = FixedWindowLimiter::new("t", 1, Duration::from_secs(1));
        assert!(limiter.try_acquire("a").is_ok());
        limiter.release("a");
        assert!(limiter.try_acquire("a").is_ok());

        tokio::time::advance(Duration::from_secs(1)).await;
        limiter.release("a");
        assert!(limiter.try_acquire("a").is_ok());
        assert!(limiter.try_acquire("a").is_err());
    }
}
