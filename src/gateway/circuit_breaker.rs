//! Proxy circuit breaker
//!
//! Counts consecutive connectivity failures on the outbound path. Once the
//! count reaches the threshold the breaker opens for a cooldown window,
//! during which the route selector falls back to a direct connection.
//! A single success closes it again.
//!
//! This type does no locking and no I/O; `RouteHealth` owns the shared
//! instance behind a mutex.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Failure-counting state machine
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    disabled_until: Option<Instant>,
}

/// Serializable view of the breaker for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub is_open: bool,
    pub cooldown_remaining_ms: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            disabled_until: None,
        }
    }

    /// Record a connectivity failure.
    ///
    /// The count saturates at the threshold. Every failure at the threshold
    /// (re)starts the cooldown window from `now`. Returns true when this
    /// failure moved the breaker from closed to open.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        let was_open = self.is_open(now);

        if self.consecutive_failures < self.threshold {
            self.consecutive_failures += 1;
        }

        if self.consecutive_failures >= self.threshold {
            self.disabled_until = Some(now + self.cooldown);
            return !was_open;
        }

        false
    }

    /// Record a successful call: closes the breaker and clears the count
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.disabled_until = None;
    }

    /// True while the cooldown window is active
    pub fn is_open(&self, now: Instant) -> bool {
        matches!(self.disabled_until, Some(until) if now < until)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn disabled_until(&self) -> Option<Instant> {
        self.disabled_until
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        let remaining = self
            .disabled_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();

        BreakerSnapshot {
            consecutive_failures: self.consecutive_failures,
            threshold: self.threshold,
            is_open: self.is_open(now),
            cooldown_remaining_ms: remaining.as_millis() as u64,
        }
    }
}
