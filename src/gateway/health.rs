//! Route health - shared breaker + geo-block kill-switch
//!
//! One `RouteHealth` is created at process start and shared (via `Arc`)
//! between the gateway, the session registry and the status API.
//!
//! Kill-switch lifecycle: armed at start. A 403/451 from upstream trips it
//! and it stays tripped until an operator re-arms it or the process
//! restarts. Nothing in the request path ever re-arms it.

use crate::config::ProxyConfig;
use crate::gateway::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::gateway::route::{select_route, RouteDecision};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Details of the response that tripped the kill-switch
#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchTrip {
    pub status: u16,
    pub url: String,
    pub tripped_at: DateTime<Utc>,
}

/// Process-wide trading kill-switch
pub struct KillSwitch {
    enabled: AtomicBool,
    last_trip: RwLock<Option<KillSwitchTrip>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            last_trip: RwLock::new(None),
        }
    }

    /// True while trading is allowed
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Disable trading after a geo-block. Returns true on the first trip.
    pub fn trip(&self, status: u16, url: &str) -> bool {
        let was_enabled = self.enabled.swap(false, Ordering::SeqCst);
        if was_enabled {
            *self.last_trip.write() = Some(KillSwitchTrip {
                status,
                url: url.to_string(),
                tripped_at: Utc::now(),
            });
            error!(
                "🛑 GEO-BLOCK detected (HTTP {} from {}) - kill-switch engaged, trading halted until operator re-arm",
                status, url
            );
        }
        was_enabled
    }

    /// Operator override. Clears the trip record.
    pub fn rearm(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        *self.last_trip.write() = None;
        warn!("Kill-switch re-armed by operator");
    }

    pub fn last_trip(&self) -> Option<KillSwitchTrip> {
        self.last_trip.read().clone()
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned, lock-guarded outbound routing state
pub struct RouteHealth {
    breaker: Mutex<CircuitBreaker>,
    kill_switch: KillSwitch,
}

impl RouteHealth {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        info!(
            "RouteHealth initialized: failure_threshold={}, cooldown={}s",
            failure_threshold,
            cooldown.as_secs()
        );
        Self {
            breaker: Mutex::new(CircuitBreaker::new(failure_threshold, cooldown)),
            kill_switch: KillSwitch::new(),
        }
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    /// Select a route against the breaker state at `now`
    pub fn route_for(&self, now: Instant, proxy: &ProxyConfig) -> RouteDecision {
        let breaker = self.breaker.lock();
        select_route(now, &breaker, proxy)
    }

    pub fn record_success(&self) {
        let mut breaker = self.breaker.lock();
        if breaker.consecutive_failures() > 0 {
            info!("Outbound call succeeded - proxy circuit reset");
        }
        breaker.record_success();
    }

    /// Returns true if this failure opened the breaker
    pub fn record_failure(&self, now: Instant) -> bool {
        let mut breaker = self.breaker.lock();
        let tripped = breaker.record_failure(now);
        if tripped {
            warn!(
                "Proxy circuit OPEN after {} consecutive failures - routing direct for {}s",
                breaker.consecutive_failures(),
                breaker.cooldown().as_secs()
            );
        }
        tripped
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.breaker.lock().is_open(now)
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.lock().snapshot(Instant::now())
    }
}
