//! Daily Reset Scheduler
//!
//! Rolls the registry's per-day counters over at every UTC midnight.

use crate::registry::SessionRegistry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Time left until the next UTC midnight. Exactly at midnight this is a
/// full day, so a rollover that just fired is never repeated.
pub fn duration_until_next_midnight(now: DateTime<Utc>) -> Duration {
    let next_day = now.date_naive() + ChronoDuration::days(1);
    let Some(midnight) = next_day.and_hms_opt(0, 0, 0) else {
        return Duration::from_secs(24 * 60 * 60);
    };
    (midnight.and_utc() - now)
        .to_std()
        .unwrap_or_else(|_| Duration::from_secs(24 * 60 * 60))
}

pub struct DailyResetScheduler {
    registry: Arc<SessionRegistry>,
}

impl DailyResetScheduler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped)
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let wait = duration_until_next_midnight(Utc::now());
                info!("Next daily reset in {}m", wait.as_secs() / 60);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        let count = self.registry.reset_daily();
                        info!("UTC midnight rollover: {} tenants reset", count);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Daily reset scheduler stopped");
                            break;
                        }
                        warn!("Daily reset scheduler woke without shutdown; rescheduling");
                    }
                }
            }
        })
    }
}
