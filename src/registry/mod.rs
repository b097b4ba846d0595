//! Session Registry - per-tenant trading state
//!
//! One registry is constructed at startup and shared by `Arc` with every
//! caller. Each tenant's `SessionState` and `ExchangeBinding` live together
//! in a single map entry, so:
//! - every read-then-write on one tenant (`try_begin_trade`, `set_enabled`,
//!   `record_trade`) runs under that entry's lock,
//! - removal drops both records at once,
//! - whole-registry scans (`reset_daily`, `stats`) are atomic per tenant only.
//!
//! "Unknown tenant" and "not eligible" are return values, never errors.
//! No entry lock is ever held across an exchange / gateway call.

mod session;

pub use session::{
    BindingView, CanTrade, Credentials, ExchangeBinding, IneligibleReason, RegistryStats, RiskLimits,
    RiskLimitsUpdate, RiskProfile, SessionState, TradeRef, TradeStatus,
};
pub(crate) use session::redact_key;

use crate::exchange::ExchangeClient;
use crate::gateway::{KillSwitch, RouteHealth};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct TenantEntry {
    session: SessionState,
    binding: ExchangeBinding,
}

pub struct SessionRegistry {
    tenants: DashMap<String, TenantEntry>,
    route_health: Arc<RouteHealth>,
}

impl SessionRegistry {
    pub fn new(route_health: Arc<RouteHealth>) -> Self {
        Self {
            tenants: DashMap::new(),
            route_health,
        }
    }

    /// Create the tenant's records if absent. Existing tenants are left
    /// untouched (counters, credentials and limits survive). Returns true
    /// if the tenant was created by this call.
    pub fn initialize(&self, user_id: &str, profile: RiskProfile) -> bool {
        match self.tenants.entry(user_id.to_string()) {
            Entry::Occupied(_) => {
                debug!("Tenant {} already initialized", user_id);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(TenantEntry {
                    session: SessionState::new(profile),
                    binding: ExchangeBinding::new(),
                });
                info!("Tenant {} initialized ({:?} risk)", user_id, profile);
                true
            }
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.tenants.contains_key(user_id)
    }

    pub fn set_credentials(&self, user_id: &str, api_key: &str, api_secret: &str) -> bool {
        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            warn!("Rejected empty credentials for tenant {}", user_id);
            return false;
        }

        match self.tenants.get_mut(user_id) {
            Some(mut entry) => {
                let binding = &mut entry.binding;
                binding.api_key = Some(api_key.to_string());
                binding.api_secret = Some(api_secret.to_string());
                binding.connected = true;
                info!("Exchange credentials stored for tenant {}", user_id);
                true
            }
            None => {
                warn!("set_credentials: unknown tenant {}", user_id);
                false
            }
        }
    }

    /// Enabling re-verifies the exchange binding every time
    pub fn set_enabled(&self, user_id: &str, enabled: bool) -> bool {
        let Some(mut entry) = self.tenants.get_mut(user_id) else {
            warn!("set_enabled: unknown tenant {}", user_id);
            return false;
        };

        if enabled && !(entry.binding.connected && entry.binding.has_credentials()) {
            warn!("Cannot enable tenant {}: exchange not connected", user_id);
            return false;
        }

        entry.session.enabled = enabled;
        info!("Tenant {} trading {}", user_id, if enabled { "ENABLED" } else { "DISABLED" });
        true
    }

    pub fn can_trade(&self, user_id: &str) -> CanTrade {
        match self.tenants.get(user_id) {
            Some(entry) => evaluate(&entry, self.route_health.kill_switch()),
            None => CanTrade::denied(IneligibleReason::UnknownUser),
        }
    }

    /// Eligibility check and claim of the tenant's single execution slot,
    /// in one critical section. Callers must pair an allowed result with
    /// `finish_trade`.
    pub fn try_begin_trade(&self, user_id: &str) -> CanTrade {
        let Some(mut entry) = self.tenants.get_mut(user_id) else {
            return CanTrade::denied(IneligibleReason::UnknownUser);
        };

        let verdict = evaluate(&entry, self.route_health.kill_switch());
        if verdict.allowed {
            entry.session.executing_trade = true;
            debug!("Tenant {} execution slot claimed", user_id);
        }
        verdict
    }

    pub fn finish_trade(&self, user_id: &str) -> bool {
        match self.tenants.get_mut(user_id) {
            Some(mut entry) => {
                entry.session.executing_trade = false;
                true
            }
            None => false,
        }
    }

    /// Book a trade. Eligibility is the caller's responsibility.
    pub fn record_trade(&self, user_id: &str, trade: TradeRef) {
        let Some(mut entry) = self.tenants.get_mut(user_id) else {
            warn!("record_trade for unknown tenant {} - trade {} dropped", user_id, trade.id);
            return;
        };

        let session = &mut entry.session;
        session.total_trades += 1;
        session.today_trades += 1;
        if let Some(profit) = trade.profit {
            session.total_profit += profit;
            session.today_profit += profit;
        }
        info!(
            "Trade recorded for {}: {} {} {:.2} | today {}/{}",
            user_id,
            trade.side,
            trade.pair,
            trade.amount,
            session.today_trades,
            session.risk_limits.max_daily_trades
        );
        session.active_trades.push(trade);
    }

    /// Settle an open trade with its realized profit. Returns the closed
    /// trade, or `None` if the tenant or trade is unknown.
    pub fn close_trade(&self, user_id: &str, trade_id: &str, profit: f64) -> Option<TradeRef> {
        let mut entry = self.tenants.get_mut(user_id)?;
        let session = &mut entry.session;

        let idx = session.active_trades.iter().position(|t| t.id == trade_id)?;
        let mut trade = session.active_trades.remove(idx);
        if trade.profit.is_none() {
            session.total_profit += profit;
            session.today_profit += profit;
        }
        trade.profit = Some(profit);
        trade.status = TradeStatus::Completed;
        Some(trade)
    }

    /// Disable the tenant if today's profit is at or below its stop-loss.
    /// Returns true if the tenant was disabled by this call.
    pub fn enforce_stop_loss(&self, user_id: &str) -> bool {
        let Some(mut entry) = self.tenants.get_mut(user_id) else {
            return false;
        };

        let session = &mut entry.session;
        if session.enabled && session.today_profit <= session.risk_limits.stop_loss_threshold {
            session.enabled = false;
            warn!(
                "Stop-loss hit for {}: today {:.2} <= {:.2} - trading disabled",
                user_id, session.today_profit, session.risk_limits.stop_loss_threshold
            );
            return true;
        }
        false
    }

    /// Daily rollover. Atomic per tenant, not across tenants.
    pub fn reset_daily(&self) -> usize {
        let mut count = 0;
        for mut entry in self.tenants.iter_mut() {
            entry.session.today_trades = 0;
            entry.session.today_profit = 0.0;
            entry.binding.api_calls_today = 0;
            count += 1;
        }
        info!("Daily counters reset for {} tenants", count);
        count
    }

    /// Tenants that could start a trade right now, recomputed on every call
    pub fn list_eligible_users(&self) -> Vec<String> {
        let kill_switch = self.route_health.kill_switch();
        let mut users: Vec<String> = self
            .tenants
            .iter()
            .filter(|entry| evaluate(entry, kill_switch).allowed)
            .map(|entry| entry.key().clone())
            .collect();
        users.sort();
        users
    }

    pub fn remove(&self, user_id: &str) -> bool {
        let removed = self.tenants.remove(user_id).is_some();
        if removed {
            info!("Tenant {} removed", user_id);
        }
        removed
    }

    pub fn record_api_call(&self, user_id: &str) -> bool {
        match self.tenants.get_mut(user_id) {
            Some(mut entry) => {
                entry.binding.api_calls_today += 1;
                entry.binding.last_api_call_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn mark_analysis(&self, user_id: &str) -> bool {
        match self.tenants.get_mut(user_id) {
            Some(mut entry) => {
                entry.session.last_analysis_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Exchange connection lost; the tenant is disabled with it
    pub fn mark_disconnected(&self, user_id: &str) -> bool {
        match self.tenants.get_mut(user_id) {
            Some(mut entry) => {
                entry.binding.connected = false;
                if entry.session.enabled {
                    entry.session.enabled = false;
                    warn!("Tenant {} disconnected from exchange - trading disabled", user_id);
                }
                true
            }
            None => false,
        }
    }

    pub fn update_risk_limits(&self, user_id: &str, update: &RiskLimitsUpdate) -> Option<RiskLimits> {
        let mut entry = self.tenants.get_mut(user_id)?;
        entry.session.risk_limits.apply(update);
        info!("Risk limits updated for {}: {:?}", user_id, entry.session.risk_limits);
        Some(entry.session.risk_limits.clone())
    }

    pub fn bind_client(&self, user_id: &str, client: Arc<dyn ExchangeClient>) -> bool {
        match self.tenants.get_mut(user_id) {
            Some(mut entry) => {
                info!("Tenant {} bound to {} client", user_id, client.name());
                entry.binding.client = Some(client);
                true
            }
            None => false,
        }
    }

    pub fn exchange_client(&self, user_id: &str) -> Option<Arc<dyn ExchangeClient>> {
        self.tenants.get(user_id)?.binding.client.clone()
    }

    pub fn credentials(&self, user_id: &str) -> Option<Credentials> {
        let entry = self.tenants.get(user_id)?;
        match (&entry.binding.api_key, &entry.binding.api_secret) {
            (Some(key), Some(secret)) => Some(Credentials {
                api_key: key.clone(),
                api_secret: secret.clone(),
            }),
            _ => None,
        }
    }

    pub fn session(&self, user_id: &str) -> Option<SessionState> {
        self.tenants.get(user_id).map(|entry| entry.session.clone())
    }

    pub fn binding(&self, user_id: &str) -> Option<BindingView> {
        self.tenants.get(user_id).map(|entry| entry.binding.view())
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.tenants.iter() {
            stats.total_users += 1;
            if entry.session.enabled {
                stats.active_users += 1;
            }
            if entry.binding.connected {
                stats.connected_users += 1;
            }
            if entry.session.executing_trade {
                stats.executing_users += 1;
            }
            stats.total_trades_today += entry.session.today_trades as u64;
            stats.total_profit_today += entry.session.today_profit;
            stats.total_trades += entry.session.total_trades;
            stats.total_profit += entry.session.total_profit;
            stats.api_calls_today += entry.binding.api_calls_today as u64;
        }
        stats
    }
}

/// Ordered short-circuit: the first failing check is the reason reported
fn evaluate(entry: &TenantEntry, kill_switch: &KillSwitch) -> CanTrade {
    if !kill_switch.is_enabled() {
        return CanTrade::denied(IneligibleReason::KillSwitchEngaged);
    }
    if !entry.session.enabled {
        return CanTrade::denied(IneligibleReason::Disabled);
    }
    if entry.session.executing_trade {
        return CanTrade::denied(IneligibleReason::TradeInProgress);
    }
    if !entry.binding.connected {
        return CanTrade::denied(IneligibleReason::NotConnected);
    }
    if entry.session.today_trades >= entry.session.risk_limits.max_daily_trades {
        return CanTrade::denied(IneligibleReason::DailyLimit);
    }
    CanTrade::allowed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderSide, PaperExchange};
    use std::time::Duration;

    fn registry() -> (SessionRegistry, Arc<RouteHealth>) {
        let health = Arc::new(RouteHealth::new(3, Duration::from_secs(120)));
        (SessionRegistry::new(Arc::clone(&health)), health)
    }

    fn ready_tenant(registry: &SessionRegistry, user: &str, profile: RiskProfile) {
        registry.initialize(user, profile);
        assert!(registry.set_credentials(user, "key-123456789", "c2VjcmV0"));
        assert!(registry.set_enabled(user, true));
    }

    fn trade(profit: Option<f64>) -> TradeRef {
        let t = TradeRef::new("BTC/USD", OrderSide::Buy, 50.0);
        match profit {
            Some(p) => t.with_profit(p),
            None => t,
        }
    }

    #[test]
    fn test_unknown_tenant_operations() {
        let (registry, _) = registry();
        assert!(!registry.set_credentials("ghost", "k", "s"));
        assert!(!registry.set_enabled("ghost", false));
        assert_eq!(
            registry.can_trade("ghost"),
            CanTrade::denied(IneligibleReason::UnknownUser)
        );
        // Logged and ignored
        registry.record_trade("ghost", trade(Some(1.0)));
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (registry, _) = registry();
        assert!(registry.initialize("alice", RiskProfile::Low));
        registry.set_credentials("alice", "key-123456789", "c2VjcmV0");
        registry.record_trade("alice", trade(Some(2.0)));

        assert!(!registry.initialize("alice", RiskProfile::High));

        let session = registry.session("alice").unwrap();
        assert_eq!(session.total_trades, 1);
        assert_eq!(session.risk_profile, RiskProfile::Low);
        assert!(registry.credentials("alice").is_some());
        assert!(registry.binding("alice").unwrap().connected);
    }

    #[test]
    fn test_enable_requires_credentials() {
        let (registry, _) = registry();
        registry.initialize("bob", RiskProfile::Medium);
        assert!(!registry.set_enabled("bob", true));
        // Disabling never needs credentials
        assert!(registry.set_enabled("bob", false));

        registry.set_credentials("bob", "key-123456789", "c2VjcmV0");
        assert!(registry.set_enabled("bob", true));

        // Re-verified on every enable attempt
        registry.mark_disconnected("bob");
        assert!(!registry.session("bob").unwrap().enabled);
        assert!(!registry.set_enabled("bob", true));
    }

    #[test]
    fn test_reason_order_disabled_before_quota() {
        let (registry, _) = registry();
        ready_tenant(&registry, "carol", RiskProfile::Low);
        for _ in 0..5 {
            registry.record_trade("carol", trade(None));
        }
        registry.set_enabled("carol", false);

        // Disabled and over quota: only the first reason is reported
        assert_eq!(
            registry.can_trade("carol"),
            CanTrade::denied(IneligibleReason::Disabled)
        );
    }

    #[test]
    fn test_reason_order_connection_before_quota() {
        let (registry, _) = registry();
        ready_tenant(&registry, "dave", RiskProfile::Low);
        for _ in 0..5 {
            registry.record_trade("dave", trade(None));
        }
        // Drop the connection without going through mark_disconnected
        registry.tenants.get_mut("dave").unwrap().binding.connected = false;

        assert_eq!(
            registry.can_trade("dave"),
            CanTrade::denied(IneligibleReason::NotConnected)
        );
    }

    #[test]
    fn test_kill_switch_blocks_every_tenant() {
        let (registry, health) = registry();
        ready_tenant(&registry, "erin", RiskProfile::High);
        assert!(registry.can_trade("erin").allowed);

        health.kill_switch().trip(451, "https://exchange");
        assert_eq!(
            registry.can_trade("erin"),
            CanTrade::denied(IneligibleReason::KillSwitchEngaged)
        );
        assert!(registry.list_eligible_users().is_empty());
        assert!(!registry.try_begin_trade("erin").allowed);
    }

    #[test]
    fn test_alice_daily_limit_scenario() {
        let (registry, _) = registry();
        ready_tenant(&registry, "alice", RiskProfile::Low);
        assert_eq!(registry.session("alice").unwrap().risk_limits.max_daily_trades, 5);

        for _ in 0..5 {
            assert!(registry.can_trade("alice").allowed);
            registry.record_trade("alice", trade(Some(0.5)));
        }

        let verdict = registry.can_trade("alice");
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, Some(IneligibleReason::DailyLimit));
        assert_eq!(verdict.reason.unwrap().to_string(), "daily limit reached");

        registry.reset_daily();
        assert_eq!(registry.can_trade("alice"), CanTrade::allowed());
    }

    #[test]
    fn test_record_trade_accumulates() {
        let (registry, _) = registry();
        ready_tenant(&registry, "frank", RiskProfile::Medium);

        registry.record_trade("frank", trade(Some(1.5)));
        registry.record_trade("frank", trade(None));
        registry.record_trade("frank", trade(Some(-0.5)));

        let session = registry.session("frank").unwrap();
        assert_eq!(session.total_trades, 3);
        assert_eq!(session.today_trades, 3);
        assert_eq!(session.total_profit, 1.0);
        assert_eq!(session.today_profit, 1.0);
        assert_eq!(session.active_trades.len(), 3);
        assert_eq!(session.active_trades[1].profit, None);
    }

    #[test]
    fn test_reset_daily_keeps_totals() {
        let (registry, _) = registry();
        ready_tenant(&registry, "gina", RiskProfile::Medium);
        ready_tenant(&registry, "hank", RiskProfile::High);
        registry.record_trade("gina", trade(Some(3.0)));
        registry.record_trade("hank", trade(Some(4.0)));
        registry.record_api_call("gina");

        assert_eq!(registry.reset_daily(), 2);

        for user in ["gina", "hank"] {
            let session = registry.session(user).unwrap();
            assert_eq!(session.today_trades, 0);
            assert_eq!(session.today_profit, 0.0);
            assert_eq!(session.total_trades, 1);
        }
        assert_eq!(registry.session("gina").unwrap().total_profit, 3.0);
        assert_eq!(registry.binding("gina").unwrap().api_calls_today, 0);
    }

    #[test]
    fn test_single_trade_in_flight_per_tenant() {
        let (registry, _) = registry();
        ready_tenant(&registry, "ivan", RiskProfile::Medium);

        assert!(registry.try_begin_trade("ivan").allowed);
        assert_eq!(
            registry.try_begin_trade("ivan"),
            CanTrade::denied(IneligibleReason::TradeInProgress)
        );
        assert!(registry.list_eligible_users().is_empty());

        registry.finish_trade("ivan");
        assert!(registry.try_begin_trade("ivan").allowed);
    }

    #[test]
    fn test_concurrent_begin_trade_admits_one() {
        let (registry, _) = registry();
        ready_tenant(&registry, "judy", RiskProfile::Medium);
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.try_begin_trade("judy").allowed)
            })
            .collect();
        let admitted = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_list_eligible_users() {
        let (registry, _) = registry();
        ready_tenant(&registry, "kim", RiskProfile::Low);
        ready_tenant(&registry, "lee", RiskProfile::Low);
        registry.initialize("max", RiskProfile::Low);
        for _ in 0..5 {
            registry.record_trade("lee", trade(None));
        }

        assert_eq!(registry.list_eligible_users(), vec!["kim".to_string()]);

        // Raising the limit is picked up on the next scan
        registry.update_risk_limits(
            "lee",
            &RiskLimitsUpdate {
                max_daily_trades: Some(10),
                ..Default::default()
            },
        );
        assert_eq!(registry.list_eligible_users(), vec!["kim".to_string(), "lee".to_string()]);
    }

    #[test]
    fn test_remove_drops_both_records() {
        let (registry, _) = registry();
        ready_tenant(&registry, "nina", RiskProfile::Low);
        registry.bind_client("nina", Arc::new(PaperExchange::new()));

        assert!(registry.remove("nina"));
        assert!(registry.session("nina").is_none());
        assert!(registry.binding("nina").is_none());
        assert!(registry.exchange_client("nina").is_none());
        assert_eq!(
            registry.can_trade("nina"),
            CanTrade::denied(IneligibleReason::UnknownUser)
        );
        assert!(!registry.remove("nina"));
    }

    #[test]
    fn test_close_trade_and_stop_loss() {
        let (registry, _) = registry();
        ready_tenant(&registry, "omar", RiskProfile::Low);

        let open = trade(None);
        let id = open.id.clone();
        registry.record_trade("omar", open);
        assert!(!registry.enforce_stop_loss("omar"));

        let closed = registry.close_trade("omar", &id, -2.5).unwrap();
        assert_eq!(closed.status, TradeStatus::Completed);
        assert!(registry.session("omar").unwrap().active_trades.is_empty());
        assert_eq!(registry.session("omar").unwrap().today_profit, -2.5);

        assert!(registry.enforce_stop_loss("omar"));
        assert!(!registry.session("omar").unwrap().enabled);
        assert!(registry.close_trade("omar", &id, 1.0).is_none());
    }

    #[test]
    fn test_stats_aggregate() {
        let (registry, _) = registry();
        ready_tenant(&registry, "pat", RiskProfile::Low);
        registry.initialize("quinn", RiskProfile::Low);
        registry.record_trade("pat", trade(Some(2.0)));
        registry.record_trade("quinn", trade(Some(1.0)));
        registry.try_begin_trade("pat");

        let stats = registry.stats();
        assert_eq!(stats.total_users, 2);
        assert_eq!(stats.active_users, 1);
        assert_eq!(stats.connected_users, 1);
        assert_eq!(stats.executing_users, 1);
        assert_eq!(stats.total_trades_today, 2);
        assert_eq!(stats.total_profit_today, 3.0);
    }

    #[test]
    fn test_binding_view_hides_secret() {
        let (registry, _) = registry();
        ready_tenant(&registry, "rita", RiskProfile::Low);
        let view = registry.binding("rita").unwrap();
        assert_eq!(view.api_key.as_deref(), Some("key-...6789"));
        assert!(view.has_secret);
    }
}
