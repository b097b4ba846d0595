//! Per-tenant records held by the session registry

use crate::exchange::{ExchangeClient, OrderSide};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

// ==========================================
// Risk Profile & Limits
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    Low,
    Medium,
    High,
}

impl RiskProfile {
    pub fn limits(self) -> RiskLimits {
        let (max_trade_amount, max_daily_trades, stop_loss_threshold) = match self {
            RiskProfile::Low => (100.0, 5, -2.0),
            RiskProfile::Medium => (500.0, 20, -5.0),
            RiskProfile::High => (1000.0, 50, -10.0),
        };
        RiskLimits {
            max_trade_amount,
            max_daily_trades,
            stop_loss_threshold,
            profit_threshold_pct: 0.1,
        }
    }
}

impl Default for RiskProfile {
    fn default() -> Self {
        RiskProfile::Medium
    }
}

impl FromStr for RiskProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskProfile::Low),
            "medium" => Ok(RiskProfile::Medium),
            "high" => Ok(RiskProfile::High),
            other => Err(format!("unknown risk profile: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Largest single trade, in quote currency
    pub max_trade_amount: f64,
    pub max_daily_trades: u32,
    /// Today's profit at or below this disables the tenant
    pub stop_loss_threshold: f64,
    /// Minimum expected profit (%) worth executing
    pub profit_threshold_pct: f64,
}

/// Partial update from the control API; `None` keeps the current value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RiskLimitsUpdate {
    pub max_trade_amount: Option<f64>,
    pub max_daily_trades: Option<u32>,
    pub stop_loss_threshold: Option<f64>,
    pub profit_threshold_pct: Option<f64>,
}

impl RiskLimits {
    pub fn apply(&mut self, update: &RiskLimitsUpdate) {
        if let Some(v) = update.max_trade_amount {
            self.max_trade_amount = v;
        }
        if let Some(v) = update.max_daily_trades {
            self.max_daily_trades = v;
        }
        if let Some(v) = update.stop_loss_threshold {
            self.stop_loss_threshold = v;
        }
        if let Some(v) = update.profit_threshold_pct {
            self.profit_threshold_pct = v;
        }
    }
}

// ==========================================
// Trades
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Open,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRef {
    pub id: String,
    pub pair: String,
    pub side: OrderSide,
    pub amount: f64,
    pub profit: Option<f64>,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
}

impl TradeRef {
    pub fn new(pair: &str, side: OrderSide, amount: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pair: pair.to_string(),
            side,
            amount,
            profit: None,
            status: TradeStatus::Open,
            opened_at: Utc::now(),
        }
    }

    pub fn with_profit(mut self, profit: f64) -> Self {
        self.profit = Some(profit);
        self.status = TradeStatus::Completed;
        self
    }
}

// ==========================================
// Session State
// ==========================================

#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub enabled: bool,
    pub executing_trade: bool,
    pub total_trades: u64,
    pub total_profit: f64,
    pub today_trades: u32,
    pub today_profit: f64,
    pub last_analysis_at: Option<DateTime<Utc>>,
    pub risk_profile: RiskProfile,
    pub risk_limits: RiskLimits,
    pub active_trades: Vec<TradeRef>,
    pub created_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(profile: RiskProfile) -> Self {
        Self {
            enabled: false,
            executing_trade: false,
            total_trades: 0,
            total_profit: 0.0,
            today_trades: 0,
            today_profit: 0.0,
            last_analysis_at: None,
            risk_profile: profile,
            risk_limits: profile.limits(),
            active_trades: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

// ==========================================
// Exchange Binding
// ==========================================

pub struct ExchangeBinding {
    pub(crate) api_key: Option<String>,
    pub(crate) api_secret: Option<String>,
    pub(crate) connected: bool,
    pub(crate) api_calls_today: u32,
    pub(crate) last_api_call_at: Option<DateTime<Utc>>,
    pub(crate) client: Option<Arc<dyn ExchangeClient>>,
}

impl ExchangeBinding {
    pub fn new() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            connected: false,
            api_calls_today: 0,
            last_api_call_at: None,
            client: None,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }

    pub fn view(&self) -> BindingView {
        BindingView {
            api_key: self.api_key.as_deref().map(redact_key),
            has_secret: self.api_secret.is_some(),
            connected: self.connected,
            api_calls_today: self.api_calls_today,
            last_api_call_at: self.last_api_call_at,
            client: self.client.as_ref().map(|c| c.name().to_string()),
        }
    }
}

impl Default for ExchangeBinding {
    fn default() -> Self {
        Self::new()
    }
}

/// Binding as exposed to callers: key redacted, secret never included
#[derive(Debug, Clone, Serialize)]
pub struct BindingView {
    pub api_key: Option<String>,
    pub has_secret: bool,
    pub connected: bool,
    pub api_calls_today: u32,
    pub last_api_call_at: Option<DateTime<Utc>>,
    pub client: Option<String>,
}

/// Stored credentials handed to client factories
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &redact_key(&self.api_key))
            .field("api_secret", &"****")
            .finish()
    }
}

/// First and last four characters of a key; short keys are fully masked
pub(crate) fn redact_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "****".to_string()
    }
}

// ==========================================
// Eligibility
// ==========================================

/// Why a tenant may not trade right now. Ordered by check precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IneligibleReason {
    UnknownUser,
    KillSwitchEngaged,
    Disabled,
    TradeInProgress,
    NotConnected,
    DailyLimit,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IneligibleReason::UnknownUser => "user not found",
            IneligibleReason::KillSwitchEngaged => "trading halted: geo-block kill-switch engaged",
            IneligibleReason::Disabled => "trading disabled",
            IneligibleReason::TradeInProgress => "trade already executing",
            IneligibleReason::NotConnected => "exchange not connected",
            IneligibleReason::DailyLimit => "daily limit reached",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanTrade {
    pub allowed: bool,
    pub reason: Option<IneligibleReason>,
}

impl CanTrade {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn denied(reason: IneligibleReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Aggregate numbers for dashboards
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total_users: usize,
    pub active_users: usize,
    pub connected_users: usize,
    pub executing_users: usize,
    pub total_trades_today: u64,
    pub total_profit_today: f64,
    pub total_trades: u64,
    pub total_profit: f64,
    pub api_calls_today: u64,
}
