//! Trading Engine
//!
//! One trade per call: claim the tenant's execution slot, check risk
//! limits, quote and place the order through the tenant's exchange client,
//! then book it. The slot is released on every path. No registry lock is
//! held while the exchange is being called.

use crate::exchange::{ExchangeError, KrakenClient, OrderAck, OrderRequest, OrderSide};
use crate::gateway::Gateway;
use crate::registry::{IneligibleReason, SessionRegistry, TradeRef};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No exchange client bound for {0}")]
    NoClient(String),
    #[error("Invalid trade request: {0}")]
    InvalidRequest(String),
    #[error("No usable quote for {0}")]
    InvalidQuote(String),
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),
}

/// Releases a claimed execution slot on drop, including when the trade
/// future is cancelled.
struct TradeSlot<'a> {
    registry: &'a SessionRegistry,
    user_id: &'a str,
}

impl Drop for TradeSlot<'_> {
    fn drop(&mut self) {
        self.registry.finish_trade(self.user_id);
    }
}

// ==========================================
// Request / Outcome Types
// ==========================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub pair: String,
    pub side: OrderSide,
    /// Notional in quote currency
    pub amount: f64,
    pub expected_profit_pct: f64,
}

/// Why a trade was not attempted. Not an error: nothing was sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TradeRejection {
    ArbitrageDisabled,
    Ineligible { reason: IneligibleReason },
    AboveMaxAmount { amount: f64, max: f64 },
    BelowProfitThreshold { expected_pct: f64, threshold_pct: f64 },
}

impl fmt::Display for TradeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeRejection::ArbitrageDisabled => write!(f, "automated trading is disabled"),
            TradeRejection::Ineligible { reason } => write!(f, "{}", reason),
            TradeRejection::AboveMaxAmount { amount, max } => {
                write!(f, "amount {:.2} exceeds max trade amount {:.2}", amount, max)
            }
            TradeRejection::BelowProfitThreshold {
                expected_pct,
                threshold_pct,
            } => write!(
                f,
                "expected profit {:.3}% below threshold {:.3}%",
                expected_pct, threshold_pct
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutedTrade {
    pub trade: TradeRef,
    pub ack: OrderAck,
    pub stop_loss_triggered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettledTrade {
    pub trade: TradeRef,
    pub stop_loss_triggered: bool,
}

#[derive(Debug, Clone)]
pub enum TradeOutcome {
    Executed(ExecutedTrade),
    Rejected(TradeRejection),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub analyzed: usize,
    pub failed: usize,
}

// ==========================================
// Trading Engine
// ==========================================

pub struct TradingEngine {
    registry: Arc<SessionRegistry>,
    gateway: Arc<Gateway>,
    exchange_api_url: String,
    arbitrage_enabled: AtomicBool,
    tick_count: AtomicU64,
}

impl TradingEngine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        gateway: Arc<Gateway>,
        exchange_api_url: &str,
        arbitrage_enabled: bool,
    ) -> Self {
        Self {
            registry,
            gateway,
            exchange_api_url: exchange_api_url.to_string(),
            arbitrage_enabled: AtomicBool::new(arbitrage_enabled),
            tick_count: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn is_arbitrage_enabled(&self) -> bool {
        self.arbitrage_enabled.load(Ordering::SeqCst)
    }

    pub fn set_arbitrage_enabled(&self, enabled: bool) {
        self.arbitrage_enabled.store(enabled, Ordering::SeqCst);
        info!("Automated trading {}", if enabled { "ENABLED" } else { "DISABLED" });
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }

    /// Store credentials and bind a signed REST client for the tenant.
    /// The client is built first so a malformed secret leaves the tenant
    /// untouched. Returns `Ok(false)` for an unknown tenant.
    pub fn connect_exchange(&self, user_id: &str, api_key: &str, api_secret: &str) -> Result<bool, EngineError> {
        let client = KrakenClient::new(
            &self.exchange_api_url,
            api_key.to_string(),
            api_secret,
            Arc::clone(&self.gateway),
        )?;

        if !self.registry.set_credentials(user_id, api_key, api_secret) {
            return Ok(false);
        }
        Ok(self.registry.bind_client(user_id, Arc::new(client)))
    }

    pub async fn execute_trade(&self, user_id: &str, request: &TradeRequest) -> Result<TradeOutcome, EngineError> {
        if !self.is_arbitrage_enabled() {
            debug!("Trade for {} skipped: automated trading disabled", user_id);
            return Ok(TradeOutcome::Rejected(TradeRejection::ArbitrageDisabled));
        }

        let verdict = self.registry.try_begin_trade(user_id);
        if let Some(reason) = verdict.reason {
            debug!("Trade for {} skipped: {}", user_id, reason);
            return Ok(TradeOutcome::Rejected(TradeRejection::Ineligible { reason }));
        }

        let slot = TradeSlot {
            registry: &self.registry,
            user_id,
        };
        let result = self.run_trade(user_id, request).await;
        drop(slot);

        match &result {
            Ok(TradeOutcome::Rejected(rejection)) => info!("Trade for {} rejected: {}", user_id, rejection),
            Err(e) => warn!("Trade for {} failed: {}", user_id, e),
            Ok(TradeOutcome::Executed(_)) => {}
        }
        result
    }

    async fn run_trade(&self, user_id: &str, request: &TradeRequest) -> Result<TradeOutcome, EngineError> {
        if !(request.amount > 0.0) {
            return Err(EngineError::InvalidRequest(format!("amount must be positive, got {}", request.amount)));
        }

        // Tenant may have been removed since the slot was claimed
        let Some(session) = self.registry.session(user_id) else {
            return Ok(TradeOutcome::Rejected(TradeRejection::Ineligible {
                reason: IneligibleReason::UnknownUser,
            }));
        };
        let limits = session.risk_limits;

        if request.amount > limits.max_trade_amount {
            return Ok(TradeOutcome::Rejected(TradeRejection::AboveMaxAmount {
                amount: request.amount,
                max: limits.max_trade_amount,
            }));
        }
        if request.expected_profit_pct < limits.profit_threshold_pct {
            return Ok(TradeOutcome::Rejected(TradeRejection::BelowProfitThreshold {
                expected_pct: request.expected_profit_pct,
                threshold_pct: limits.profit_threshold_pct,
            }));
        }

        let client = self
            .registry
            .exchange_client(user_id)
            .ok_or_else(|| EngineError::NoClient(user_id.to_string()))?;

        self.registry.record_api_call(user_id);
        let ticker = client.get_ticker(&request.pair).await?;
        let price = match request.side {
            OrderSide::Buy => ticker.ask,
            OrderSide::Sell => ticker.bid,
        };
        if !(price > 0.0) {
            return Err(EngineError::InvalidQuote(request.pair.clone()));
        }

        let order = OrderRequest {
            pair: request.pair.clone(),
            side: request.side,
            volume: request.amount / price,
            limit_price: None,
        };

        self.registry.record_api_call(user_id);
        let ack = client.place_order(&order).await?;

        let trade = TradeRef::new(&request.pair, request.side, request.amount);
        self.registry.record_trade(user_id, trade.clone());
        let stop_loss_triggered = self.registry.enforce_stop_loss(user_id);

        info!(
            "🎯 {} executed {} {} {:.2} via {} (order {})",
            user_id,
            request.side,
            request.pair,
            request.amount,
            client.name(),
            ack.order_id
        );

        Ok(TradeOutcome::Executed(ExecutedTrade {
            trade,
            ack,
            stop_loss_triggered,
        }))
    }

    /// Book the realized profit of an open trade and apply the stop-loss
    pub fn settle_trade(&self, user_id: &str, trade_id: &str, profit: f64) -> Option<SettledTrade> {
        let trade = self.registry.close_trade(user_id, trade_id, profit)?;
        let stop_loss_triggered = self.registry.enforce_stop_loss(user_id);
        info!("Trade {} for {} settled: profit {:.4}", trade_id, user_id, profit);
        Some(SettledTrade {
            trade,
            stop_loss_triggered,
        })
    }

    /// One pass over every eligible tenant, run concurrently. Per-tenant
    /// failures are counted and logged; they never abort the pass.
    pub async fn analysis_tick(&self) -> AnalysisReport {
        self.tick_count.fetch_add(1, Ordering::SeqCst);
        let users = self.registry.list_eligible_users();
        if users.is_empty() {
            debug!("Analysis tick: no eligible tenants");
            return AnalysisReport::default();
        }

        let results = join_all(users.iter().map(|user| self.analyze_tenant(user))).await;

        let mut report = AnalysisReport {
            analyzed: users.len(),
            failed: 0,
        };
        for (user, result) in users.iter().zip(results) {
            if let Err(e) = result {
                report.failed += 1;
                warn!("Analysis for {} failed: {}", user, e);
            }
        }
        debug!("Analysis tick: {} tenants, {} failed", report.analyzed, report.failed);
        report
    }

    async fn analyze_tenant(&self, user_id: &str) -> Result<(), EngineError> {
        self.registry.mark_analysis(user_id);

        let client = self
            .registry
            .exchange_client(user_id)
            .ok_or_else(|| EngineError::NoClient(user_id.to_string()))?;

        self.registry.record_api_call(user_id);
        let balances = client.get_balance().await?;
        debug!("{}: {} balances via {}", user_id, balances.len(), client.name());
        Ok(())
    }

    /// Periodic analysis until `shutdown` flips to true. Ticks are skipped
    /// while automated trading is disabled.
    pub fn spawn_analysis_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Analysis loop started ({}ms interval)", interval.as_millis());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.is_arbitrage_enabled() {
                            self.analysis_tick().await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Analysis loop stopped");
        })
    }
}
