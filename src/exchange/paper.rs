//! Paper exchange - in-memory fills against fixed quotes
//!
//! Used as a dry-run binding and by tests. Pairs are written `BASE/QUOTE`.
//! Market orders fill at the ask (buy) or bid (sell); limit orders fill at
//! their limit price if it crosses the quote.

use crate::exchange::{ExchangeClient, ExchangeError, OrderAck, OrderRequest, OrderSide, Ticker};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const DEFAULT_FEE_RATE: f64 = 0.0026;

pub struct PaperExchange {
    quotes: RwLock<HashMap<String, Ticker>>,
    balances: RwLock<HashMap<String, f64>>,
    fee_rate: f64,
    order_seq: AtomicU64,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            fee_rate: DEFAULT_FEE_RATE,
            order_seq: AtomicU64::new(1),
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn set_quote(&self, pair: &str, bid: f64, ask: f64) {
        self.quotes.write().insert(
            pair.to_string(),
            Ticker {
                pair: pair.to_string(),
                bid,
                ask,
            },
        );
    }

    pub fn deposit(&self, asset: &str, amount: f64) {
        *self.balances.write().entry(asset.to_string()).or_insert(0.0) += amount;
    }

    fn split_pair(pair: &str) -> Result<(&str, &str), ExchangeError> {
        pair.split_once('/')
            .ok_or_else(|| ExchangeError::UnknownPair(pair.to_string()))
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_balance(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        Ok(self.balances.read().clone())
    }

    async fn get_ticker(&self, pair: &str) -> Result<Ticker, ExchangeError> {
        self.quotes
            .read()
            .get(pair)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownPair(pair.to_string()))
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let ticker = self.get_ticker(&order.pair).await?;
        let (base, quote) = Self::split_pair(&order.pair)?;

        let price = match (order.side, order.limit_price) {
            (OrderSide::Buy, None) => ticker.ask,
            (OrderSide::Sell, None) => ticker.bid,
            (OrderSide::Buy, Some(limit)) if limit >= ticker.ask => limit,
            (OrderSide::Sell, Some(limit)) if limit <= ticker.bid => limit,
            (_, Some(limit)) => {
                return Err(ExchangeError::Api(format!(
                    "Limit {} does not cross {} (bid {}, ask {})",
                    limit, order.pair, ticker.bid, ticker.ask
                )))
            }
        };

        let cost = order.volume * price;
        let fee = cost * self.fee_rate;

        let mut balances = self.balances.write();
        match order.side {
            OrderSide::Buy => {
                let available = balances.get(quote).copied().unwrap_or(0.0);
                if available < cost + fee {
                    return Err(ExchangeError::InsufficientBalance {
                        asset: quote.to_string(),
                        needed: cost + fee,
                        available,
                    });
                }
                *balances.entry(quote.to_string()).or_insert(0.0) -= cost + fee;
                *balances.entry(base.to_string()).or_insert(0.0) += order.volume;
            }
            OrderSide::Sell => {
                let available = balances.get(base).copied().unwrap_or(0.0);
                if available < order.volume {
                    return Err(ExchangeError::InsufficientBalance {
                        asset: base.to_string(),
                        needed: order.volume,
                        available,
                    });
                }
                *balances.entry(base.to_string()).or_insert(0.0) -= order.volume;
                *balances.entry(quote.to_string()).or_insert(0.0) += cost - fee;
            }
        }

        let order_id = format!("PAPER-{}", self.order_seq.fetch_add(1, Ordering::Relaxed));
        debug!(
            "Paper fill {}: {} {:.8} {} @ {:.2} (fee {:.4})",
            order_id, order.side, order.volume, order.pair, price, fee
        );

        Ok(OrderAck {
            order_id,
            pair: order.pair.clone(),
            side: order.side,
            volume: order.volume,
            price: Some(price),
            fee: Some(fee),
        })
    }
}
