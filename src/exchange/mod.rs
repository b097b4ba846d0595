//! Exchange capability interface
//!
//! The registry and engine only ever see `dyn ExchangeClient`; concrete
//! clients (signed REST, paper) plug in behind it.

mod kraken;
mod paper;

pub use kraken::KrakenClient;
pub use paper::PaperExchange;

use crate::gateway::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("API credentials not configured")]
    NotConfigured,
    #[error("Invalid API secret: {0}")]
    InvalidSecret(String),
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("API error: {0}")]
    Api(String),
    #[error("Unknown pair: {0}")]
    UnknownPair(String),
    #[error("Insufficient {asset} balance: need {needed:.8}, have {available:.8}")]
    InsufficientBalance {
        asset: String,
        needed: f64,
        available: f64,
    },
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub pair: String,
    pub bid: f64,
    pub ask: f64,
}

/// Order to place; `volume` is in the base currency. No limit price means market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub pair: String,
    pub side: OrderSide,
    pub volume: f64,
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub volume: f64,
    /// Fill price when the venue reports it synchronously
    pub price: Option<f64>,
    pub fee: Option<f64>,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    async fn get_balance(&self) -> Result<HashMap<String, f64>, ExchangeError>;

    async fn get_ticker(&self, pair: &str) -> Result<Ticker, ExchangeError>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError>;
}
