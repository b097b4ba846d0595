//! Arb Gateway - resilient exchange gateway and multi-tenant session registry
//!
//! - `gateway`: outbound HTTP with proxy routing, circuit breaker and the
//!   geo-block kill-switch
//! - `registry`: per-tenant trading state and eligibility
//! - `exchange`: exchange client capability (signed REST, paper)
//! - `trading`: trade execution and periodic analysis
//! - `scheduler`: UTC-midnight daily rollover
//! - `api`: axum control surface

pub mod api;
pub mod config;
pub mod exchange;
pub mod gateway;
pub mod registry;
pub mod scheduler;
pub mod trading;

use crate::config::AppConfig;
use crate::gateway::{Gateway, RouteHealth};
use crate::registry::SessionRegistry;
use crate::trading::TradingEngine;
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across all handlers
pub struct AppState {
    pub config: AppConfig,
    pub health: Arc<RouteHealth>,
    pub gateway: Arc<Gateway>,
    pub registry: Arc<SessionRegistry>,
    pub engine: Arc<TradingEngine>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component around one shared `RouteHealth`
    pub fn build(config: AppConfig) -> Result<Self, gateway::GatewayError> {
        let health = Arc::new(RouteHealth::new(config.gateway.failure_threshold, config.gateway.cooldown));
        let gateway = Arc::new(Gateway::new(config.gateway.clone(), Arc::clone(&health))?);
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&health)));
        let engine = Arc::new(TradingEngine::new(
            Arc::clone(&registry),
            Arc::clone(&gateway),
            &config.exchange_api_url,
            config.arbitrage_enabled,
        ));

        Ok(Self {
            config,
            health,
            gateway,
            registry,
            engine,
            started_at: Instant::now(),
        })
    }
}
