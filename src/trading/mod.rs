//! Trading module - caller flow on top of the gateway and registry
//!
//! Eligibility, exchange call and bookkeeping for one tenant trade, plus
//! the periodic analysis tick over every eligible tenant.

mod engine;

pub use engine::{
    AnalysisReport, EngineError, ExecutedTrade, SettledTrade, TradeOutcome, TradeRejection, TradeRequest,
    TradingEngine,
};
