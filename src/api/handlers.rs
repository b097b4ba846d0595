//! API request handlers

use crate::registry::{RiskLimitsUpdate, RiskProfile};
use crate::trading::{EngineError, TradeOutcome, TradeRequest};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

// ==========================================
// Response Helpers
// ==========================================

pub fn error_response(error: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "success": false,
            "error": error
        })),
    )
        .into_response()
}

pub fn bad_request(error: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "success": false,
            "error": error
        })),
    )
        .into_response()
}

pub fn not_found(error: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "success": false,
            "error": error
        })),
    )
        .into_response()
}

const USER_NOT_FOUND: &str = "User not found";

// ==========================================
// Request Types
// ==========================================

#[derive(Debug, Deserialize)]
pub struct InitUserRequest {
    pub risk_profile: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct SettleRequest {
    pub profit: f64,
}

// ==========================================
// Health & Status Handlers
// ==========================================

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "arb_gateway",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let kill_switch = state.health.kill_switch();
    let last_trip = kill_switch.last_trip();
    let banner = last_trip.as_ref().map(|trip| {
        format!(
            "Trading halted: geo-block (HTTP {}) from {} at {}",
            trip.status,
            trip.url,
            trip.tripped_at.to_rfc3339()
        )
    });
    let route = state.gateway.current_route();

    Json(serde_json::json!({
        "success": true,
        "kill_switch": {
            "enabled": kill_switch.is_enabled(),
            "banner": banner,
            "last_trip": last_trip,
        },
        "circuit_breaker": state.health.breaker_snapshot(),
        "route": {
            "kind": route.kind(),
            "target": route.to_string(),
        },
        "arbitrage_enabled": state.engine.is_arbitrage_enabled(),
        "analysis_ticks": state.engine.tick_count(),
        "registry": state.registry.stats(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn rearm_kill_switch(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.health.kill_switch().rearm();
    Json(serde_json::json!({
        "success": true,
        "kill_switch_enabled": state.health.kill_switch().is_enabled()
    }))
}

pub async fn enable_arbitrage(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.engine.set_arbitrage_enabled(true);
    Json(serde_json::json!({ "success": true, "arbitrage_enabled": true }))
}

pub async fn disable_arbitrage(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.engine.set_arbitrage_enabled(false);
    Json(serde_json::json!({ "success": true, "arbitrage_enabled": false }))
}

pub async fn reset_daily(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let count = state.registry.reset_daily();
    Json(serde_json::json!({ "success": true, "users_reset": count }))
}

// ==========================================
// Tenant Handlers
// ==========================================

pub async fn initialize_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    body: Option<Json<InitUserRequest>>,
) -> Response {
    let profile = match body.and_then(|Json(req)| req.risk_profile) {
        Some(raw) => match raw.parse::<RiskProfile>() {
            Ok(profile) => profile,
            Err(e) => return bad_request(&e),
        },
        None => RiskProfile::default(),
    };

    let created = state.registry.initialize(&user_id, profile);
    let session = state.registry.session(&user_id);

    Json(serde_json::json!({
        "success": true,
        "user_id": user_id,
        "created": created,
        "risk_profile": session.map(|s| s.risk_profile),
    }))
    .into_response()
}

pub async fn get_user(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> Response {
    match (state.registry.session(&user_id), state.registry.binding(&user_id)) {
        (Some(session), Some(exchange)) => Json(serde_json::json!({
            "success": true,
            "user_id": user_id,
            "session": session,
            "exchange": exchange,
        }))
        .into_response(),
        _ => not_found(USER_NOT_FOUND),
    }
}

pub async fn remove_user(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> Response {
    if state.registry.remove(&user_id) {
        Json(serde_json::json!({ "success": true, "user_id": user_id })).into_response()
    } else {
        not_found(USER_NOT_FOUND)
    }
}

pub async fn set_credentials(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(req): Json<CredentialsRequest>,
) -> Response {
    if req.api_key.trim().is_empty() || req.api_secret.trim().is_empty() {
        return bad_request("api_key and api_secret are required");
    }

    match state.engine.connect_exchange(&user_id, &req.api_key, &req.api_secret) {
        Ok(true) => Json(serde_json::json!({
            "success": true,
            "user_id": user_id,
            "exchange": state.registry.binding(&user_id),
        }))
        .into_response(),
        Ok(false) => not_found(USER_NOT_FOUND),
        Err(e) => {
            warn!("Credentials rejected for {}: {}", user_id, e);
            bad_request(&e.to_string())
        }
    }
}

pub async fn enable_user(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> Response {
    if !state.registry.contains(&user_id) {
        return not_found(USER_NOT_FOUND);
    }
    if !state.registry.set_enabled(&user_id, true) {
        return bad_request("Exchange not connected - set credentials first");
    }
    Json(serde_json::json!({ "success": true, "user_id": user_id, "enabled": true })).into_response()
}

pub async fn disable_user(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> Response {
    if !state.registry.set_enabled(&user_id, false) {
        return not_found(USER_NOT_FOUND);
    }
    Json(serde_json::json!({ "success": true, "user_id": user_id, "enabled": false })).into_response()
}

/// Ineligibility (including an unknown tenant) is an answer, not an error
pub async fn can_trade(State(state): State<Arc<AppState>>, Path(user_id): Path<String>) -> impl IntoResponse {
    let verdict = state.registry.can_trade(&user_id);
    Json(serde_json::json!({
        "success": true,
        "user_id": user_id,
        "can_trade": verdict.allowed,
        "reason": verdict.reason.map(|r| r.to_string()),
    }))
}

pub async fn update_risk_limits(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(update): Json<RiskLimitsUpdate>,
) -> Response {
    if update.max_trade_amount.map_or(false, |v| !(v > 0.0)) {
        return bad_request("max_trade_amount must be positive");
    }
    if update.profit_threshold_pct.map_or(false, |v| v < 0.0) {
        return bad_request("profit_threshold_pct must not be negative");
    }

    match state.registry.update_risk_limits(&user_id, &update) {
        Some(limits) => Json(serde_json::json!({
            "success": true,
            "user_id": user_id,
            "risk_limits": limits,
        }))
        .into_response(),
        None => not_found(USER_NOT_FOUND),
    }
}

pub async fn list_eligible(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let users = state.registry.list_eligible_users();
    Json(serde_json::json!({
        "success": true,
        "count": users.len(),
        "users": users,
    }))
}

// ==========================================
// Trade Execution Handlers
// ==========================================

pub async fn execute_trade(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(req): Json<TradeRequest>,
) -> Response {
    match state.engine.execute_trade(&user_id, &req).await {
        Ok(TradeOutcome::Executed(executed)) => Json(serde_json::json!({
            "success": true,
            "data": executed
        }))
        .into_response(),
        Ok(TradeOutcome::Rejected(rejection)) => Json(serde_json::json!({
            "success": false,
            "error": rejection.to_string(),
            "rejection": rejection,
        }))
        .into_response(),
        Err(e @ (EngineError::NoClient(_) | EngineError::InvalidRequest(_))) => bad_request(&e.to_string()),
        Err(e) => error_response(&e.to_string()),
    }
}

pub async fn settle_trade(
    State(state): State<Arc<AppState>>,
    Path((user_id, trade_id)): Path<(String, String)>,
    Json(req): Json<SettleRequest>,
) -> Response {
    match state.engine.settle_trade(&user_id, &trade_id, req.profit) {
        Some(settled) => {
            if settled.stop_loss_triggered {
                info!("{} disabled by stop-loss after settling {}", user_id, trade_id);
            }
            Json(serde_json::json!({
                "success": true,
                "data": settled
            }))
            .into_response()
        }
        None => not_found("Open trade not found"),
    }
}
