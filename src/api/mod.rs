//! API module - Axum control surface
//!
//! Operator and tenant endpoints over the registry, engine and route health.

mod handlers;

use crate::AppState;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main application router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ==========================================
        // Status & Health
        // ==========================================
        .route("/api/health", get(handlers::health_check))
        .route("/api/status", get(handlers::get_status))
        .route("/api/kill-switch/rearm", post(handlers::rearm_kill_switch))
        .route("/api/arbitrage/enable", post(handlers::enable_arbitrage))
        .route("/api/arbitrage/disable", post(handlers::disable_arbitrage))
        .route("/api/reset-daily", post(handlers::reset_daily))
        // ==========================================
        // Tenants
        // ==========================================
        .route("/api/users/eligible", get(handlers::list_eligible))
        .route(
            "/api/users/:user_id",
            get(handlers::get_user)
                .post(handlers::initialize_user)
                .delete(handlers::remove_user),
        )
        .route("/api/users/:user_id/credentials", put(handlers::set_credentials))
        .route("/api/users/:user_id/enable", post(handlers::enable_user))
        .route("/api/users/:user_id/disable", post(handlers::disable_user))
        .route("/api/users/:user_id/can-trade", get(handlers::can_trade))
        .route("/api/users/:user_id/risk-limits", put(handlers::update_risk_limits))
        // ==========================================
        // Trade Execution
        // ==========================================
        .route("/api/users/:user_id/trades", post(handlers::execute_trade))
        .route(
            "/api/users/:user_id/trades/:trade_id/settle",
            post(handlers::settle_trade),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::exchange::PaperExchange;
    use axum::body::Body;
    use axum::http::{header::CONTENT_TYPE, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<AppState>) {
        let config = AppConfig {
            arbitrage_enabled: true,
            ..AppConfig::default()
        };
        let state = Arc::new(AppState::build(config).unwrap());
        (create_router(Arc::clone(&state)), state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn paper_tenant(state: &AppState, user: &str) {
        let paper = Arc::new(PaperExchange::new().with_fee_rate(0.0));
        paper.set_quote("BTC/USD", 99.0, 100.0);
        paper.deposit("USD", 1_000.0);
        state.registry.set_credentials(user, "key-123456789", "c2VjcmV0");
        state.registry.bind_client(user, paper);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_tenant_lifecycle() {
        let (app, _) = test_app();

        let (status, body) = call(&app, "POST", "/api/users/alice", Some(json!({ "risk_profile": "low" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["created"], true);
        assert_eq!(body["risk_profile"], "low");

        let (_, body) = call(&app, "POST", "/api/users/alice", Some(json!({ "risk_profile": "high" }))).await;
        assert_eq!(body["created"], false);
        assert_eq!(body["risk_profile"], "low");

        let (_, body) = call(&app, "GET", "/api/users/alice/can-trade", None).await;
        assert_eq!(body["can_trade"], false);
        assert_eq!(body["reason"], "trading disabled");

        let (status, _) = call(&app, "POST", "/api/users/alice/enable", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let creds = json!({ "api_key": "key-123456789", "api_secret": "c2VjcmV0" });
        let (status, body) = call(&app, "PUT", "/api/users/alice/credentials", Some(creds)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["exchange"]["connected"], true);
        assert_eq!(body["exchange"]["api_key"], "key-...6789");

        let (status, _) = call(&app, "POST", "/api/users/alice/enable", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, "GET", "/api/users/alice/can-trade", None).await;
        assert_eq!(body["can_trade"], true);
        assert!(body["reason"].is_null());

        let (_, body) = call(&app, "GET", "/api/users/eligible", None).await;
        assert_eq!(body["users"], json!(["alice"]));

        let (status, _) = call(&app, "DELETE", "/api/users/alice", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "GET", "/api/users/alice", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_user_is_an_answer() {
        let (app, _) = test_app();

        let (status, body) = call(&app, "GET", "/api/users/ghost/can-trade", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["can_trade"], false);
        assert_eq!(body["reason"], "user not found");

        let (status, body) = call(&app, "POST", "/api/users/ghost/disable", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected() {
        let (app, _) = test_app();

        let (status, _) = call(&app, "POST", "/api/users/bob", Some(json!({ "risk_profile": "yolo" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // No body falls back to the default profile
        let (_, body) = call(&app, "POST", "/api/users/bob", None).await;
        assert_eq!(body["risk_profile"], "medium");

        let creds = json!({ "api_key": "key-123456789", "api_secret": "%%%" });
        let (status, _) = call(&app, "PUT", "/api/users/bob/credentials", Some(creds)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "PUT", "/api/users/bob/risk-limits", Some(json!({ "max_trade_amount": 0.0 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, "PUT", "/api/users/bob/risk-limits", Some(json!({ "max_daily_trades": 3 }))).await;
        assert_eq!(body["risk_limits"]["max_daily_trades"], 3);
    }

    #[tokio::test]
    async fn test_status_reports_kill_switch_banner() {
        let (app, state) = test_app();

        let (_, body) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(body["kill_switch"]["enabled"], true);
        assert!(body["kill_switch"]["banner"].is_null());
        assert_eq!(body["route"]["kind"], "direct");
        assert_eq!(body["circuit_breaker"]["is_open"], false);

        state.health.kill_switch().trip(451, "https://api.example.com/0/private/AddOrder");
        let (_, body) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(body["kill_switch"]["enabled"], false);
        assert!(body["kill_switch"]["banner"].as_str().unwrap().contains("HTTP 451"));

        let (_, body) = call(&app, "POST", "/api/kill-switch/rearm", None).await;
        assert_eq!(body["kill_switch_enabled"], true);
        assert!(state.health.kill_switch().is_enabled());
    }

    #[tokio::test]
    async fn test_execute_and_settle_trade() {
        let (app, state) = test_app();
        call(&app, "POST", "/api/users/carol", Some(json!({ "risk_profile": "low" }))).await;
        paper_tenant(&state, "carol");
        call(&app, "POST", "/api/users/carol/enable", None).await;

        let trade = json!({ "pair": "BTC/USD", "side": "buy", "amount": 50.0, "expected_profit_pct": 0.4 });
        let (status, body) = call(&app, "POST", "/api/users/carol/trades", Some(trade)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["ack"]["volume"], 0.5);
        let trade_id = body["data"]["trade"]["id"].as_str().unwrap().to_string();

        let too_big = json!({ "pair": "BTC/USD", "side": "buy", "amount": 500.0, "expected_profit_pct": 0.4 });
        let (status, body) = call(&app, "POST", "/api/users/carol/trades", Some(too_big)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["rejection"]["kind"], "above_max_amount");

        let uri = format!("/api/users/carol/trades/{}/settle", trade_id);
        let (_, body) = call(&app, "POST", &uri, Some(json!({ "profit": -2.0 }))).await;
        assert_eq!(body["data"]["stop_loss_triggered"], true);

        let (_, body) = call(&app, "GET", "/api/users/carol/can-trade", None).await;
        assert_eq!(body["reason"], "trading disabled");

        let (status, _) = call(&app, "POST", &uri, Some(json!({ "profit": 1.0 }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reset_daily_endpoint() {
        let (app, state) = test_app();
        call(&app, "POST", "/api/users/dave", Some(json!({ "risk_profile": "low" }))).await;
        paper_tenant(&state, "dave");
        state.registry.set_enabled("dave", true);
        for _ in 0..5 {
            state.registry.record_trade(
                "dave",
                crate::registry::TradeRef::new("BTC/USD", crate::exchange::OrderSide::Buy, 10.0),
            );
        }

        let (_, body) = call(&app, "GET", "/api/users/dave/can-trade", None).await;
        assert_eq!(body["reason"], "daily limit reached");

        let (_, body) = call(&app, "POST", "/api/reset-daily", None).await;
        assert_eq!(body["users_reset"], 1);

        let (_, body) = call(&app, "GET", "/api/users/dave/can-trade", None).await;
        assert_eq!(body["can_trade"], true);
    }

    #[tokio::test]
    async fn test_arbitrage_toggle() {
        let (app, state) = test_app();
        call(&app, "POST", "/api/arbitrage/disable", None).await;
        assert!(!state.engine.is_arbitrage_enabled());
        let (_, body) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(body["arbitrage_enabled"], false);
        call(&app, "POST", "/api/arbitrage/enable", None).await;
        assert!(state.engine.is_arbitrage_enabled());
    }
}
