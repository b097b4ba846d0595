//! Kraken-style signed REST client
//!
//! Private endpoints are signed with API-Key + API-Sign headers:
//! 1. SHA256(nonce + POST data)
//! 2. HMAC-SHA512(URI path + sha256 hash) keyed with the base64-decoded secret
//! 3. base64 of the HMAC goes into API-Sign
//!
//! Every call leaves through the shared `Gateway`. Private calls are
//! trade-eligible and therefore refused while the kill-switch is engaged.

use crate::exchange::{ExchangeClient, ExchangeError, OrderAck, OrderRequest, Ticker};
use crate::gateway::{Gateway, OutboundRequest};
use crate::registry::redact_key;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

type HmacSha512 = Hmac<Sha512>;

pub struct KrakenClient {
    base_url: String,
    api_key: String,
    api_secret: Vec<u8>,
    gateway: Arc<Gateway>,
    // Must strictly increase per API key
    nonce_counter: AtomicU64,
}

impl KrakenClient {
    pub fn new(
        base_url: &str,
        api_key: String,
        api_secret: &str,
        gateway: Arc<Gateway>,
    ) -> Result<Self, ExchangeError> {
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(ExchangeError::NotConfigured);
        }

        let decoded_secret = BASE64
            .decode(api_secret)
            .map_err(|e| ExchangeError::InvalidSecret(e.to_string()))?;

        let initial_nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret: decoded_secret,
            gateway,
            nonce_counter: AtomicU64::new(initial_nonce),
        })
    }

    fn next_nonce(&self) -> u64 {
        self.nonce_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn sign_request(&self, uri_path: &str, nonce: u64, post_data: &str) -> Result<String, ExchangeError> {
        let mut sha256 = Sha256::new();
        sha256.update(nonce.to_string().as_bytes());
        sha256.update(post_data.as_bytes());
        let sha256_hash = sha256.finalize();

        let mut hmac = HmacSha512::new_from_slice(&self.api_secret)
            .map_err(|e| ExchangeError::InvalidSecret(e.to_string()))?;
        hmac.update(uri_path.as_bytes());
        hmac.update(&sha256_hash);

        Ok(BASE64.encode(hmac.finalize().into_bytes()))
    }

    /// Redacted key for logs
    pub fn api_key_redacted(&self) -> String {
        redact_key(&self.api_key)
    }

    async fn post_private(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value, ExchangeError> {
        let uri_path = format!("/0/private/{}", endpoint);
        let nonce = self.next_nonce();

        let mut post_data = format!("nonce={}", nonce);
        for (key, value) in params {
            post_data.push_str(&format!("&{}={}", key, value));
        }

        let signature = self.sign_request(&uri_path, nonce, &post_data)?;
        let request = OutboundRequest::post_form(format!("{}{}", self.base_url, uri_path), post_data)
            .header("API-Key", self.api_key.as_str())
            .header("API-Sign", signature);

        debug!("Private call {} as {}", endpoint, self.api_key_redacted());
        let response = self.gateway.trade_request(request).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;
        take_result(body)
    }

    async fn get_public(&self, endpoint: &str, query: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}/0/public/{}?{}", self.base_url, endpoint, query);
        let body: Value = self.gateway.get_json(&url).await?;
        take_result(body)
    }
}

/// Kraken reports failures in an `error` array even on HTTP 200
fn take_result(mut body: Value) -> Result<Value, ExchangeError> {
    if let Some(errors) = body.get("error").and_then(|e| e.as_array()) {
        if !errors.is_empty() {
            let messages: Vec<String> = errors
                .iter()
                .filter_map(|e| e.as_str().map(String::from))
                .collect();
            return Err(ExchangeError::Api(messages.join(", ")));
        }
    }
    body.get_mut("result")
        .map(Value::take)
        .ok_or_else(|| ExchangeError::Decode("missing result".to_string()))
}

fn parse_level(value: &Value, key: &str) -> Option<f64> {
    value.get(key)?.get(0)?.as_str()?.parse().ok()
}

#[async_trait]
impl ExchangeClient for KrakenClient {
    fn name(&self) -> &str {
        "kraken"
    }

    async fn get_balance(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let result = self.post_private("Balance", &[]).await?;
        let object = result
            .as_object()
            .ok_or_else(|| ExchangeError::Decode("balance result is not an object".to_string()))?;

        Ok(object
            .iter()
            .filter_map(|(asset, amount)| {
                amount
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|v| (asset.clone(), v))
            })
            .collect())
    }

    async fn get_ticker(&self, pair: &str) -> Result<Ticker, ExchangeError> {
        let result = self.get_public("Ticker", &format!("pair={}", pair)).await?;
        let (_, data) = result
            .as_object()
            .and_then(|o| o.iter().next())
            .ok_or_else(|| ExchangeError::UnknownPair(pair.to_string()))?;

        match (parse_level(data, "b"), parse_level(data, "a")) {
            (Some(bid), Some(ask)) => Ok(Ticker {
                pair: pair.to_string(),
                bid,
                ask,
            }),
            _ => Err(ExchangeError::Decode(format!("malformed ticker for {}", pair))),
        }
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("ordertype", if order.limit_price.is_some() { "limit" } else { "market" }.to_string()),
            ("pair", order.pair.clone()),
        ];
        if let Some(price) = order.limit_price {
            params.push(("price", price.to_string()));
        }
        params.push(("type", order.side.to_string()));
        params.push(("volume", order.volume.to_string()));

        let result = self.post_private("AddOrder", &params).await?;
        let order_id = result
            .get("txid")
            .and_then(|t| t.get(0))
            .and_then(|t| t.as_str())
            .ok_or_else(|| ExchangeError::Decode("AddOrder returned no txid".to_string()))?;

        Ok(OrderAck {
            order_id: order_id.to_string(),
            pair: order.pair.clone(),
            side: order.side,
            volume: order.volume,
            price: None,
            fee: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::exchange::OrderSide;
    use crate::gateway::{GatewayError, RouteHealth};
    use axum::{http::HeaderMap, routing::{get, post}, Json, Router};
    use std::time::Duration;

    // Published example from the Kraken REST authentication docs
    const DOC_SECRET: &str =
        "kQH5HW/8p1uGOVjbgWA7FunAmGO8lsSUXNsu3eow76sz84Q18fWxnyRzBHCd3pd5nE9qa99HAZtuZuj6F1huXg==";

    fn gateway() -> (Arc<Gateway>, Arc<RouteHealth>) {
        let config = GatewayConfig {
            timeout: Duration::from_secs(2),
            ..GatewayConfig::default()
        };
        let health = Arc::new(RouteHealth::new(config.failure_threshold, config.cooldown));
        (Arc::new(Gateway::new(config, Arc::clone(&health)).unwrap()), health)
    }

    async fn balance_handler(headers: HeaderMap) -> Json<Value> {
        if headers.get("API-Key").is_none() || headers.get("API-Sign").is_none() {
            return Json(serde_json::json!({ "error": ["EAPI:Invalid key"] }));
        }
        Json(serde_json::json!({ "error": [], "result": { "ZUSD": "1250.5000", "XXBT": "0.0100000000" } }))
    }

    async fn spawn_exchange() -> String {
        let app = Router::new()
            .route("/0/private/Balance", post(balance_handler))
            .route(
                "/0/private/AddOrder",
                post(|| async {
                    Json(serde_json::json!({ "error": ["EOrder:Insufficient funds"] }))
                }),
            )
            .route(
                "/0/public/Ticker",
                get(|| async {
                    Json(serde_json::json!({
                        "error": [],
                        "result": { "XXBTZUSD": { "a": ["37501.0", "1", "1.0"], "b": ["37499.5", "2", "2.0"] } }
                    }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_signature_matches_reference() {
        let (gw, _) = gateway();
        let client = KrakenClient::new("https://api.kraken.com", "key".to_string(), DOC_SECRET, gw).unwrap();
        let signature = client
            .sign_request(
                "/0/private/AddOrder",
                1616492376594,
                "nonce=1616492376594&ordertype=limit&pair=XBTUSD&price=37500&type=buy&volume=1.25",
            )
            .unwrap();
        assert_eq!(
            signature,
            "4/dpxb3iT4tp/ZCVEwSnEsLxx0bqyhLpdfOpc6fn7OR8+UClSV5n9E6aSS8MPtnRfp32bAb0nmbRn6H8ndwLUQ=="
        );
    }

    #[test]
    fn test_nonce_increasing() {
        let (gw, _) = gateway();
        let client = KrakenClient::new("https://api.kraken.com", "key".to_string(), DOC_SECRET, gw).unwrap();
        let n1 = client.next_nonce();
        let n2 = client.next_nonce();
        assert!(n2 > n1);
    }

    #[test]
    fn test_rejects_missing_or_bad_secret() {
        let (gw, _) = gateway();
        assert!(matches!(
            KrakenClient::new("https://x", String::new(), DOC_SECRET, Arc::clone(&gw)),
            Err(ExchangeError::NotConfigured)
        ));
        assert!(matches!(
            KrakenClient::new("https://x", "key".to_string(), "not base64!!", gw),
            Err(ExchangeError::InvalidSecret(_))
        ));
    }

    #[tokio::test]
    async fn test_balance_and_ticker_through_gateway() {
        let base = spawn_exchange().await;
        let (gw, _) = gateway();
        let client = KrakenClient::new(&base, "abcd1234efgh".to_string(), DOC_SECRET, gw).unwrap();

        let balances = client.get_balance().await.unwrap();
        assert_eq!(balances["ZUSD"], 1250.5);

        let ticker = client.get_ticker("XBTUSD").await.unwrap();
        assert_eq!(ticker.bid, 37499.5);
        assert_eq!(ticker.ask, 37501.0);
    }

    #[tokio::test]
    async fn test_api_error_array_surfaces() {
        let base = spawn_exchange().await;
        let (gw, _) = gateway();
        let client = KrakenClient::new(&base, "abcd1234efgh".to_string(), DOC_SECRET, gw).unwrap();

        let err = client
            .place_order(&OrderRequest {
                pair: "XBTUSD".to_string(),
                side: OrderSide::Buy,
                volume: 0.01,
                limit_price: None,
            })
            .await
            .unwrap_err();
        match err {
            ExchangeError::Api(msg) => assert!(msg.contains("Insufficient funds")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_private_calls_refused_when_kill_switch_engaged() {
        let base = spawn_exchange().await;
        let (gw, health) = gateway();
        health.kill_switch().trip(451, "https://exchange");
        let client = KrakenClient::new(&base, "abcd1234efgh".to_string(), DOC_SECRET, gw).unwrap();

        let err = client.get_balance().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Gateway(GatewayError::KillSwitchEngaged)));

        // Public market data is not trade-eligible
        assert!(client.get_ticker("XBTUSD").await.is_ok());
    }

    #[test]
    fn test_api_key_redacted() {
        let (gw, _) = gateway();
        let client = KrakenClient::new("https://x", "abcd1234efgh".to_string(), DOC_SECRET, gw).unwrap();
        assert_eq!(client.api_key_redacted(), "abcd...efgh");
    }
}
