//! Request Gateway - every outbound exchange / market-data call goes here
//!
//! Per call:
//! 1. Trade-eligible calls are refused up front if the kill-switch is off
//! 2. A route is selected against the current breaker state
//! 3. The request is issued on that route's transport
//! 4. The outcome is classified and bookkept (breaker, kill-switch)
//! 5. Failures are returned to the caller, never swallowed
//!
//! No retries happen here. Retry policy belongs to the caller.

use crate::config::GatewayConfig;
use crate::gateway::health::RouteHealth;
use crate::gateway::route::RouteDecision;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONTENT_TYPE, USER_AGENT,
};
use reqwest::{Client, ClientBuilder, Proxy, Response};
use serde::de::DeserializeOwned;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

pub use reqwest::Method;

const USER_AGENT_VALUE: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

// Linux errno values; io::ErrorKind has no stable variants for these
const ENETUNREACH: i32 = 101;
const EHOSTUNREACH: i32 = 113;

// ==========================================
// Error Types
// ==========================================

/// Why a call counted as a connectivity failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityKind {
    ConnectionRefused,
    DnsFailure,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionReset,
    Timeout,
    /// Connect phase failed without a more specific cause
    ConnectFailed,
}

impl fmt::Display for ConnectivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityKind::ConnectionRefused => "connection refused",
            ConnectivityKind::DnsFailure => "dns failure",
            ConnectivityKind::NetworkUnreachable => "network unreachable",
            ConnectivityKind::HostUnreachable => "host unreachable",
            ConnectivityKind::ConnectionReset => "connection reset",
            ConnectivityKind::Timeout => "timeout",
            ConnectivityKind::ConnectFailed => "connect failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Connectivity failure via {route} ({kind}): {source}")]
    Connectivity {
        kind: ConnectivityKind,
        route: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Upstream unavailable via {route}: HTTP {status}")]
    Upstream { status: u16, route: String },
    #[error("Geo-blocked by {url}: HTTP {status}")]
    GeoBlocked { status: u16, url: String },
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Kill-switch engaged - trade-eligible requests are blocked")]
    KillSwitchEngaged,
    #[error("Request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("Failed to decode response: {0}")]
    Decode(String),
    #[error("Failed to build transport: {0}")]
    Build(String),
}

impl GatewayError {
    /// Retryable failures that fed the circuit breaker
    pub fn is_connectivity(&self) -> bool {
        matches!(self, GatewayError::Connectivity { .. } | GatewayError::Upstream { .. })
    }

    pub fn is_geo_blocked(&self) -> bool {
        matches!(self, GatewayError::GeoBlocked { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Upstream { status, .. }
            | GatewayError::GeoBlocked { status, .. }
            | GatewayError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// ==========================================
// Request Types
// ==========================================

#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(String),
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post_form(url: impl Into<String>, form: String) -> Self {
        Self::new(Method::POST, url).with_body(RequestBody::Form(form))
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

// ==========================================
// Transports
// ==========================================

/// One pooled client per configured route. Selection still happens per call.
struct Transports {
    direct: Client,
    socks: Option<Client>,
    http: Option<Client>,
}

impl Transports {
    fn build(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let direct = base_builder(config)
            .no_proxy()
            .build()
            .map_err(|e| GatewayError::Build(e.to_string()))?;

        let socks = match &config.proxy.socks5 {
            Some(socks) => {
                let proxy = Proxy::all(format!("socks5h://{}:{}", socks.host, socks.port))
                    .map_err(|e| GatewayError::Build(e.to_string()))?;
                Some(
                    base_builder(config)
                        .proxy(proxy)
                        .build()
                        .map_err(|e| GatewayError::Build(e.to_string()))?,
                )
            }
            None => None,
        };

        let http = match &config.proxy.http_url {
            Some(url) => {
                let proxy = Proxy::all(url.as_str()).map_err(|e| GatewayError::Build(e.to_string()))?;
                Some(
                    base_builder(config)
                        .proxy(proxy)
                        .build()
                        .map_err(|e| GatewayError::Build(e.to_string()))?,
                )
            }
            None => None,
        };

        Ok(Self { direct, socks, http })
    }

    fn client_for(&self, route: &RouteDecision) -> &Client {
        match route {
            RouteDecision::Direct => &self.direct,
            RouteDecision::SocksProxy { .. } => self.socks.as_ref().unwrap_or(&self.direct),
            RouteDecision::HttpProxy { .. } => self.http.as_ref().unwrap_or(&self.direct),
        }
    }
}

fn base_builder(config: &GatewayConfig) -> ClientBuilder {
    Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.timeout)
        .default_headers(browser_headers())
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers
}

// ==========================================
// Gateway
// ==========================================

pub struct Gateway {
    config: GatewayConfig,
    health: Arc<RouteHealth>,
    transports: Transports,
}

impl Gateway {
    pub fn new(config: GatewayConfig, health: Arc<RouteHealth>) -> Result<Self, GatewayError> {
        let transports = Transports::build(&config)?;
        Ok(Self {
            config,
            health,
            transports,
        })
    }

    /// Route the next call would take right now
    pub fn current_route(&self) -> RouteDecision {
        self.health.route_for(Instant::now(), &self.config.proxy)
    }

    /// Market-data style call. Never blocked by the kill-switch, but a
    /// 403/451 response still trips it.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response, GatewayError> {
        let mut req = OutboundRequest::new(method, url);
        req.body = body.map(RequestBody::Json);
        self.dispatch(req, false).await
    }

    pub async fn send(&self, req: OutboundRequest) -> Result<Response, GatewayError> {
        self.dispatch(req, false).await
    }

    /// Trade-eligible call: refused before any I/O once the kill-switch is off
    pub async fn trade_request(&self, req: OutboundRequest) -> Result<Response, GatewayError> {
        self.dispatch(req, true).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, GatewayError> {
        let response = self.send(OutboundRequest::get(url)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn dispatch(&self, req: OutboundRequest, trade_eligible: bool) -> Result<Response, GatewayError> {
        if trade_eligible && !self.health.kill_switch().is_enabled() {
            warn!("Blocked {} {} - kill-switch engaged", req.method, req.url);
            return Err(GatewayError::KillSwitchEngaged);
        }

        let route = self.current_route();
        let client = self.transports.client_for(&route);
        debug!("{} {} via {}", req.method, req.url, route);

        let mut builder = client.request(req.method.clone(), &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match req.body {
            Some(RequestBody::Json(value)) => builder.json(&value),
            Some(RequestBody::Form(form)) => builder
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(form),
            None => builder,
        };

        match builder.send().await {
            Ok(response) => self.handle_response(response, &route, &req.url).await,
            Err(err) => Err(self.handle_transport_error(err, &route, &req.url)),
        }
    }

    async fn handle_response(
        &self,
        response: Response,
        route: &RouteDecision,
        url: &str,
    ) -> Result<Response, GatewayError> {
        let status = response.status().as_u16();

        if response.status().is_success() || response.status().is_redirection() {
            self.health.record_success();
            return Ok(response);
        }

        match status {
            403 | 451 => {
                self.health.kill_switch().trip(status, url);
                Err(GatewayError::GeoBlocked {
                    status,
                    url: url.to_string(),
                })
            }
            502 | 503 => {
                self.health.record_failure(Instant::now());
                warn!("Upstream HTTP {} via {} for {}", status, route, url);
                Err(GatewayError::Upstream {
                    status,
                    route: route.to_string(),
                })
            }
            _ => {
                let body = match response.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        debug!("Failed to read HTTP {} body from {}: {}", status, url, e);
                        format!("<unreadable body: {}>", e)
                    }
                };
                debug!("HTTP {} from {}: {}", status, url, body);
                Err(GatewayError::Http { status, body })
            }
        }
    }

    fn handle_transport_error(&self, err: reqwest::Error, route: &RouteDecision, url: &str) -> GatewayError {
        match classify_transport_error(&err) {
            Some(kind) => {
                self.health.record_failure(Instant::now());
                warn!("Connectivity failure via {} for {}: {}", route, url, kind);
                GatewayError::Connectivity {
                    kind,
                    route: route.to_string(),
                    source: err,
                }
            }
            None => {
                debug!("Non-connectivity transport error for {}: {}", url, err);
                GatewayError::Transport(err)
            }
        }
    }
}

// ==========================================
// Error Classification
// ==========================================

/// Classify a reqwest failure; `None` means it is not a connectivity failure
pub fn classify_transport_error(err: &reqwest::Error) -> Option<ConnectivityKind> {
    if err.is_timeout() {
        return Some(ConnectivityKind::Timeout);
    }
    if let Some(kind) = classify_error_chain(err) {
        return Some(kind);
    }
    if err.is_connect() {
        return Some(ConnectivityKind::ConnectFailed);
    }
    None
}

/// Walk an error's source chain looking for a known connectivity cause
pub fn classify_error_chain(err: &(dyn StdError + 'static)) -> Option<ConnectivityKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);

    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if let Some(kind) = classify_io_error(io_err) {
                return Some(kind);
            }
        }
        if let Some(kind) = classify_message(&e.to_string()) {
            return Some(kind);
        }
        current = e.source();
    }

    None
}

fn classify_io_error(err: &io::Error) -> Option<ConnectivityKind> {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => return Some(ConnectivityKind::ConnectionRefused),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => return Some(ConnectivityKind::ConnectionReset),
        io::ErrorKind::TimedOut => return Some(ConnectivityKind::Timeout),
        _ => {}
    }
    match err.raw_os_error() {
        Some(ENETUNREACH) => Some(ConnectivityKind::NetworkUnreachable),
        Some(EHOSTUNREACH) => Some(ConnectivityKind::HostUnreachable),
        _ => None,
    }
}

fn classify_message(message: &str) -> Option<ConnectivityKind> {
    let msg = message.to_ascii_lowercase();
    if msg.contains("dns error")
        || msg.contains("failed to lookup address")
        || msg.contains("name or service not known")
        || msg.contains("no such host")
    {
        Some(ConnectivityKind::DnsFailure)
    } else if msg.contains("network is unreachable") {
        Some(ConnectivityKind::NetworkUnreachable)
    } else if msg.contains("no route to host") || msg.contains("host is unreachable") {
        Some(ConnectivityKind::HostUnreachable)
    } else if msg.contains("connection reset") {
        Some(ConnectivityKind::ConnectionReset)
    } else if msg.contains("connection refused") {
        Some(ConnectivityKind::ConnectionRefused)
    } else if msg.contains("timed out") {
        Some(ConnectivityKind::Timeout)
    } else {
        None
    }
}
