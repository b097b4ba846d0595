//! Route selection - which transport an outbound call uses
//!
//! Fixed priority ladder, evaluated fresh for every call:
//! 1. breaker open  -> Direct
//! 2. SOCKS5 proxy  -> SocksProxy
//! 3. HTTP proxy    -> HttpProxy
//! 4. otherwise     -> Direct

use crate::config::ProxyConfig;
use crate::gateway::circuit_breaker::CircuitBreaker;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Direct,
    SocksProxy { host: String, port: u16 },
    HttpProxy { url: String },
}

impl RouteDecision {
    pub fn is_direct(&self) -> bool {
        matches!(self, RouteDecision::Direct)
    }

    /// Short name for logs and status output (never includes credentials)
    pub fn kind(&self) -> &'static str {
        match self {
            RouteDecision::Direct => "direct",
            RouteDecision::SocksProxy { .. } => "socks5",
            RouteDecision::HttpProxy { .. } => "http_proxy",
        }
    }
}

impl fmt::Display for RouteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDecision::Direct => write!(f, "direct"),
            RouteDecision::SocksProxy { host, port } => write!(f, "socks5://{}:{}", host, port),
            RouteDecision::HttpProxy { url } => {
                let shown = ProxyConfig {
                    socks5: None,
                    http_url: Some(url.clone()),
                }
                .http_url_redacted()
                .unwrap_or_default();
                write!(f, "{}", shown)
            }
        }
    }
}

/// Pick the route for a call at `now`. Pure: no state is read besides the
/// arguments, and nothing is cached between calls.
pub fn select_route(now: Instant, breaker: &CircuitBreaker, proxy: &ProxyConfig) -> RouteDecision {
    if breaker.is_open(now) {
        return RouteDecision::Direct;
    }

    if let Some(socks) = &proxy.socks5 {
        return RouteDecision::SocksProxy {
            host: socks.host.clone(),
            port: socks.port,
        };
    }

    if let Some(url) = &proxy.http_url {
        return RouteDecision::HttpProxy { url: url.clone() };
    }

    RouteDecision::Direct
}
