//! Gateway module - resilient outbound request path
//!
//! All exchange and market-data traffic leaves the process through
//! `Gateway`, which picks a route (direct / SOCKS5 / HTTP proxy) against
//! the shared `RouteHealth`, feeds its circuit breaker and trips the
//! geo-block kill-switch.

mod circuit_breaker;
mod client;
mod health;
mod route;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker};
pub use client::{
    classify_error_chain, classify_transport_error, ConnectivityKind, Gateway, GatewayError, Method,
    OutboundRequest, RequestBody,
};
pub use health::{KillSwitch, KillSwitchTrip, RouteHealth};
pub use route::{select_route, RouteDecision};
