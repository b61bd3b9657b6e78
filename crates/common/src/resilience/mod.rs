//! Shared resilience core for every upstream call: a concurrency gate, a
//! per-endpoint circuit breaker, one retry policy and proxy rotation.

mod breaker;
mod client;
mod retry;
mod transport;

pub use breaker::{Admission, BreakerSettings, BreakerState, CircuitBreaker};
pub use client::{ClientSettings, ResilientClient};
pub use retry::{RetryPolicy, RetryableFailure};
pub use transport::{
    HttpTransport, Transport, TransportError, TransportResponse, UpstreamRequest,
};

use std::fmt;
use thiserror::Error;

/// Logical upstream. Each class gets its own breaker and concurrency gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Discovery,
    Audit,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Audit => "audit",
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a [`ResilientClient`] call that did not succeed.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("circuit open for {endpoint} endpoint")]
    CircuitOpen { endpoint: EndpointClass },
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("forbidden after {attempts} attempts")]
    Forbidden { attempts: u32 },
    #[error("network error after {attempts} attempts: {message}")]
    TransientNetwork { attempts: u32, message: String },
    #[error("upstream rejected request with HTTP {status}")]
    Rejected { status: u16 },
    #[error("malformed response: {reason}")]
    Malformed { reason: String },
}

impl ClientError {
    /// Stable short name used in metrics, the failure log and exports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimited { .. } => "rate_limited",
            Self::Forbidden { .. } => "forbidden",
            Self::TransientNetwork { .. } => "network",
            Self::Rejected { .. } => "rejected",
            Self::Malformed { .. } => "malformed",
        }
    }
}
