use std::time::Duration;

use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableFailure {
    RateLimited,
    Forbidden,
    Network,
}

/// Retry/backoff rules for one endpoint class, shared by every call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub rate_limit_backoff: Duration,
    pub forbidden_backoff: Duration,
    pub network_backoff_base: Duration,
    pub network_backoff_max: Duration,
}

impl RetryPolicy {
    /// Direct connections get the longer backoffs: every failure lands on the same IP.
    pub fn from_config(ep: &config::Endpoint, proxied: bool) -> Self {
        let (rate_limit, forbidden) = if proxied {
            (ep.rate_limit_backoff_secs, ep.forbidden_backoff_secs)
        } else {
            (
                ep.rate_limit_backoff_no_proxy_secs,
                ep.forbidden_backoff_no_proxy_secs,
            )
        };
        Self {
            max_retries: ep.max_retries,
            rate_limit_backoff: Duration::from_secs(rate_limit),
            forbidden_backoff: Duration::from_secs(forbidden),
            network_backoff_base: Duration::from_millis(ep.network_backoff_base_ms),
            network_backoff_max: Duration::from_millis(ep.network_backoff_max_ms),
        }
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Sleep before the attempt after `attempt` (1-based) failed with `failure`.
    pub fn delay(&self, failure: RetryableFailure, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match failure {
            RetryableFailure::RateLimited => self.rate_limit_backoff.saturating_mul(attempt),
            RetryableFailure::Forbidden => self.forbidden_backoff.saturating_mul(attempt),
            RetryableFailure::Network => {
                let exp = 1u32 << (attempt - 1).min(16);
                self.network_backoff_base
                    .saturating_mul(exp)
                    .min(self.network_backoff_max)
            }
        }
    }
}
