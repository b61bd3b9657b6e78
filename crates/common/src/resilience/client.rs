use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::breaker::{Admission, BreakerSettings, BreakerState, CircuitBreaker};
use super::retry::{RetryPolicy, RetryableFailure};
use super::transport::{Transport, TransportError, TransportResponse, UpstreamRequest};
use super::{ClientError, EndpointClass};
use crate::config;
use crate::proxy_pool::{ProxyHandle, ProxyOutcome, ProxyPool};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub max_concurrent: usize,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker: BreakerSettings,
    pub request_delay_min: Duration,
    pub request_delay_max: Duration,
}

impl ClientSettings {
    /// Thresholds and backoffs depend on whether requests actually go through proxies.
    pub fn from_config(ep: &config::Endpoint, proxied: bool) -> Self {
        let threshold = if proxied {
            ep.breaker_threshold
        } else {
            ep.breaker_threshold_no_proxy
        };
        Self {
            max_concurrent: ep.max_concurrent,
            request_timeout: ep.request_timeout(),
            retry: RetryPolicy::from_config(ep, proxied),
            breaker: BreakerSettings {
                threshold,
                window: Duration::from_secs(ep.breaker_window_secs),
                cooldown: Duration::from_secs(ep.breaker_cooldown_secs),
            },
            request_delay_min: Duration::from_millis(ep.request_delay_min_ms),
            request_delay_max: Duration::from_millis(ep.request_delay_max_ms),
        }
    }
}

/// What a single attempt amounted to.
enum Attempt {
    Success(Vec<u8>),
    RateLimited,
    Forbidden,
    Transient(String),
    Rejected(u16),
}

fn classify(result: Result<TransportResponse, TransportError>) -> Attempt {
    match result {
        Ok(resp) => match resp.status {
            200..=299 => Attempt::Success(resp.body),
            429 => Attempt::RateLimited,
            403 => Attempt::Forbidden,
            500..=599 => Attempt::Transient(format!("HTTP {}", resp.status)),
            status => Attempt::Rejected(status),
        },
        Err(e) => Attempt::Transient(e.to_string()),
    }
}

/// HTTP client for one endpoint class. Every upstream call goes through
/// [`ResilientClient::get_json`].
pub struct ResilientClient<T: Transport> {
    endpoint: EndpointClass,
    transport: T,
    proxies: ProxyPool,
    gate: Arc<Semaphore>,
    max_concurrent: usize,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeout: Duration,
    delay_range: (Duration, Duration),
}

impl<T: Transport> ResilientClient<T> {
    pub fn new(
        endpoint: EndpointClass,
        transport: T,
        proxies: ProxyPool,
        settings: ClientSettings,
    ) -> Self {
        Self {
            endpoint,
            transport,
            proxies,
            gate: Arc::new(Semaphore::new(settings.max_concurrent)),
            max_concurrent: settings.max_concurrent,
            breaker: CircuitBreaker::new(endpoint, settings.breaker),
            retry: settings.retry,
            timeout: settings.request_timeout,
            delay_range: (settings.request_delay_min, settings.request_delay_max),
        }
    }

    pub fn from_config(
        endpoint: EndpointClass,
        transport: T,
        proxies: ProxyPool,
        ep: &config::Endpoint,
    ) -> Self {
        let settings = ClientSettings::from_config(ep, proxies.is_enabled());
        Self::new(endpoint, transport, proxies, settings)
    }

    pub fn endpoint(&self) -> EndpointClass {
        self.endpoint
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.gate.available_permits()
    }

    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    /// Issue `request` and decode the body as JSON.
    ///
    /// Transient failures are retried here; only the terminal outcome is
    /// returned. Open circuits fail fast without touching the network.
    pub async fn get_json(
        &self,
        request: &UpstreamRequest,
    ) -> Result<serde_json::Value, ClientError> {
        let Ok(_permit) = self.gate.acquire().await else {
            return Err(ClientError::CircuitOpen {
                endpoint: self.endpoint,
            });
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let admission = self.breaker.admit().inspect_err(|_| {
                metrics::counter!(
                    "auditor_api_errors_total",
                    "endpoint" => self.endpoint.as_str(),
                    "kind" => "circuit_open"
                )
                .increment(1);
            })?;

            self.pace().await;
            let proxy = self.proxies.acquire().await;
            let result = self.send_once(request, proxy.as_ref()).await;

            let failure = match classify(result) {
                Attempt::Success(body) => {
                    self.report_proxy(proxy, ProxyOutcome::Success);
                    self.breaker.on_success(admission);
                    return serde_json::from_slice(&body).map_err(|e| {
                        self.count_error("malformed");
                        ClientError::Malformed {
                            reason: format!("invalid JSON: {e}"),
                        }
                    });
                }
                Attempt::Rejected(status) => {
                    // The upstream answered; the input is the problem, not the route.
                    self.report_proxy(proxy, ProxyOutcome::Success);
                    self.breaker.on_success(admission);
                    self.count_error("rejected");
                    tracing::debug!(endpoint = %self.endpoint, status, url = %request.url, "request rejected");
                    return Err(ClientError::Rejected { status });
                }
                Attempt::RateLimited => {
                    self.report_proxy(proxy, ProxyOutcome::RateLimited);
                    self.breaker.on_neutral(admission);
                    (RetryableFailure::RateLimited, None)
                }
                Attempt::Forbidden => {
                    self.report_proxy(proxy, ProxyOutcome::Failure);
                    self.breaker.on_failure(admission);
                    (RetryableFailure::Forbidden, None)
                }
                Attempt::Transient(message) => {
                    self.report_proxy(proxy, ProxyOutcome::Failure);
                    self.breaker.on_failure(admission);
                    (RetryableFailure::Network, Some(message))
                }
            };

            let (kind, message) = failure;
            if !self.retry.should_retry(attempt) {
                let err = match kind {
                    RetryableFailure::RateLimited => ClientError::RateLimited { attempts: attempt },
                    RetryableFailure::Forbidden => ClientError::Forbidden { attempts: attempt },
                    RetryableFailure::Network => ClientError::TransientNetwork {
                        attempts: attempt,
                        message: message.unwrap_or_default(),
                    },
                };
                self.count_error(err.kind());
                tracing::warn!(endpoint = %self.endpoint, url = %request.url, error = %err, "giving up on request");
                return Err(err);
            }

            let wait = self.retry.delay(kind, attempt);
            tracing::debug!(
                endpoint = %self.endpoint,
                attempt,
                ?kind,
                wait_ms = wait.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn send_once(
        &self,
        request: &UpstreamRequest,
        proxy: Option<&ProxyHandle>,
    ) -> Result<TransportResponse, TransportError> {
        let proxy_url = proxy.map(ProxyHandle::url);
        let start = Instant::now();
        let res = tokio::time::timeout(
            self.timeout,
            self.transport.send(request, proxy_url.as_deref()),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let endpoint = self.endpoint.as_str();
        metrics::histogram!("auditor_api_latency_ms", "endpoint" => endpoint).record(ms);
        let status = match &res {
            Ok(r) if (200..300).contains(&r.status) => "ok",
            _ => "error",
        };
        metrics::counter!("auditor_api_requests_total", "endpoint" => endpoint, "status" => status)
            .increment(1);
        if let Some(p) = proxy {
            tracing::trace!(endpoint, proxy = %p.label(), ms, "upstream attempt finished");
        }
        res
    }

    fn report_proxy(&self, proxy: Option<ProxyHandle>, outcome: ProxyOutcome) {
        if let Some(handle) = proxy {
            self.proxies.report_outcome(handle, outcome);
        }
    }

    fn count_error(&self, kind: &'static str) {
        metrics::counter!(
            "auditor_api_errors_total",
            "endpoint" => self.endpoint.as_str(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Randomized pre-request delay; keeps request timing from looking scripted.
    async fn pace(&self) {
        let (min, max) = self.delay_range;
        if max.is_zero() {
            return;
        }
        let wait = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        tokio::time::sleep(wait).await;
    }
}
