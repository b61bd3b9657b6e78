use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use crate::config;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyParseError {
    // Never echo the raw entry: it may carry credentials.
    #[error("expected host:port or host:port:user:pass, got {0} fields")]
    FieldCount(usize),
    #[error("invalid port")]
    Port,
    #[error("empty host")]
    Host,
}

/// One outbound identity: `host:port` with an optional credential pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
}

impl ProxyEntry {
    pub fn parse(raw: &str) -> Result<Self, ProxyParseError> {
        let parts: Vec<&str> = raw.trim().split(':').collect();
        let (host, port, credentials) = match parts.as_slice() {
            [host, port] => (*host, *port, None),
            [host, port, user, pass] => (*host, *port, Some(((*user).to_string(), (*pass).to_string()))),
            other => return Err(ProxyParseError::FieldCount(other.len())),
        };
        if host.is_empty() {
            return Err(ProxyParseError::Host);
        }
        let port = port.parse::<u16>().map_err(|_| ProxyParseError::Port)?;
        Ok(Self {
            host: host.to_string(),
            port,
            credentials,
        })
    }

    /// Proxy URL in the form reqwest expects, credentials included.
    pub fn url(&self) -> String {
        match &self.credentials {
            Some((user, pass)) => format!(
                "http://{}:{}@{}:{}",
                urlencoding::encode(user),
                urlencoding::encode(pass),
                self.host,
                self.port
            ),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    /// Log-safe label.
    pub fn masked(&self) -> String {
        if self.credentials.is_some() {
            format!("***@{}:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub cooldown: Duration,
    /// Consecutive 429s before a proxy is benched.
    pub soft_strike_limit: u32,
    /// Consecutive hard failures (403, network) before a proxy is benched.
    pub hard_strike_limit: u32,
    pub max_reuse: u32,
}

impl PoolSettings {
    pub fn from_config(cfg: &config::Proxy) -> Self {
        Self {
            cooldown: Duration::from_secs(cfg.cooldown_secs),
            soft_strike_limit: cfg.soft_strike_limit,
            hard_strike_limit: cfg.hard_strike_limit,
            max_reuse: cfg.max_reuse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    /// Soft failure: the upstream throttled us.
    RateLimited,
    /// Hard failure: forbidden, connection error or timeout.
    Failure,
}

impl From<bool> for ProxyOutcome {
    fn from(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStats {
    pub label: String,
    pub successes: u64,
    pub failures: u64,
    pub in_use: u32,
    pub degraded: bool,
}

#[derive(Debug, Default)]
struct SlotHealth {
    in_use: u32,
    soft_strikes: u32,
    hard_strikes: u32,
    degraded_until: Option<Instant>,
    successes: u64,
    failures: u64,
}

#[derive(Debug)]
struct PoolState {
    cursor: usize,
    slots: Vec<SlotHealth>,
}

struct Inner {
    entries: Vec<ProxyEntry>,
    labels: Vec<String>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    released: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_pick(&self, now: Instant) -> Option<usize> {
        let n = self.entries.len();
        let max_reuse = self.settings.max_reuse;
        let mut state = self.lock();
        let start = state.cursor;

        let mut picked = None;
        let mut any_healthy = false;
        for offset in 0..n {
            let i = (start + offset) % n;
            let slot = &mut state.slots[i];
            if let Some(until) = slot.degraded_until {
                if now >= until {
                    slot.degraded_until = None;
                    slot.soft_strikes = 0;
                    slot.hard_strikes = 0;
                    tracing::info!(proxy = %self.labels[i], "proxy recovered from cooldown");
                }
            }
            if slot.degraded_until.is_none() {
                any_healthy = true;
                if slot.in_use < max_reuse {
                    slot.in_use += 1;
                    picked = Some(i);
                    break;
                }
            }
        }

        if picked.is_none() && !any_healthy {
            // Every proxy is benched: use the one that recovers first.
            picked = state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.in_use < max_reuse)
                .min_by_key(|(_, s)| s.degraded_until)
                .map(|(i, _)| i);
            if let Some(i) = picked {
                state.slots[i].in_use += 1;
                tracing::warn!(
                    proxy = %self.labels[i],
                    "all proxies cooling down; using the one closest to recovery"
                );
            }
        }

        if let Some(i) = picked {
            state.cursor = (i + 1) % n;
        }
        picked
    }

    fn release(&self, index: usize) {
        {
            let mut state = self.lock();
            let slot = &mut state.slots[index];
            slot.in_use = slot.in_use.saturating_sub(1);
        }
        self.released.notify_waiters();
    }

    fn record(&self, index: usize, outcome: ProxyOutcome, now: Instant) {
        let mut state = self.lock();
        let slot = &mut state.slots[index];
        let benched = match outcome {
            ProxyOutcome::Success => {
                slot.successes += 1;
                slot.soft_strikes = 0;
                slot.hard_strikes = 0;
                false
            }
            ProxyOutcome::RateLimited => {
                slot.failures += 1;
                slot.soft_strikes += 1;
                slot.soft_strikes >= self.settings.soft_strike_limit
            }
            ProxyOutcome::Failure => {
                slot.failures += 1;
                slot.hard_strikes += 1;
                slot.hard_strikes >= self.settings.hard_strike_limit
            }
        };
        if benched && slot.degraded_until.is_none() {
            slot.degraded_until = Some(now + self.settings.cooldown);
            slot.soft_strikes = 0;
            slot.hard_strikes = 0;
            drop(state);
            metrics::counter!("auditor_proxy_degraded_total").increment(1);
            tracing::warn!(
                proxy = %self.labels[index],
                cooldown_secs = self.settings.cooldown.as_secs(),
                ?outcome,
                "proxy degraded"
            );
        }
    }
}

/// Rotating set of outbound proxies with per-proxy health.
///
/// Clone is cheap; clones share health state.
#[derive(Clone)]
pub struct ProxyPool {
    inner: Arc<Inner>,
}

/// A proxy lent out by [`ProxyPool::acquire`]. Returned to the pool on drop.
pub struct ProxyHandle {
    pool: Arc<Inner>,
    index: usize,
}

impl ProxyHandle {
    pub fn url(&self) -> String {
        self.pool.entries[self.index].url()
    }

    pub fn label(&self) -> &str {
        &self.pool.labels[self.index]
    }
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("proxy", &self.label())
            .finish()
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl ProxyPool {
    /// Build a pool starting at a random position. An empty `entries` list
    /// means direct connections.
    pub fn new(entries: Vec<ProxyEntry>, settings: PoolSettings) -> Self {
        let start = if entries.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..entries.len())
        };
        Self::with_cursor(entries, settings, start)
    }

    pub fn disabled() -> Self {
        Self::with_cursor(
            Vec::new(),
            PoolSettings {
                cooldown: Duration::from_secs(60),
                soft_strike_limit: 1,
                hard_strike_limit: 1,
                max_reuse: 1,
            },
            0,
        )
    }

    fn with_cursor(entries: Vec<ProxyEntry>, settings: PoolSettings, cursor: usize) -> Self {
        let labels = entries.iter().map(ProxyEntry::masked).collect();
        let slots = entries.iter().map(|_| SlotHealth::default()).collect();
        Self {
            inner: Arc::new(Inner {
                entries,
                labels,
                settings,
                state: Mutex::new(PoolState { cursor, slots }),
                released: Notify::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.inner.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Next usable proxy, or `None` in direct mode. Waits while every
    /// proxy is lent out `max_reuse` times.
    pub async fn acquire(&self) -> Option<ProxyHandle> {
        if self.inner.entries.is_empty() {
            return None;
        }
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(index) = self.inner.try_pick(Instant::now()) {
                return Some(ProxyHandle {
                    pool: Arc::clone(&self.inner),
                    index,
                });
            }
            notified.await;
        }
    }

    /// Record how a request through `handle` went and return the handle to the pool.
    pub fn report_outcome(&self, handle: ProxyHandle, outcome: ProxyOutcome) {
        self.inner.record(handle.index, outcome, Instant::now());
    }

    pub fn stats(&self) -> Vec<ProxyStats> {
        let now = Instant::now();
        let state = self.inner.lock();
        state
            .slots
            .iter()
            .zip(&self.inner.labels)
            .map(|(slot, label)| ProxyStats {
                label: label.clone(),
                successes: slot.successes,
                failures: slot.failures,
                in_use: slot.in_use,
                degraded: slot.degraded_until.is_some_and(|until| now < until),
            })
            .collect()
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        let healthy = stats.iter().filter(|s| !s.degraded).count();
        tracing::info!(healthy, total = stats.len(), "proxy pool summary");
        for s in stats {
            tracing::info!(
                proxy = %s.label,
                successes = s.successes,
                failures = s.failures,
                degraded = s.degraded,
                "proxy stats"
            );
        }
    }
}
