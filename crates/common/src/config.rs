use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::proxy_pool::ProxyEntry;

pub const CONFIG_PATH_ENV: &str = "AUDITOR_CONFIG";
pub const PROXIES_ENV: &str = "AUDITOR_PROXIES";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub proxy: Proxy,
    pub endpoints: Endpoints,
    pub qualification: Qualification,
    pub pipeline: Pipeline,
    pub discovery: Discovery,
    pub observability: Observability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Proxy {
    pub enabled: bool,
    #[serde(default)]
    pub entries: Vec<String>,
    pub cooldown_secs: u64,
    pub soft_strike_limit: u32,
    pub hard_strike_limit: u32,
    pub max_reuse: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoints {
    pub discovery: Endpoint,
    pub audit: Endpoint,
}

/// Tuning for one upstream endpoint class.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub base_url: String,
    pub max_concurrent: usize,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub breaker_threshold: u32,
    pub breaker_threshold_no_proxy: u32,
    pub breaker_window_secs: u64,
    pub breaker_cooldown_secs: u64,
    pub rate_limit_backoff_secs: u64,
    pub rate_limit_backoff_no_proxy_secs: u64,
    pub forbidden_backoff_secs: u64,
    pub forbidden_backoff_no_proxy_secs: u64,
    pub network_backoff_base_ms: u64,
    pub network_backoff_max_ms: u64,
    pub request_delay_min_ms: u64,
    pub request_delay_max_ms: u64,
    pub rotate_identity_every: u64,
}

impl Endpoint {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Qualification {
    pub min_pnl: f64,
    pub min_trades: u64,
    pub min_high_profit_tokens: u32,
    pub min_token_pnl: f64,
    pub bot_trade_threshold: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pipeline {
    pub batch_size: usize,
    pub batch_pause_min_ms: u64,
    pub batch_pause_max_ms: u64,
    pub audit_interval_hours: u32,
    pub failure_limit: u32,
    pub claim_ttl_secs: u64,
    pub max_failure_rate: f64,
    pub failure_rate_min_sample: usize,
    pub store_write_retries: u32,
    pub failed_wallets_path: String,
    pub register_portfolio_tokens: bool,
    pub preflight: bool,
    pub preflight_wallet: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Discovery {
    pub timeframes: Vec<String>,
    pub listing_limit: u32,
    pub max_concurrent_tokens: usize,
    #[serde(default)]
    pub manual_tokens: Vec<String>,
    #[serde(default)]
    pub banned_wallets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    /// Load from `$AUDITOR_CONFIG` (or `config/default.toml`) and append
    /// proxies from `$AUDITOR_PROXIES`.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config/default.toml".to_string());
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let mut config = Self::from_toml_str(&content)?;
        if let Ok(raw) = std::env::var(PROXIES_ENV) {
            config.proxy.entries.extend(split_proxy_list(&raw));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, ep) in [
            ("discovery", &self.endpoints.discovery),
            ("audit", &self.endpoints.audit),
        ] {
            ensure!(
                ep.max_concurrent > 0,
                "endpoints.{name}.max_concurrent must be > 0"
            );
            ensure!(
                ep.breaker_threshold > 0 && ep.breaker_threshold_no_proxy > 0,
                "endpoints.{name} breaker thresholds must be > 0"
            );
            ensure!(
                ep.request_timeout_secs > 0,
                "endpoints.{name}.request_timeout_secs must be > 0"
            );
            ensure!(
                ep.request_delay_min_ms <= ep.request_delay_max_ms,
                "endpoints.{name}.request_delay_min_ms must be <= request_delay_max_ms"
            );
            reqwest::Url::parse(&ep.base_url)
                .with_context(|| format!("endpoints.{name}.base_url is not a valid URL"))?;
        }

        ensure!(self.pipeline.batch_size > 0, "pipeline.batch_size must be > 0");
        ensure!(
            (0.0..=1.0).contains(&self.pipeline.max_failure_rate),
            "pipeline.max_failure_rate must be in [0, 1]"
        );
        ensure!(
            self.pipeline.batch_pause_min_ms <= self.pipeline.batch_pause_max_ms,
            "pipeline.batch_pause_min_ms must be <= batch_pause_max_ms"
        );
        ensure!(
            self.pipeline.failure_limit > 0,
            "pipeline.failure_limit must be > 0"
        );
        ensure!(
            self.discovery.max_concurrent_tokens > 0,
            "discovery.max_concurrent_tokens must be > 0"
        );
        ensure!(
            self.proxy.max_reuse > 0,
            "proxy.max_reuse must be > 0"
        );
        ensure!(
            self.proxy.soft_strike_limit > 0 && self.proxy.hard_strike_limit > 0,
            "proxy strike limits must be > 0"
        );
        ensure!(
            self.qualification.min_pnl >= 0.0,
            "qualification.min_pnl must be >= 0"
        );

        for (i, raw) in self.proxy.entries.iter().enumerate() {
            ProxyEntry::parse(raw).with_context(|| format!("proxy.entries[{i}] is invalid"))?;
        }
        Ok(())
    }

    /// Proxy entries parsed and ready for the pool. Empty when proxying is disabled.
    pub fn proxy_entries(&self) -> Result<Vec<ProxyEntry>> {
        if !self.proxy.enabled {
            return Ok(Vec::new());
        }
        self.proxy
            .entries
            .iter()
            .map(|raw| ProxyEntry::parse(raw).map_err(anyhow::Error::from))
            .collect()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let config = Self::from_toml_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

fn split_proxy_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
