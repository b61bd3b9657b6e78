use anyhow::{Context, Result};
use chrono::Utc;
use common::cielo::CieloApi;
use common::config::Config;
use common::gmgn::GmgnApi;
use common::proxy_pool::{PoolSettings, ProxyPool};
use common::resilience::{EndpointClass, HttpTransport, ResilientClient};
use common::store::{PendingQuery, Store};
use rand::Rng;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

mod cli;
mod failure_export;
mod jobs;
mod metrics;
mod qualification;

use jobs::{AuditFetcher, DiscoveryFetcher};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("wallet-auditor", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    let store = Store::open(&config.database.path)
        .await
        .with_context(|| format!("failed to open store at {}", config.database.path))?;

    // Store-only commands print and exit.
    let (discover, audit, all) = match cmd {
        cli::Command::Run => (true, true, false),
        cli::Command::Discover { all } => (true, false, all),
        cli::Command::Audit { all } => (false, true, all),
        other => return cli::run_command(&store, &config, other).await,
    };

    tracing::info!(discover, audit, all, "wallet auditor starting");
    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let cfg = Arc::new(config);
    let proxies = ProxyPool::new(cfg.proxy_entries()?, PoolSettings::from_config(&cfg.proxy));
    if proxies.is_enabled() {
        tracing::info!(proxies = proxies.len(), "proxy rotation enabled");
    } else {
        tracing::warn!("no proxies configured; using direct connections");
    }

    let discovery_ep = &cfg.endpoints.discovery;
    let gmgn = Arc::new(GmgnApi::new(
        ResilientClient::from_config(
            EndpointClass::Discovery,
            HttpTransport::new(discovery_ep.request_timeout(), discovery_ep.rotate_identity_every)?,
            proxies.clone(),
            discovery_ep,
        ),
        &discovery_ep.base_url,
    )?);
    let audit_ep = &cfg.endpoints.audit;
    let cielo = Arc::new(CieloApi::new(
        ResilientClient::from_config(
            EndpointClass::Audit,
            HttpTransport::new(audit_ep.request_timeout(), audit_ep.rotate_identity_every)?,
            proxies.clone(),
            audit_ep,
        ),
        &audit_ep.base_url,
    )?);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; letting in-flight requests finish");
                cancel.cancel();
            }
        }
    });

    if discover && !cancel.is_cancelled() {
        if !cfg.pipeline.preflight || jobs::discovery_upstream_ready(gmgn.as_ref()).await {
            discovery_stage(&store, Arc::clone(&gmgn), &cfg, all, &cancel)
                .instrument(tracing::info_span!("job_run", job = "discovery"))
                .await?;
        } else {
            tracing::error!("discovery upstream not usable; skipping discovery");
        }
    }

    if audit && !cancel.is_cancelled() {
        if !cfg.pipeline.preflight
            || jobs::audit_upstream_ready(cielo.as_ref(), &cfg.pipeline.preflight_wallet).await
        {
            audit_stage(&store, Arc::clone(&cielo), &cfg, all, &cancel)
                .instrument(tracing::info_span!("job_run", job = "audit"))
                .await?;
        } else {
            tracing::error!("audit upstream not usable; skipping audit");
        }
    }

    proxies.log_stats();
    Ok(())
}

fn new_run_id(job: &str) -> String {
    let suffix: u16 = rand::thread_rng().gen();
    format!("{job}-{}-{suffix:04x}", Utc::now().format("%Y%m%dT%H%M%S"))
}

async fn discovery_stage<F>(
    store: &Store,
    fetcher: Arc<F>,
    cfg: &Config,
    all: bool,
    cancel: &CancellationToken,
) -> Result<()>
where
    F: DiscoveryFetcher + Send + Sync + 'static,
{
    let run_id = new_run_id("discovery");
    let tracker = jobs::RunTracker::start(store, &run_id, "discovery").await?;
    let settings = jobs::DiscoverySettings::from_config(&cfg.discovery, all);

    match jobs::run_discovery(store, fetcher, &settings, cancel).await {
        Ok(report) => {
            println!(
                "discovery: {} tokens analyzed, {} failed, {} hits, {} unique wallets ({})",
                report.analyzed,
                report.failed,
                report.hits_saved,
                report.unique_wallets,
                report.status.as_str()
            );
            tracker
                .finish(report.status.as_str(), serde_json::to_value(&report)?)
                .await
        }
        Err(e) => {
            if let Err(track_err) = tracker.fail(&e).await {
                tracing::warn!(error = %track_err, "failed to record discovery failure");
            }
            Err(e)
        }
    }
}

async fn audit_stage<F>(
    store: &Store,
    fetcher: Arc<F>,
    cfg: &Config,
    all: bool,
    cancel: &CancellationToken,
) -> Result<()>
where
    F: AuditFetcher + Send + Sync + 'static,
{
    let run_id = new_run_id("audit");
    let tracker = jobs::RunTracker::start(store, &run_id, "audit").await?;

    let mut query = PendingQuery::from_config(&cfg.pipeline);
    if all {
        query.reaudit_since = Some(Utc::now());
    }
    let pipeline = jobs::AuditPipeline::new(
        store.clone(),
        fetcher,
        cfg.qualification.clone(),
        jobs::AuditSettings::from_config(&cfg.pipeline),
    );

    match pipeline.run(&query, &run_id, cancel).await {
        Ok(report) => {
            println!(
                "audit: {} audited, {} qualified, {} bot-blocked, {} failed, {} skipped ({})",
                report.audited,
                report.qualified,
                report.bot_blocked,
                report.failed,
                report.skipped,
                report.status.as_str()
            );
            tracker
                .finish(report.status.as_str(), serde_json::to_value(&report)?)
                .await
        }
        Err(e) => {
            if let Err(track_err) = tracker.fail(&e).await {
                tracing::warn!(error = %track_err, "failed to record audit failure");
            }
            Err(e)
        }
    }
}
