use anyhow::Result;
use common::config;
use common::store::{PendingQuery, PendingWallet, Store};
use common::types::WalletStats;
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::fetcher_traits::AuditFetcher;
use super::RunStatus;
use crate::failure_export::{self, FailureEntry};
use crate::qualification::{self, Verdict};

const STORE_RETRY_BASE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct AuditSettings {
    pub batch_size: usize,
    pub batch_pause_min: Duration,
    pub batch_pause_max: Duration,
    pub max_failure_rate: f64,
    pub failure_rate_min_sample: usize,
    pub store_write_retries: u32,
    pub register_portfolio_tokens: bool,
    pub failed_wallets_path: Option<PathBuf>,
}

impl AuditSettings {
    pub fn from_config(cfg: &config::Pipeline) -> Self {
        Self {
            batch_size: cfg.batch_size,
            batch_pause_min: Duration::from_millis(cfg.batch_pause_min_ms),
            batch_pause_max: Duration::from_millis(cfg.batch_pause_max_ms),
            max_failure_rate: cfg.max_failure_rate,
            failure_rate_min_sample: cfg.failure_rate_min_sample,
            store_write_retries: cfg.store_write_retries,
            register_portfolio_tokens: cfg.register_portfolio_tokens,
            failed_wallets_path: (!cfg.failed_wallets_path.is_empty())
                .then(|| PathBuf::from(&cfg.failed_wallets_path)),
        }
    }
}

/// Counts for one audit run. `audited` includes wallets without activity
/// (recorded with zeros); `qualified` is a subset of `audited`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub audited: usize,
    pub qualified: usize,
    pub bot_blocked: usize,
    pub failed: usize,
    pub skipped: usize,
    pub status: RunStatus,
}

impl AuditReport {
    fn processed(&self) -> usize {
        self.audited + self.bot_blocked + self.failed
    }

    fn failure_rate_tripped(&self, settings: &AuditSettings) -> bool {
        let processed = self.processed();
        processed > 0
            && processed >= settings.failure_rate_min_sample
            && self.failed as f64 / processed as f64 > settings.max_failure_rate
    }

    fn tally(&mut self, outcome: WalletOutcome, failures: &mut Vec<FailureEntry>) {
        match outcome {
            WalletOutcome::Audited { qualified } => {
                self.audited += 1;
                if qualified {
                    self.qualified += 1;
                }
            }
            WalletOutcome::Bot => self.bot_blocked += 1,
            WalletOutcome::Failed(entry) => {
                self.failed += 1;
                failures.push(entry);
            }
            WalletOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug)]
enum WalletOutcome {
    Audited { qualified: bool },
    Bot,
    Failed(FailureEntry),
    Skipped,
}

struct Shared<F> {
    store: Store,
    fetcher: Arc<F>,
    rules: config::Qualification,
    settings: AuditSettings,
}

/// Drains pending wallets batch by batch. Network concurrency is bounded by
/// the audit client's gate, not here.
pub struct AuditPipeline<F> {
    shared: Arc<Shared<F>>,
}

impl<F> AuditPipeline<F>
where
    F: AuditFetcher + Send + Sync + 'static,
{
    pub fn new(
        store: Store,
        fetcher: Arc<F>,
        rules: config::Qualification,
        settings: AuditSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                fetcher,
                rules,
                settings,
            }),
        }
    }

    /// Audit until nothing is pending, the failure rate trips or `cancel`
    /// fires. Only store failures are returned as errors. Claims left by the
    /// run are released and failed wallets exported either way.
    pub async fn run(
        &self,
        query: &PendingQuery,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<AuditReport> {
        let run_id: Arc<str> = Arc::from(run_id);
        let mut report = AuditReport::default();
        let mut failures = Vec::new();

        let drained = self
            .drain(query, &run_id, cancel, &mut report, &mut failures)
            .await;

        if let Err(e) = self.shared.store.release_claims(&run_id).await {
            tracing::warn!(error = %e, "failed to release audit claims");
        }
        if let Some(path) = self.shared.settings.failed_wallets_path.clone() {
            if !failures.is_empty() {
                let new = failures.len();
                let export_path = path.clone();
                let exported = tokio::task::spawn_blocking(move || {
                    failure_export::merge_into_file(&export_path, &failures)
                })
                .await;
                match exported {
                    Ok(Ok(total)) => {
                        tracing::info!(path = %path.display(), new, total, "exported failed wallets");
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "failed to export failed wallets"),
                    Err(e) => tracing::warn!(error = %e, "failure export task panicked"),
                }
            }
        }
        drained?;

        tracing::info!(
            audited = report.audited,
            qualified = report.qualified,
            bot_blocked = report.bot_blocked,
            failed = report.failed,
            skipped = report.skipped,
            status = report.status.as_str(),
            "audit run finished"
        );
        Ok(report)
    }

    async fn drain(
        &self,
        query: &PendingQuery,
        run_id: &Arc<str>,
        cancel: &CancellationToken,
        report: &mut AuditReport,
        failures: &mut Vec<FailureEntry>,
    ) -> Result<()> {
        let store = &self.shared.store;
        let settings = &self.shared.settings;

        loop {
            if cancel.is_cancelled() {
                report.status = RunStatus::Cancelled;
                return Ok(());
            }

            let pending = store.count_pending(query).await?;
            metrics::gauge!("auditor_pending_wallets").set(pending as f64);

            let batch = with_store_retries(
                settings.store_write_retries,
                "store.claim_pending_wallets",
                || store.claim_pending_wallets(query, run_id, settings.batch_size),
            )
            .await?;
            if batch.is_empty() {
                return Ok(());
            }
            let full_batch = batch.len() == settings.batch_size;
            tracing::info!(batch = batch.len(), pending, "auditing batch");

            // Stops wallets that have not started yet once a store write fails.
            let batch_cancel = cancel.child_token();
            let mut tasks = JoinSet::new();
            for wallet in batch {
                let shared = Arc::clone(&self.shared);
                let run_id = Arc::clone(run_id);
                let cancel = batch_cancel.clone();
                tasks.spawn(async move { audit_wallet(&shared, &run_id, &cancel, wallet).await });
            }

            let mut fatal = None;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(outcome)) => report.tally(outcome, failures),
                    Ok(Err(e)) => {
                        batch_cancel.cancel();
                        if fatal.is_none() {
                            fatal = Some(e);
                        } else {
                            tracing::error!(error = %e, "additional store failure in batch");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "wallet audit task panicked");
                        report.failed += 1;
                    }
                }
            }
            if let Some(e) = fatal {
                tracing::error!(error = %e, "store write failed; aborting audit run");
                return Err(e);
            }

            if report.failure_rate_tripped(settings) {
                tracing::error!(
                    failed = report.failed,
                    processed = report.processed(),
                    max_failure_rate = settings.max_failure_rate,
                    "failure rate too high; stopping audit run"
                );
                report.status = RunStatus::Aborted;
                return Ok(());
            }

            if full_batch {
                let pause = random_pause(settings.batch_pause_min, settings.batch_pause_max);
                if !pause.is_zero() {
                    tracing::debug!(pause_ms = pause.as_millis() as u64, "pausing between batches");
                    tokio::select! {
                        () = tokio::time::sleep(pause) => {}
                        () = cancel.cancelled() => {}
                    }
                }
            }
        }
    }
}

async fn audit_wallet<F: AuditFetcher>(
    shared: &Shared<F>,
    run_id: &str,
    cancel: &CancellationToken,
    wallet: PendingWallet,
) -> Result<WalletOutcome> {
    if cancel.is_cancelled() {
        metrics::counter!("auditor_wallets_audited_total", "outcome" => "skipped").increment(1);
        return Ok(WalletOutcome::Skipped);
    }
    let store = &shared.store;
    let retries = shared.settings.store_write_retries;

    let stats = match shared.fetcher.fetch_wallet_stats(&wallet.address).await {
        Ok(Some(stats)) => stats,
        Ok(None) => {
            with_store_retries(retries, "store.record_audit", || {
                store.record_audit(wallet.id, WalletStats::default(), false)
            })
            .await?;
            tracing::debug!(wallet = %wallet.address, "no activity; recorded empty audit");
            metrics::counter!("auditor_wallets_audited_total", "outcome" => "empty").increment(1);
            return Ok(WalletOutcome::Audited { qualified: false });
        }
        Err(err) => {
            let kind = err.kind();
            let message = err.to_string();
            tracing::warn!(wallet = %wallet.address, kind, error = %message, "wallet audit failed");
            with_store_retries(retries, "store.mark_failed", || {
                store.mark_failed(wallet.id, run_id, kind, &message)
            })
            .await?;
            metrics::counter!("auditor_wallets_audited_total", "outcome" => "failed").increment(1);
            return Ok(WalletOutcome::Failed(FailureEntry::now(&wallet.address, kind)));
        }
    };

    match qualification::classify(&stats, &shared.rules) {
        Verdict::Bot { reason } => {
            with_store_retries(retries, "store.mark_bot", || store.mark_bot(wallet.id, &reason))
                .await?;
            tracing::info!(wallet = %wallet.address, %reason, "flagged bot wallet");
            metrics::counter!("auditor_wallets_audited_total", "outcome" => "bot").increment(1);
            Ok(WalletOutcome::Bot)
        }
        verdict => {
            let qualified = matches!(verdict, Verdict::Qualified { .. });
            let register = shared.settings.register_portfolio_tokens;
            with_store_retries(retries, "store.record_audit", || {
                store.record_audit(wallet.id, stats.clone(), register)
            })
            .await?;
            if qualified {
                tracing::info!(
                    wallet = %wallet.address,
                    pnl_usd = stats.pnl_usd,
                    trades_30d = stats.trades_30d,
                    "wallet qualified"
                );
                metrics::counter!("auditor_wallets_audited_total", "outcome" => "qualified")
                    .increment(1);
            } else {
                metrics::counter!("auditor_wallets_audited_total", "outcome" => "rejected")
                    .increment(1);
            }
            Ok(WalletOutcome::Audited { qualified })
        }
    }
}

/// The data is already in hand, so a failed write is retried on its own
/// with doubling backoff instead of refetching.
async fn with_store_retries<T, Fut>(
    retries: u32,
    op: &'static str,
    mut write: impl FnMut() -> Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let mut delay = STORE_RETRY_BASE;
    let mut attempt = 0;
    loop {
        match write().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::warn!(op, attempt, error = %e, "store write failed; retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e.context(format!("{op} failed after {} attempts", attempt + 1))),
        }
    }
}

fn random_pause(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}
