use anyhow::Result;
use common::config;
use common::store::Store;
use common::types::{Listing, NewDiscoveryHit, TokenInfo};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::fetcher_traits::DiscoveryFetcher;
use super::RunStatus;

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub timeframes: Vec<String>,
    pub listing_limit: u32,
    pub max_concurrent_tokens: usize,
    pub manual_tokens: Vec<String>,
    pub banned_wallets: HashSet<String>,
    /// Re-crawl tokens that are already stored.
    pub include_known: bool,
}

impl DiscoverySettings {
    pub fn from_config(cfg: &config::Discovery, include_known: bool) -> Self {
        Self {
            timeframes: cfg.timeframes.clone(),
            listing_limit: cfg.listing_limit,
            max_concurrent_tokens: cfg.max_concurrent_tokens.max(1),
            manual_tokens: cfg.manual_tokens.clone(),
            banned_wallets: cfg.banned_wallets.iter().cloned().collect(),
            include_known,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub candidates: usize,
    pub skipped_known: usize,
    pub analyzed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub hits_saved: usize,
    pub unique_wallets: usize,
    pub status: RunStatus,
}

enum TokenOutcome {
    Saved { hits: usize, wallets: Vec<String> },
    Failed,
    Skipped,
}

/// Crawl trending, configured and queued tokens and store every wallet
/// sighting. Upstream failures are logged and tolerated; store failures end
/// the run with an error.
pub async fn run_discovery<F>(
    store: &Store,
    fetcher: Arc<F>,
    settings: &DiscoverySettings,
    cancel: &CancellationToken,
) -> Result<DiscoveryReport>
where
    F: DiscoveryFetcher + Send + Sync + 'static,
{
    let mut report = DiscoveryReport::default();

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for timeframe in &settings.timeframes {
        if cancel.is_cancelled() {
            break;
        }
        match fetcher.fetch_trending_tokens(timeframe).await {
            Ok(tokens) => {
                tracing::debug!(timeframe = %timeframe, count = tokens.len(), "trending tokens");
                for token in tokens {
                    if seen.insert(token.clone()) {
                        candidates.push(token);
                    }
                }
            }
            Err(e) => tracing::warn!(
                timeframe = %timeframe,
                kind = e.kind(),
                error = %e,
                "trending fetch failed"
            ),
        }
    }
    let queued = store.token_queue().await?;
    for token in settings.manual_tokens.iter().cloned().chain(queued) {
        if seen.insert(token.clone()) {
            candidates.push(token);
        }
    }
    report.candidates = candidates.len();

    if !settings.include_known {
        let known = store.known_token_addresses().await?;
        candidates.retain(|t| !known.contains(t));
        report.skipped_known = report.candidates - candidates.len();
    }
    tracing::info!(
        candidates = report.candidates,
        new = candidates.len(),
        "starting token discovery"
    );

    let settings = Arc::new(settings.clone());
    let gate = Arc::new(Semaphore::new(settings.max_concurrent_tokens));
    let token_cancel = cancel.child_token();
    let mut tasks = JoinSet::new();
    for token in candidates {
        let store = store.clone();
        let fetcher = Arc::clone(&fetcher);
        let settings = Arc::clone(&settings);
        let gate = Arc::clone(&gate);
        let cancel = token_cancel.clone();
        tasks.spawn(async move {
            let Ok(_permit) = gate.acquire_owned().await else {
                return Ok(TokenOutcome::Skipped);
            };
            if cancel.is_cancelled() {
                return Ok(TokenOutcome::Skipped);
            }
            analyze_token(&store, fetcher.as_ref(), &settings, &token).await
        });
    }

    let mut wallets = HashSet::new();
    let mut fatal = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(TokenOutcome::Saved { hits, wallets: w })) => {
                report.analyzed += 1;
                report.hits_saved += hits;
                wallets.extend(w);
            }
            Ok(Ok(TokenOutcome::Failed)) => report.failed += 1,
            Ok(Ok(TokenOutcome::Skipped)) => report.skipped += 1,
            Ok(Err(e)) => {
                token_cancel.cancel();
                if fatal.is_none() {
                    fatal = Some(e);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "token task panicked");
                report.failed += 1;
            }
        }
    }
    if let Some(e) = fatal {
        tracing::error!(error = %e, "store write failed; aborting discovery");
        return Err(e);
    }

    report.unique_wallets = wallets.len();
    if cancel.is_cancelled() {
        report.status = RunStatus::Cancelled;
    }
    tracing::info!(
        analyzed = report.analyzed,
        failed = report.failed,
        skipped = report.skipped,
        hits_saved = report.hits_saved,
        unique_wallets = report.unique_wallets,
        "discovery finished"
    );
    Ok(report)
}

async fn analyze_token<F: DiscoveryFetcher>(
    store: &Store,
    fetcher: &F,
    settings: &DiscoverySettings,
    token: &str,
) -> Result<TokenOutcome> {
    let info = match store.token_info(token).await? {
        Some(info) => info,
        None => match fetcher.fetch_token_info(token).await {
            Ok(info) => info.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(token, kind = e.kind(), error = %e, "token info fetch failed");
                TokenInfo::default()
            }
        },
    };

    let mut hits = Vec::new();
    let mut failed_listings = 0;
    for listing in Listing::ALL {
        match fetcher.fetch_listing(token, listing, settings.listing_limit).await {
            Ok(entries) => {
                for (i, entry) in entries.into_iter().enumerate() {
                    if settings.banned_wallets.contains(&entry.address) {
                        continue;
                    }
                    hits.push(NewDiscoveryHit {
                        wallet: entry.address,
                        category: listing.category(),
                        listing,
                        rank: i as u32 + 1,
                        pnl_on_token: entry.profit,
                    });
                }
            }
            Err(e) => {
                failed_listings += 1;
                tracing::warn!(
                    token,
                    listing = listing.as_str(),
                    kind = e.kind(),
                    error = %e,
                    "listing fetch failed"
                );
            }
        }
    }
    // Nothing came back at all; leave the token uncrawled for a later run.
    if failed_listings == Listing::ALL.len() {
        return Ok(TokenOutcome::Failed);
    }

    let wallets = hits.iter().map(|h| h.wallet.clone()).collect();
    let symbol = info.symbol.clone();
    let saved = store.save_discovery(token, info, hits).await?;
    metrics::counter!("auditor_discovery_hits_total").increment(saved as u64);
    tracing::info!(token, symbol = ?symbol, hits = saved, "token analyzed");
    Ok(TokenOutcome::Saved {
        hits: saved,
        wallets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::resilience::{ClientError, EndpointClass};
    use common::store::PendingQuery;
    use common::types::ListingEntry;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeDiscovery {
        trending: HashMap<String, Vec<String>>,
        listings: HashMap<(String, Listing), Vec<ListingEntry>>,
        broken_tokens: HashSet<String>,
        infos: HashMap<String, TokenInfo>,
        info_calls: AtomicUsize,
        listing_calls: AtomicUsize,
    }

    fn entry(address: &str, profit: f64) -> ListingEntry {
        ListingEntry {
            address: address.into(),
            profit,
        }
    }

    fn open_circuit() -> ClientError {
        ClientError::CircuitOpen {
            endpoint: EndpointClass::Discovery,
        }
    }

    impl DiscoveryFetcher for FakeDiscovery {
        async fn fetch_trending_tokens(&self, timeframe: &str) -> Result<Vec<String>, ClientError> {
            self.trending.get(timeframe).cloned().ok_or_else(open_circuit)
        }

        async fn fetch_listing(
            &self,
            token: &str,
            listing: Listing,
            _limit: u32,
        ) -> Result<Vec<ListingEntry>, ClientError> {
            self.listing_calls.fetch_add(1, Ordering::SeqCst);
            if self.broken_tokens.contains(token) {
                return Err(open_circuit());
            }
            if listing == Listing::HolderProfit {
                return Err(ClientError::Malformed {
                    reason: "missing data.list".into(),
                });
            }
            Ok(self
                .listings
                .get(&(token.to_string(), listing))
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_token_info(&self, token: &str) -> Result<Option<TokenInfo>, ClientError> {
            self.info_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.infos.get(token).cloned())
        }
    }

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            timeframes: vec!["1h".into(), "6h".into(), "24h".into()],
            listing_limit: 100,
            max_concurrent_tokens: 2,
            manual_tokens: vec![],
            banned_wallets: HashSet::from(["Banned".to_string()]),
            include_known: false,
        }
    }

    fn fake() -> FakeDiscovery {
        let mut f = FakeDiscovery::default();
        f.trending.insert("1h".into(), vec!["TokA".into(), "TokB".into()]);
        f.trending.insert("6h".into(), vec!["TokB".into()]);
        // "24h" is missing: that timeframe fails.
        f.listings.insert(
            ("TokA".into(), Listing::TraderProfit),
            vec![entry("W1", 900.0), entry("Banned", 50.0), entry("W2", 10.0)],
        );
        f.listings.insert(("TokA".into(), Listing::HolderAmount), vec![entry("W1", 900.0)]);
        f.listings.insert(("TokB".into(), Listing::TraderSniper), vec![entry("W3", 5.0)]);
        f.infos.insert(
            "TokA".into(),
            TokenInfo {
                symbol: Some("AAA".into()),
                ath_price: Some(1.5),
            },
        );
        f
    }

    #[tokio::test]
    async fn test_discovery_saves_hits_and_makes_wallets_pending() {
        let store = Store::open(":memory:").await.unwrap();
        let fetcher = Arc::new(fake());

        let report = run_discovery(&store, Arc::clone(&fetcher), &settings(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.candidates, 2);
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.hits_saved, 4);
        assert_eq!(report.unique_wallets, 3);
        assert_eq!(report.status, RunStatus::Completed);

        let detail = store.wallet_detail("W1").await.unwrap().unwrap();
        assert_eq!(detail.hits.len(), 2);
        let w2 = store.wallet_detail("W2").await.unwrap().unwrap();
        // Rank keeps the listing position even when a banned wallet is dropped.
        assert_eq!(w2.hits[0].rank, 3);
        assert!(store.wallet_detail("Banned").await.unwrap().is_none());

        let info = store.token_info("TokA").await.unwrap().unwrap();
        assert_eq!(info.symbol.as_deref(), Some("AAA"));

        let pending = PendingQuery {
            audit_interval_hours: 24,
            failure_limit: 3,
            claim_ttl_secs: 3600,
            reaudit_since: None,
        };
        assert_eq!(store.count_pending(&pending).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_known_tokens_are_skipped_unless_all() {
        let store = Store::open(":memory:").await.unwrap();
        let fetcher = Arc::new(fake());
        run_discovery(&store, Arc::clone(&fetcher), &settings(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fetcher.info_calls.load(Ordering::SeqCst), 2);

        let again = run_discovery(&store, Arc::clone(&fetcher), &settings(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.skipped_known, 2);
        assert_eq!(again.analyzed, 0);

        let mut all = settings();
        all.include_known = true;
        let report = run_discovery(&store, Arc::clone(&fetcher), &all, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.analyzed, 2);
        // TokA's stored symbol is reused; TokB has none and is looked up again.
        assert_eq!(fetcher.info_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_queued_and_manual_tokens_are_crawled() {
        let store = Store::open(":memory:").await.unwrap();
        store
            .queue_tokens(vec!["Queued".into()], "portfolio")
            .await
            .unwrap();
        let mut f = FakeDiscovery::default();
        f.listings.insert(("Queued".into(), Listing::TraderProfit), vec![entry("Q1", 1.0)]);
        f.listings.insert(("Manual".into(), Listing::TraderProfit), vec![entry("M1", 1.0)]);
        let mut s = settings();
        s.manual_tokens = vec!["Manual".into()];

        let report = run_discovery(&store, Arc::new(f), &s, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.analyzed, 2);
        assert!(store.token_queue().await.unwrap().is_empty());
        assert!(store.wallet_detail("Q1").await.unwrap().is_some());
        assert!(store.wallet_detail("M1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_token_with_every_listing_failing_stays_queued() {
        let store = Store::open(":memory:").await.unwrap();
        store
            .queue_tokens(vec!["Flaky".into()], "portfolio")
            .await
            .unwrap();
        let mut f = FakeDiscovery::default();
        f.broken_tokens.insert("Flaky".into());

        let report = run_discovery(&store, Arc::new(f), &settings(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.analyzed, 0);
        assert_eq!(store.token_queue().await.unwrap(), vec!["Flaky".to_string()]);
        assert!(store.known_token_addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_discovery_skips_pending_tokens() {
        let store = Store::open(":memory:").await.unwrap();
        let fetcher = Arc::new(fake());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut s = settings();
        s.manual_tokens = vec!["TokA".into(), "TokB".into()];
        let report = run_discovery(&store, Arc::clone(&fetcher), &s, &cancel)
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.skipped, 2);
        assert_eq!(fetcher.listing_calls.load(Ordering::SeqCst), 0);
    }
}
