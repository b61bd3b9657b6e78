use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{named_params, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::collections::HashSet;

use crate::config;
use crate::db::AsyncDb;
use crate::types::{Category, NewDiscoveryHit, TokenInfo, WalletStats};

/// SQLite's `datetime('now')` format, so Rust-computed cutoffs compare as text.
pub fn sql_timestamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWallet {
    pub id: i64,
    pub address: String,
}

/// What "pending" means for one run.
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub audit_interval_hours: u32,
    pub failure_limit: u32,
    pub claim_ttl_secs: u64,
    /// Re-audit every wallet not audited since this instant, ignoring the interval.
    pub reaudit_since: Option<DateTime<Utc>>,
}

impl PendingQuery {
    pub fn from_config(cfg: &config::Pipeline) -> Self {
        Self {
            audit_interval_hours: cfg.audit_interval_hours,
            failure_limit: cfg.failure_limit,
            claim_ttl_secs: cfg.claim_ttl_secs,
            reaudit_since: None,
        }
    }

    fn audit_cutoff(&self, now: DateTime<Utc>) -> String {
        let cutoff = self.reaudit_since.unwrap_or_else(|| {
            now - ChronoDuration::hours(i64::from(self.audit_interval_hours))
        });
        sql_timestamp(cutoff)
    }

    fn claim_cutoff(&self, now: DateTime<Utc>) -> String {
        // Capped so a silly TTL cannot overflow the date arithmetic.
        let ttl = i64::try_from(self.claim_ttl_secs)
            .unwrap_or(i64::MAX)
            .min(365 * 24 * 3600);
        sql_timestamp(now - ChronoDuration::seconds(ttl))
    }
}

// Shared by the pending listing, the claim and the pending count.
const PENDING_FILTER: &str = "
    (EXISTS (SELECT 1 FROM discovery_hits h WHERE h.wallet_id = w.id)
     OR EXISTS (SELECT 1 FROM manual_queue m WHERE m.wallet_id = w.id))
    AND NOT EXISTS (SELECT 1 FROM bots b WHERE b.wallet_id = w.id)
    AND NOT EXISTS (SELECT 1 FROM audit_claims c
                    WHERE c.wallet_id = w.id AND c.claimed_at >= :claim_cutoff)
    AND NOT EXISTS (SELECT 1 FROM audit_records a
                    WHERE a.wallet_id = w.id AND a.captured_at >= :audit_cutoff)
    AND NOT EXISTS (SELECT 1 FROM audit_failures f
                    WHERE f.wallet_id = w.id AND f.run_id = :run_id)
    AND (SELECT COUNT(*) FROM audit_failures f
         WHERE f.wallet_id = w.id
           AND f.error_kind <> 'circuit_open'
           AND f.failed_at >= COALESCE(
               (SELECT MAX(a.captured_at) FROM audit_records a WHERE a.wallet_id = w.id), '')
        ) < :failure_limit
";

// Manual requests first, then never-audited wallets, then the stalest audit.
const PENDING_ORDER: &str = "
    ORDER BY EXISTS (SELECT 1 FROM manual_queue m WHERE m.wallet_id = w.id) DESC,
             w.last_updated IS NOT NULL,
             w.last_updated,
             w.id
";

fn select_pending(
    conn: &rusqlite::Connection,
    query: &PendingQuery,
    run_id: &str,
    limit: usize,
) -> std::result::Result<Vec<PendingWallet>, rusqlite::Error> {
    let now = Utc::now();
    let sql = format!(
        "SELECT w.id, w.address FROM wallets w WHERE {PENDING_FILTER} {PENDING_ORDER} LIMIT :limit"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(
            named_params! {
                ":claim_cutoff": query.claim_cutoff(now),
                ":audit_cutoff": query.audit_cutoff(now),
                ":run_id": run_id,
                ":failure_limit": query.failure_limit,
                ":limit": limit as i64,
            },
            |row| {
                Ok(PendingWallet {
                    id: row.get(0)?,
                    address: row.get(1)?,
                })
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn upsert_wallet(
    conn: &rusqlite::Connection,
    address: &str,
) -> std::result::Result<i64, rusqlite::Error> {
    conn.prepare_cached(
        "INSERT INTO wallets (address) VALUES (?1)
         ON CONFLICT(address) DO UPDATE SET address = address
         RETURNING id",
    )?
    .query_row([address], |row| row.get(0))
}

#[derive(Debug, Clone, Serialize)]
pub struct QualifiedWallet {
    pub address: String,
    pub pnl_usd: f64,
    pub trades_30d: u64,
    pub high_profit_tokens: u32,
    pub audited_at: String,
}

impl QualifiedWallet {
    pub fn cielo_url(&self) -> String {
        crate::types::cielo_profile_url(&self.address)
    }

    pub fn gmgn_url(&self) -> String {
        crate::types::gmgn_profile_url(&self.address)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub tokens: u64,
    pub wallets: u64,
    pub discovery_hits: u64,
    pub audit_records: u64,
    pub audited_wallets: u64,
    pub bots: u64,
    pub manual_queue: u64,
    pub token_queue: u64,
    pub failures: u64,
}

#[derive(Debug, Clone)]
pub struct AuditRow {
    pub pnl_usd: f64,
    pub trades_30d: u64,
    pub captured_at: String,
}

#[derive(Debug, Clone)]
pub struct PortfolioRow {
    pub token_address: String,
    pub symbol: Option<String>,
    pub pnl_usd: f64,
    pub swap_count: u64,
    pub last_trade: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct HitRow {
    pub token_address: String,
    pub token_symbol: Option<String>,
    pub category: Option<Category>,
    pub listing: Option<String>,
    pub rank: u32,
    pub pnl_on_token: f64,
    pub seen_at: String,
}

#[derive(Debug, Clone)]
pub struct WalletDetail {
    pub address: String,
    pub first_seen_at: String,
    pub last_updated: Option<String>,
    pub bot_reason: Option<String>,
    pub manually_queued: bool,
    /// Newest first.
    pub audits: Vec<AuditRow>,
    /// Highest PnL first.
    pub portfolio: Vec<PortfolioRow>,
    pub hits: Vec<HitRow>,
    pub failures: u64,
}

impl WalletDetail {
    pub fn cielo_url(&self) -> String {
        crate::types::cielo_profile_url(&self.address)
    }

    pub fn gmgn_url(&self) -> String {
        crate::types::gmgn_profile_url(&self.address)
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub job: String,
    pub status: String,
    pub started_at: String,
    pub duration_ms: Option<i64>,
    pub report_json: Option<String>,
    pub error: Option<String>,
}

/// Typed operations over the auditor database.
#[derive(Clone)]
pub struct Store {
    db: AsyncDb,
}

impl Store {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }

    pub async fn open(path: &str) -> Result<Self> {
        Ok(Self::new(AsyncDb::open(path).await?))
    }

    pub fn db(&self) -> &AsyncDb {
        &self.db
    }

    /// Pending wallets without claiming them.
    pub async fn get_pending_wallets(
        &self,
        query: &PendingQuery,
        limit: usize,
    ) -> Result<Vec<PendingWallet>> {
        let query = query.clone();
        self.db
            .read_named("store.get_pending_wallets", move |conn| {
                Ok(select_pending(conn, &query, "", limit)?)
            })
            .await
    }

    pub async fn count_pending(&self, query: &PendingQuery) -> Result<u64> {
        let query = query.clone();
        self.db
            .read_named("store.count_pending", move |conn| {
                let now = Utc::now();
                let sql = format!("SELECT COUNT(*) FROM wallets w WHERE {PENDING_FILTER}");
                let n: i64 = conn.query_row(
                    &sql,
                    named_params! {
                        ":claim_cutoff": query.claim_cutoff(now),
                        ":audit_cutoff": query.audit_cutoff(now),
                        ":run_id": "",
                        ":failure_limit": query.failure_limit,
                    },
                    |row| row.get(0),
                )?;
                Ok(n as u64)
            })
            .await
    }

    /// Select and claim up to `limit` pending wallets for `run_id` in one
    /// write transaction, so two workers never receive the same wallet.
    pub async fn claim_pending_wallets(
        &self,
        query: &PendingQuery,
        run_id: &str,
        limit: usize,
    ) -> Result<Vec<PendingWallet>> {
        let query = query.clone();
        let run_id = run_id.to_string();
        self.db
            .call_named("store.claim_pending_wallets", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let wallets = select_pending(&tx, &query, &run_id, limit)?;
                {
                    let mut claim = tx.prepare_cached(
                        "INSERT INTO audit_claims (wallet_id, run_id, claimed_at)
                         VALUES (?1, ?2, datetime('now'))
                         ON CONFLICT(wallet_id) DO UPDATE SET
                            run_id = excluded.run_id,
                            claimed_at = excluded.claimed_at",
                    )?;
                    for w in &wallets {
                        claim.execute(rusqlite::params![w.id, run_id])?;
                    }
                }
                tx.commit()?;
                Ok(wallets)
            })
            .await
    }

    /// Drop whatever claims `run_id` still holds.
    pub async fn release_claims(&self, run_id: &str) -> Result<usize> {
        let run_id = run_id.to_string();
        self.db
            .call_named("store.release_claims", move |conn| {
                Ok(conn.execute("DELETE FROM audit_claims WHERE run_id = ?1", [run_id])?)
            })
            .await
    }

    /// Append an audit record, upsert the portfolio snapshot, bump the wallet
    /// and release its claim, all in one transaction. With `register_tokens`,
    /// portfolio tokens not yet in the store are queued for discovery.
    pub async fn record_audit(
        &self,
        wallet_id: i64,
        stats: WalletStats,
        register_tokens: bool,
    ) -> Result<i64> {
        self.db
            .call_named("store.record_audit", move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO audit_records (wallet_id, pnl_usd, trades_30d) VALUES (?1, ?2, ?3)",
                    rusqlite::params![wallet_id, stats.pnl_usd, stats.trades_30d as i64],
                )?;
                let record_id = tx.last_insert_rowid();
                {
                    let mut upsert = tx.prepare_cached(
                        "INSERT INTO wallet_portfolio
                            (wallet_id, token_address, symbol, name, pnl_usd, swap_count, last_trade, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
                         ON CONFLICT(wallet_id, token_address) DO UPDATE SET
                            symbol = excluded.symbol,
                            name = excluded.name,
                            pnl_usd = excluded.pnl_usd,
                            swap_count = excluded.swap_count,
                            last_trade = excluded.last_trade,
                            updated_at = excluded.updated_at",
                    )?;
                    let mut enqueue = tx.prepare_cached(
                        "INSERT INTO token_queue (address, source)
                         SELECT ?1, 'portfolio'
                         WHERE NOT EXISTS (SELECT 1 FROM tokens WHERE address = ?1)
                         ON CONFLICT(address) DO NOTHING",
                    )?;
                    for t in &stats.tokens {
                        upsert.execute(rusqlite::params![
                            wallet_id,
                            t.token_address,
                            t.symbol,
                            t.name,
                            t.pnl_usd,
                            t.swap_count as i64,
                            t.last_trade,
                        ])?;
                        if register_tokens {
                            enqueue.execute([&t.token_address])?;
                        }
                    }
                }
                tx.execute(
                    "UPDATE wallets SET last_updated = datetime('now') WHERE id = ?1",
                    [wallet_id],
                )?;
                tx.execute("DELETE FROM audit_claims WHERE wallet_id = ?1", [wallet_id])?;
                tx.commit()?;
                Ok(record_id)
            })
            .await
    }

    /// Flag a wallet as a bot. Returns false when it was already flagged.
    pub async fn mark_bot(&self, wallet_id: i64, reason: &str) -> Result<bool> {
        let reason = reason.to_string();
        self.db
            .call_named("store.mark_bot", move |conn| {
                let tx = conn.transaction()?;
                let inserted = tx.execute(
                    "INSERT INTO bots (wallet_id, reason) VALUES (?1, ?2)
                     ON CONFLICT(wallet_id) DO NOTHING",
                    rusqlite::params![wallet_id, reason],
                )?;
                tx.execute(
                    "UPDATE wallets SET last_updated = datetime('now') WHERE id = ?1",
                    [wallet_id],
                )?;
                tx.execute("DELETE FROM audit_claims WHERE wallet_id = ?1", [wallet_id])?;
                tx.commit()?;
                Ok(inserted > 0)
            })
            .await
    }

    /// Log a failed audit attempt and release the claim. The wallet stays
    /// pending for later runs until `failure_limit` failures pile up. An open
    /// circuit never reached the upstream, so `circuit_open` rows only keep the
    /// wallet out of the current run.
    pub async fn mark_failed(
        &self,
        wallet_id: i64,
        run_id: &str,
        error_kind: &str,
        message: &str,
    ) -> Result<()> {
        let run_id = run_id.to_string();
        let error_kind = error_kind.to_string();
        let message = message.to_string();
        self.db
            .call_named("store.mark_failed", move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO audit_failures (wallet_id, run_id, error_kind, message)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![wallet_id, run_id, error_kind, message],
                )?;
                tx.execute("DELETE FROM audit_claims WHERE wallet_id = ?1", [wallet_id])?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Persist a token and all of its hits in one transaction. The token is
    /// stored even without hits so it is not crawled again, and leaves the
    /// token queue.
    pub async fn save_discovery(
        &self,
        token_address: &str,
        info: TokenInfo,
        hits: Vec<NewDiscoveryHit>,
    ) -> Result<usize> {
        let token_address = token_address.to_string();
        self.db
            .call_named("store.save_discovery", move |conn| {
                let tx = conn.transaction()?;
                let token_id: i64 = tx.query_row(
                    "INSERT INTO tokens (address, symbol, ath_price) VALUES (?1, ?2, ?3)
                     ON CONFLICT(address) DO UPDATE SET
                        symbol = COALESCE(tokens.symbol, excluded.symbol),
                        ath_price = COALESCE(tokens.ath_price, excluded.ath_price)
                     RETURNING id",
                    rusqlite::params![token_address, info.symbol, info.ath_price],
                    |row| row.get(0),
                )?;
                {
                    let mut insert = tx.prepare_cached(
                        "INSERT INTO discovery_hits
                            (token_id, wallet_id, category, listing, rank, pnl_on_token)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for hit in &hits {
                        let wallet_id = upsert_wallet(&tx, &hit.wallet)?;
                        insert.execute(rusqlite::params![
                            token_id,
                            wallet_id,
                            hit.category.as_str(),
                            hit.listing.as_str(),
                            hit.rank,
                            hit.pnl_on_token,
                        ])?;
                    }
                }
                tx.execute("DELETE FROM token_queue WHERE address = ?1", [&token_address])?;
                tx.commit()?;
                Ok(hits.len())
            })
            .await
    }

    /// Queue wallets for audit by hand. Returns how many were newly queued.
    pub async fn queue_wallets(&self, addresses: Vec<String>) -> Result<usize> {
        self.db
            .call_named("store.queue_wallets", move |conn| {
                let tx = conn.transaction()?;
                let mut queued = 0;
                for address in &addresses {
                    let wallet_id = upsert_wallet(&tx, address)?;
                    queued += tx.execute(
                        "INSERT INTO manual_queue (wallet_id) VALUES (?1)
                         ON CONFLICT(wallet_id) DO NOTHING",
                        [wallet_id],
                    )?;
                }
                tx.commit()?;
                Ok(queued)
            })
            .await
    }

    pub async fn queue_tokens(&self, addresses: Vec<String>, source: &'static str) -> Result<usize> {
        self.db
            .call_named("store.queue_tokens", move |conn| {
                let tx = conn.transaction()?;
                let mut queued = 0;
                for address in &addresses {
                    queued += tx.execute(
                        "INSERT INTO token_queue (address, source) VALUES (?1, ?2)
                         ON CONFLICT(address) DO NOTHING",
                        rusqlite::params![address, source],
                    )?;
                }
                tx.commit()?;
                Ok(queued)
            })
            .await
    }

    pub async fn token_queue(&self) -> Result<Vec<String>> {
        self.db
            .read_named("store.token_queue", |conn| {
                let mut stmt =
                    conn.prepare("SELECT address FROM token_queue ORDER BY queued_at, address")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn known_token_addresses(&self) -> Result<HashSet<String>> {
        self.db
            .read_named("store.known_token_addresses", |conn| {
                let mut stmt = conn.prepare("SELECT address FROM tokens")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<HashSet<String>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Stored metadata for a token, if it has a symbol already.
    pub async fn token_info(&self, address: &str) -> Result<Option<TokenInfo>> {
        let address = address.to_string();
        self.db
            .read_named("store.token_info", move |conn| {
                let info = conn
                    .query_row(
                        "SELECT symbol, ath_price FROM tokens WHERE address = ?1",
                        [address],
                        |row| {
                            Ok(TokenInfo {
                                symbol: row.get(0)?,
                                ath_price: row.get(1)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(info.filter(|i| i.symbol.is_some()))
            })
            .await
    }

    /// Wallets whose latest audit passes `rules`, best PnL first. The
    /// high-profit token count comes from the current portfolio snapshot.
    pub async fn qualified_wallets(
        &self,
        rules: &config::Qualification,
    ) -> Result<Vec<QualifiedWallet>> {
        let rules = rules.clone();
        self.db
            .read_named("store.qualified_wallets", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT address, pnl_usd, trades_30d, high_profit_tokens, captured_at
                     FROM (
                        SELECT w.address, l.pnl_usd, l.trades_30d, l.captured_at,
                               (SELECT COUNT(*) FROM wallet_portfolio p
                                WHERE p.wallet_id = w.id AND p.pnl_usd >= :min_token_pnl)
                                   AS high_profit_tokens
                        FROM (
                            SELECT a.wallet_id, a.pnl_usd, a.trades_30d, a.captured_at,
                                   ROW_NUMBER() OVER (
                                       PARTITION BY a.wallet_id
                                       ORDER BY a.captured_at DESC, a.id DESC
                                   ) AS rn
                            FROM audit_records a
                        ) l
                        JOIN wallets w ON w.id = l.wallet_id
                        WHERE l.rn = 1
                          AND NOT EXISTS (SELECT 1 FROM bots b WHERE b.wallet_id = w.id)
                     )
                     WHERE pnl_usd >= :min_pnl
                       AND trades_30d >= :min_trades
                       AND high_profit_tokens >= :min_high_profit_tokens
                     ORDER BY pnl_usd DESC",
                )?;
                let rows = stmt
                    .query_map(
                        named_params! {
                            ":min_token_pnl": rules.min_token_pnl,
                            ":min_pnl": rules.min_pnl,
                            ":min_trades": rules.min_trades as i64,
                            ":min_high_profit_tokens": rules.min_high_profit_tokens,
                        },
                        |row| {
                            Ok(QualifiedWallet {
                                address: row.get(0)?,
                                pnl_usd: row.get(1)?,
                                trades_30d: row.get::<_, i64>(2)? as u64,
                                high_profit_tokens: row.get(3)?,
                                audited_at: row.get(4)?,
                            })
                        },
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.db
            .read_named("store.stats", |conn| {
                let count = |sql: &str| -> std::result::Result<u64, rusqlite::Error> {
                    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                        .map(|n| n as u64)
                };
                Ok(StoreStats {
                    tokens: count("SELECT COUNT(*) FROM tokens")?,
                    wallets: count("SELECT COUNT(*) FROM wallets")?,
                    discovery_hits: count("SELECT COUNT(*) FROM discovery_hits")?,
                    audit_records: count("SELECT COUNT(*) FROM audit_records")?,
                    audited_wallets: count("SELECT COUNT(DISTINCT wallet_id) FROM audit_records")?,
                    bots: count("SELECT COUNT(*) FROM bots")?,
                    manual_queue: count("SELECT COUNT(*) FROM manual_queue")?,
                    token_queue: count("SELECT COUNT(*) FROM token_queue")?,
                    failures: count("SELECT COUNT(*) FROM audit_failures")?,
                })
            })
            .await
    }

    pub async fn wallet_detail(&self, address: &str) -> Result<Option<WalletDetail>> {
        let address = address.to_string();
        self.db
            .read_named("store.wallet_detail", move |conn| {
                let Some((id, first_seen_at, last_updated)) = conn
                    .query_row(
                        "SELECT id, first_seen_at, last_updated FROM wallets WHERE address = ?1",
                        [&address],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, Option<String>>(2)?,
                            ))
                        },
                    )
                    .optional()?
                else {
                    return Ok(None);
                };

                let bot_reason: Option<String> = conn
                    .query_row("SELECT reason FROM bots WHERE wallet_id = ?1", [id], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let manually_queued = conn
                    .query_row("SELECT 1 FROM manual_queue WHERE wallet_id = ?1", [id], |_| {
                        Ok(())
                    })
                    .optional()?
                    .is_some();

                let audits = conn
                    .prepare(
                        "SELECT pnl_usd, trades_30d, captured_at FROM audit_records
                         WHERE wallet_id = ?1 ORDER BY captured_at DESC, id DESC",
                    )?
                    .query_map([id], |row| {
                        Ok(AuditRow {
                            pnl_usd: row.get(0)?,
                            trades_30d: row.get::<_, i64>(1)? as u64,
                            captured_at: row.get(2)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let portfolio = conn
                    .prepare(
                        "SELECT token_address, symbol, pnl_usd, swap_count, last_trade
                         FROM wallet_portfolio WHERE wallet_id = ?1 ORDER BY pnl_usd DESC",
                    )?
                    .query_map([id], |row| {
                        Ok(PortfolioRow {
                            token_address: row.get(0)?,
                            symbol: row.get(1)?,
                            pnl_usd: row.get(2)?,
                            swap_count: row.get::<_, i64>(3)? as u64,
                            last_trade: row.get(4)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let hits = conn
                    .prepare(
                        "SELECT t.address, t.symbol, h.category, h.listing, h.rank,
                                h.pnl_on_token, h.seen_at
                         FROM discovery_hits h JOIN tokens t ON t.id = h.token_id
                         WHERE h.wallet_id = ?1 ORDER BY h.seen_at DESC, h.id DESC",
                    )?
                    .query_map([id], |row| {
                        Ok(HitRow {
                            token_address: row.get(0)?,
                            token_symbol: row.get(1)?,
                            category: Category::parse(&row.get::<_, String>(2)?),
                            listing: row.get(3)?,
                            rank: row.get(4)?,
                            pnl_on_token: row.get(5)?,
                            seen_at: row.get(6)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let failures: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM audit_failures WHERE wallet_id = ?1",
                    [id],
                    |row| row.get(0),
                )?;

                Ok(Some(WalletDetail {
                    address,
                    first_seen_at,
                    last_updated,
                    bot_reason,
                    manually_queued,
                    audits,
                    portfolio,
                    hits,
                    failures: failures as u64,
                }))
            })
            .await
    }

    pub async fn start_run(&self, run_id: &str, job: &str) -> Result<i64> {
        let run_id = run_id.to_string();
        let job = job.to_string();
        self.db
            .call_named("store.start_run", move |conn| {
                conn.execute(
                    "INSERT INTO run_history (run_id, job, status) VALUES (?1, ?2, 'running')",
                    rusqlite::params![run_id, job],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn finish_run(
        &self,
        id: i64,
        status: &str,
        duration_ms: i64,
        report: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let status = status.to_string();
        let report = report.map(|v| v.to_string());
        self.db
            .call_named("store.finish_run", move |conn| {
                conn.execute(
                    "UPDATE run_history SET
                        status = ?2,
                        finished_at = datetime('now'),
                        duration_ms = ?3,
                        report_json = ?4,
                        error = ?5
                     WHERE id = ?1",
                    rusqlite::params![id, status, duration_ms, report, error],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRow>> {
        self.db
            .read_named("store.recent_runs", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT run_id, job, status, started_at, duration_ms, report_json, error
                     FROM run_history ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit as i64], |row| {
                        Ok(RunRow {
                            run_id: row.get(0)?,
                            job: row.get(1)?,
                            status: row.get(2)?,
                            started_at: row.get(3)?,
                            duration_ms: row.get(4)?,
                            report_json: row.get(5)?,
                            error: row.get(6)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Listing, PortfolioToken};

    fn query() -> PendingQuery {
        PendingQuery {
            audit_interval_hours: 2160,
            failure_limit: 3,
            claim_ttl_secs: 3600,
            reaudit_since: None,
        }
    }

    fn hit(wallet: &str, listing: Listing, rank: u32) -> NewDiscoveryHit {
        NewDiscoveryHit {
            wallet: wallet.to_string(),
            category: listing.category(),
            listing,
            rank,
            pnl_on_token: 10.0,
        }
    }

    fn stats(pnl_usd: f64, trades_30d: u64, token_pnls: &[f64]) -> WalletStats {
        WalletStats {
            pnl_usd,
            trades_30d,
            tokens: token_pnls
                .iter()
                .enumerate()
                .map(|(i, pnl)| PortfolioToken {
                    token_address: format!("Tok{i}"),
                    symbol: Some(format!("T{i}")),
                    name: None,
                    pnl_usd: *pnl,
                    swap_count: 3,
                    last_trade: Some(1_700_000_000),
                })
                .collect(),
        }
    }

    async fn store_with(wallets: &[&str]) -> Store {
        let store = Store::open(":memory:").await.unwrap();
        let hits = wallets
            .iter()
            .enumerate()
            .map(|(i, w)| hit(w, Listing::TraderProfit, i as u32 + 1))
            .collect();
        store
            .save_discovery("TokenA", TokenInfo::default(), hits)
            .await
            .unwrap();
        store
    }

    async fn count(store: &Store, sql: &'static str) -> i64 {
        store
            .db()
            .call(move |conn| Ok(conn.query_row(sql, [], |row| row.get(0))?))
            .await
            .unwrap()
    }

    async fn pending_addresses(store: &Store) -> Vec<String> {
        store
            .get_pending_wallets(&query(), 100)
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.address)
            .collect()
    }

    #[tokio::test]
    async fn test_discovered_wallets_are_pending_until_audited() {
        let store = store_with(&["W1", "W2"]).await;
        assert_eq!(pending_addresses(&store).await, vec!["W1", "W2"]);
        assert_eq!(store.count_pending(&query()).await.unwrap(), 2);

        let claimed = store.claim_pending_wallets(&query(), "run-1", 1).await.unwrap();
        store
            .record_audit(claimed[0].id, stats(1.0, 1, &[]), false)
            .await
            .unwrap();
        assert_eq!(pending_addresses(&store).await, vec!["W2"]);

        // Older than the audit interval: due again.
        store
            .db()
            .call(|conn| {
                conn.execute(
                    "UPDATE audit_records SET captured_at = datetime('now', '-91 days')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(pending_addresses(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn test_reaudit_mode_ignores_interval_but_not_this_run() {
        let store = store_with(&["W1"]).await;
        let w = store.claim_pending_wallets(&query(), "run-1", 10).await.unwrap();
        store.record_audit(w[0].id, stats(1.0, 1, &[]), false).await.unwrap();

        let mut all = query();
        all.reaudit_since = Some(Utc::now() + ChronoDuration::seconds(5));
        assert_eq!(store.get_pending_wallets(&all, 10).await.unwrap().len(), 1);

        all.reaudit_since = Some(Utc::now() - ChronoDuration::seconds(60));
        assert!(store.get_pending_wallets(&all, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reaudit_appends_history_and_upserts_portfolio() {
        let store = store_with(&["W1"]).await;
        let w = store.claim_pending_wallets(&query(), "run-1", 10).await.unwrap();
        let id = w[0].id;
        for _ in 0..3 {
            store
                .record_audit(id, stats(500.0, 30, &[1200.0, 50.0]), false)
                .await
                .unwrap();
        }
        assert_eq!(count(&store, "SELECT COUNT(*) FROM audit_records").await, 3);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM wallet_portfolio").await, 2);
    }

    #[tokio::test]
    async fn test_claims_are_exclusive_until_released_or_stale() {
        let store = store_with(&["W1", "W2", "W3"]).await;
        let a = store.claim_pending_wallets(&query(), "run-a", 2).await.unwrap();
        let b = store.claim_pending_wallets(&query(), "run-b", 10).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert!(a.iter().all(|w| !b.contains(w)));
        assert!(store.claim_pending_wallets(&query(), "run-c", 10).await.unwrap().is_empty());

        assert_eq!(store.release_claims("run-a").await.unwrap(), 2);
        assert_eq!(store.claim_pending_wallets(&query(), "run-c", 10).await.unwrap().len(), 2);

        store
            .db()
            .call(|conn| {
                conn.execute(
                    "UPDATE audit_claims SET claimed_at = datetime('now', '-2 hours') WHERE run_id = 'run-b'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let stale = store.claim_pending_wallets(&query(), "run-d", 10).await.unwrap();
        assert_eq!(stale, b);
    }

    #[tokio::test]
    async fn test_bots_are_never_pending_again() {
        let store = store_with(&["W1"]).await;
        let w = store.claim_pending_wallets(&query(), "run-1", 10).await.unwrap();
        assert!(store.mark_bot(w[0].id, "High activity: 6000 trades").await.unwrap());
        assert!(!store.mark_bot(w[0].id, "again").await.unwrap());

        // Rediscovery and manual queueing do not bring it back.
        store
            .save_discovery("TokenB", TokenInfo::default(), vec![hit("W1", Listing::HolderProfit, 1)])
            .await
            .unwrap();
        store.queue_wallets(vec!["W1".into()]).await.unwrap();
        let mut all = query();
        all.reaudit_since = Some(Utc::now() + ChronoDuration::days(1));
        assert!(store.get_pending_wallets(&all, 10).await.unwrap().is_empty());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM audit_records").await, 0);
    }

    #[tokio::test]
    async fn test_failures_keep_wallet_pending_until_limit() {
        let store = store_with(&["W1"]).await;
        for run in ["run-1", "run-2", "run-3"] {
            let w = store.claim_pending_wallets(&query(), run, 10).await.unwrap();
            assert_eq!(w.len(), 1, "wallet should still be pending in {run}");
            store.mark_failed(w[0].id, run, "network", "timeout").await.unwrap();
            // Not handed out again within the same run.
            assert!(store.claim_pending_wallets(&query(), run, 10).await.unwrap().is_empty());
        }
        assert!(store.claim_pending_wallets(&query(), "run-4", 10).await.unwrap().is_empty());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM audit_claims").await, 0);
    }

    #[tokio::test]
    async fn test_open_circuit_failures_do_not_count_toward_limit() {
        let store = store_with(&["W1"]).await;
        for run in ["run-1", "run-2", "run-3", "run-4"] {
            let w = store.claim_pending_wallets(&query(), run, 10).await.unwrap();
            assert_eq!(w.len(), 1, "wallet should still be pending in {run}");
            store
                .mark_failed(w[0].id, run, "circuit_open", "circuit open for audit endpoint")
                .await
                .unwrap();
            assert!(store.claim_pending_wallets(&query(), run, 10).await.unwrap().is_empty());
        }
        assert_eq!(store.count_pending(&query()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_manual_queue_takes_priority() {
        let store = store_with(&["W1"]).await;
        assert_eq!(store.queue_wallets(vec!["M1".into(), "W1".into()]).await.unwrap(), 2);
        assert_eq!(store.queue_wallets(vec!["M1".into()]).await.unwrap(), 0);
        let pending = pending_addresses(&store).await;
        assert_eq!(pending.len(), 2);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM wallets").await, 2);
    }

    #[tokio::test]
    async fn test_token_upsert_backfills_only_missing_fields() {
        let store = Store::open(":memory:").await.unwrap();
        store
            .save_discovery("TokenA", TokenInfo { symbol: None, ath_price: Some(2.0) }, vec![])
            .await
            .unwrap();
        assert!(store.token_info("TokenA").await.unwrap().is_none());

        store
            .save_discovery(
                "TokenA",
                TokenInfo { symbol: Some("AAA".into()), ath_price: Some(9.0) },
                vec![hit("W1", Listing::TraderSniper, 1)],
            )
            .await
            .unwrap();
        let info = store.token_info("TokenA").await.unwrap().unwrap();
        assert_eq!(info.symbol.as_deref(), Some("AAA"));
        assert_eq!(info.ath_price, Some(2.0));
        assert_eq!(count(&store, "SELECT COUNT(*) FROM tokens").await, 1);
        assert!(store.known_token_addresses().await.unwrap().contains("TokenA"));
    }

    #[tokio::test]
    async fn test_portfolio_tokens_are_queued_for_discovery_once() {
        let store = store_with(&["W1"]).await;
        store.queue_tokens(vec!["Tok1".into()], "manual").await.unwrap();
        let w = store.claim_pending_wallets(&query(), "run-1", 10).await.unwrap();
        store
            .record_audit(w[0].id, stats(10.0, 2, &[1.0, 2.0]), true)
            .await
            .unwrap();
        let queued: HashSet<String> = store.token_queue().await.unwrap().into_iter().collect();
        assert_eq!(queued, HashSet::from(["Tok0".to_string(), "Tok1".to_string()]));

        // Tokens already crawled are not queued again.
        store
            .save_discovery("Tok0", TokenInfo::default(), vec![])
            .await
            .unwrap();
        store.record_audit(w[0].id, stats(10.0, 2, &[1.0]), true).await.unwrap();
        assert_eq!(store.token_queue().await.unwrap(), vec!["Tok1".to_string()]);
    }

    #[tokio::test]
    async fn test_qualified_wallets_use_latest_audit() {
        let store = store_with(&["W1", "W2", "W3"]).await;
        let rules = config::Qualification {
            min_pnl: 15000.0,
            min_trades: 20,
            min_high_profit_tokens: 5,
            min_token_pnl: 1000.0,
            bot_trade_threshold: 5000,
        };
        let w = store.claim_pending_wallets(&query(), "run-1", 10).await.unwrap();
        let good = [1500.0, 2000.0, 3000.0, 1000.0, 5000.0, 1200.0];
        store.record_audit(w[0].id, stats(20000.0, 25, &good), false).await.unwrap();
        // Qualified once, then fell below the PnL bar.
        store.record_audit(w[1].id, stats(30000.0, 25, &good), false).await.unwrap();
        store.record_audit(w[1].id, stats(100.0, 25, &good), false).await.unwrap();
        store
            .record_audit(w[2].id, stats(90000.0, 25, &[5000.0, 5000.0]), false)
            .await
            .unwrap();

        let qualified = store.qualified_wallets(&rules).await.unwrap();
        assert_eq!(qualified.len(), 1);
        assert_eq!(qualified[0].address, "W1");
        assert_eq!(qualified[0].high_profit_tokens, 6);
        assert!(qualified[0].gmgn_url().ends_with("/W1"));
    }

    #[tokio::test]
    async fn test_wallet_detail_and_stats() {
        let store = store_with(&["W1"]).await;
        let w = store.claim_pending_wallets(&query(), "run-1", 10).await.unwrap();
        store.record_audit(w[0].id, stats(42.0, 3, &[7.0]), false).await.unwrap();
        store.mark_failed(w[0].id, "run-1", "rate_limited", "429").await.unwrap();

        let detail = store.wallet_detail("W1").await.unwrap().unwrap();
        assert_eq!(detail.audits.len(), 1);
        assert_eq!(detail.portfolio[0].token_address, "Tok0");
        assert_eq!(detail.hits[0].category, Some(Category::SmartMoney));
        assert_eq!(detail.hits[0].listing.as_deref(), Some("trader_profit"));
        assert_eq!(detail.failures, 1);
        assert!(detail.bot_reason.is_none());
        assert!(store.wallet_detail("nope").await.unwrap().is_none());

        let s = store.stats().await.unwrap();
        assert_eq!(s.wallets, 1);
        assert_eq!(s.discovery_hits, 1);
        assert_eq!(s.audited_wallets, 1);
        assert_eq!(s.failures, 1);
    }

    #[tokio::test]
    async fn test_run_history_round_trip() {
        let store = Store::open(":memory:").await.unwrap();
        let id = store.start_run("run-1", "audit").await.unwrap();
        store
            .finish_run(id, "ok", 1234, Some(serde_json::json!({ "audited": 3 })), None)
            .await
            .unwrap();
        let runs = store.recent_runs(5).await.unwrap();
        assert_eq!(runs[0].status, "ok");
        assert_eq!(runs[0].duration_ms, Some(1234));
        assert!(runs[0].report_json.as_deref().unwrap().contains("\"audited\":3"));
    }
}
