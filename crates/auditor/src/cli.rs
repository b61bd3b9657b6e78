use anyhow::Result;
use common::config::Config;
use common::store::{
    PendingQuery, PendingWallet, QualifiedWallet, RunRow, Store, StoreStats, WalletDetail,
};
use std::fmt::Write as _;

const DEFAULT_PENDING_LIMIT: usize = 50;
const USAGE: &str = "usage: auditor [run | discover [--all] | audit [--all] | queue <wallet>... | pending [limit] | report | stats | wallet <address>]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Discovery then audit.
    Run,
    Discover { all: bool },
    /// `all` re-audits every wallet regardless of the audit interval.
    Audit { all: bool },
    Queue { wallets: Vec<String> },
    Pending { limit: usize },
    Report,
    Stats,
    Wallet { address: String },
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "discover" => Ok(Command::Discover {
            all: parse_all_flag(args)?,
        }),
        "audit" => Ok(Command::Audit {
            all: parse_all_flag(args)?,
        }),
        "queue" => {
            let wallets: Vec<String> = args
                .map(|w| w.trim().to_string())
                .filter(|w| !w.is_empty())
                .collect();
            if wallets.is_empty() {
                return Err("usage: auditor queue <wallet>...".to_string());
            }
            Ok(Command::Queue { wallets })
        }
        "pending" => {
            let limit = match args.next() {
                Some(raw) => raw
                    .parse()
                    .map_err(|e| format!("invalid pending limit {raw}: {e}"))?,
                None => DEFAULT_PENDING_LIMIT,
            };
            Ok(Command::Pending { limit })
        }
        "report" => Ok(Command::Report),
        "stats" => Ok(Command::Stats),
        "wallet" => {
            let address = args
                .next()
                .ok_or_else(|| "usage: auditor wallet <address>".to_string())?;
            Ok(Command::Wallet { address })
        }
        "help" | "--help" | "-h" => Err(USAGE.to_string()),
        other => Err(format!("unknown command: {other}\n{USAGE}")),
    }
}

fn parse_all_flag<I: Iterator<Item = String>>(mut args: I) -> std::result::Result<bool, String> {
    match args.next().as_deref() {
        None => Ok(false),
        Some("--all") => Ok(true),
        Some(other) => Err(format!("unexpected argument: {other}")),
    }
}

/// Run a store-only command. Job commands are handled by `main`.
pub async fn run_command(store: &Store, config: &Config, cmd: Command) -> Result<()> {
    match cmd {
        Command::Run | Command::Discover { .. } | Command::Audit { .. } => Ok(()),
        Command::Queue { wallets } => {
            let requested = wallets.len();
            let queued = store.queue_wallets(wallets).await?;
            println!("Queued {queued} of {requested} wallets.");
            Ok(())
        }
        Command::Pending { limit } => {
            let query = PendingQuery::from_config(&config.pipeline);
            let total = store.count_pending(&query).await?;
            let wallets = store.get_pending_wallets(&query, limit).await?;
            print!("{}", render_pending(&wallets, total));
            Ok(())
        }
        Command::Report => {
            let wallets = store.qualified_wallets(&config.qualification).await?;
            print!("{}", render_report(&wallets));
            Ok(())
        }
        Command::Stats => {
            let stats = store.stats().await?;
            let runs = store.recent_runs(5).await?;
            print!("{}", render_stats(&stats, &runs));
            Ok(())
        }
        Command::Wallet { address } => {
            match store.wallet_detail(&address).await? {
                Some(detail) => print!("{}", render_wallet(&detail)),
                None => println!("Wallet {address} not found."),
            }
            Ok(())
        }
    }
}

pub fn render_pending(wallets: &[PendingWallet], total: u64) -> String {
    let mut out = format!("Pending wallets: {total}\n");
    for w in wallets {
        let _ = writeln!(out, "  {}", w.address);
    }
    if (wallets.len() as u64) < total {
        let _ = writeln!(out, "  ... {} more", total - wallets.len() as u64);
    }
    out
}

pub fn render_report(wallets: &[QualifiedWallet]) -> String {
    let mut out = format!("Qualified wallets: {}\n", wallets.len());
    for w in wallets {
        let _ = writeln!(
            out,
            "{pnl:>12.2}  {trades:>5}  {winners:>3}  {addr}  {audited}\n    {cielo}\n    {gmgn}",
            pnl = w.pnl_usd,
            trades = w.trades_30d,
            winners = w.high_profit_tokens,
            addr = w.address,
            audited = w.audited_at,
            cielo = w.cielo_url(),
            gmgn = w.gmgn_url(),
        );
    }
    out
}

pub fn render_stats(stats: &StoreStats, runs: &[RunRow]) -> String {
    let mut out = String::from("Store:\n");
    for (label, n) in [
        ("tokens", stats.tokens),
        ("token queue", stats.token_queue),
        ("wallets", stats.wallets),
        ("discovery hits", stats.discovery_hits),
        ("audit records", stats.audit_records),
        ("audited wallets", stats.audited_wallets),
        ("bots", stats.bots),
        ("manual queue", stats.manual_queue),
        ("failures", stats.failures),
    ] {
        let _ = writeln!(out, "  {label:<16} {n}");
    }
    if !runs.is_empty() {
        out.push_str("Recent runs:\n");
        for r in runs {
            let duration = r
                .duration_ms
                .map_or_else(|| "-".to_string(), |ms| format!("{:.1}s", ms as f64 / 1000.0));
            let _ = writeln!(
                out,
                "  {started}  {job:<9} {status:<9} {duration:>8}  {detail}",
                started = r.started_at,
                job = r.job,
                status = r.status,
                detail = r.error.as_deref().or(r.report_json.as_deref()).unwrap_or(""),
            );
        }
    }
    out
}

pub fn render_wallet(d: &WalletDetail) -> String {
    let mut out = format!("Wallet {}\n", d.address);
    let _ = writeln!(out, "  first seen:   {}", d.first_seen_at);
    let _ = writeln!(
        out,
        "  last updated: {}",
        d.last_updated.as_deref().unwrap_or("never")
    );
    if let Some(reason) = &d.bot_reason {
        let _ = writeln!(out, "  bot:          {reason}");
    }
    if d.manually_queued {
        out.push_str("  manually queued\n");
    }
    let _ = writeln!(out, "  failures:     {}", d.failures);
    let _ = writeln!(out, "  {}", d.cielo_url());
    let _ = writeln!(out, "  {}", d.gmgn_url());

    let _ = writeln!(out, "Audits ({}):", d.audits.len());
    for a in &d.audits {
        let _ = writeln!(
            out,
            "  {}  pnl {:>12.2}  trades {:>5}",
            a.captured_at, a.pnl_usd, a.trades_30d
        );
    }
    let _ = writeln!(out, "Portfolio ({}):", d.portfolio.len());
    for p in &d.portfolio {
        let _ = writeln!(
            out,
            "  {:>12.2}  {:>5} swaps  {:<10} {}",
            p.pnl_usd,
            p.swap_count,
            p.symbol.as_deref().unwrap_or("?"),
            p.token_address
        );
    }
    let _ = writeln!(out, "Discovery hits ({}):", d.hits.len());
    for h in &d.hits {
        let _ = writeln!(
            out,
            "  #{:<4} {:<18} {:<10} {:>12.2}  {}",
            h.rank,
            h.listing.as_deref().unwrap_or("-"),
            h.token_symbol.as_deref().unwrap_or("?"),
            h.pnl_on_token,
            h.token_address
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{PortfolioToken, WalletStats};

    fn parse(args: &[&str]) -> std::result::Result<Command, String> {
        let argv: Vec<String> = std::iter::once("auditor")
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect();
        parse_args(argv.into_iter())
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse(&[]).unwrap(), Command::Run);
        assert_eq!(parse(&["run"]).unwrap(), Command::Run);
        assert_eq!(parse(&["discover"]).unwrap(), Command::Discover { all: false });
        assert_eq!(parse(&["audit", "--all"]).unwrap(), Command::Audit { all: true });
        assert_eq!(
            parse(&["queue", "W1", "W2"]).unwrap(),
            Command::Queue {
                wallets: vec!["W1".into(), "W2".into()]
            }
        );
        assert_eq!(parse(&["pending"]).unwrap(), Command::Pending { limit: 50 });
        assert_eq!(parse(&["pending", "5"]).unwrap(), Command::Pending { limit: 5 });
        assert_eq!(parse(&["report"]).unwrap(), Command::Report);
        assert_eq!(parse(&["stats"]).unwrap(), Command::Stats);
        assert_eq!(
            parse(&["wallet", "Abc"]).unwrap(),
            Command::Wallet {
                address: "Abc".into()
            }
        );
    }

    #[test]
    fn test_queue_trims_pasted_addresses() {
        assert_eq!(
            parse(&["queue", "  W1 ", "\tW2\n", "   "]).unwrap(),
            Command::Queue {
                wallets: vec!["W1".into(), "W2".into()]
            }
        );
        assert!(parse(&["queue", " ", ""]).is_err());
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse(&["queue"]).is_err());
        assert!(parse(&["wallet"]).is_err());
        assert!(parse(&["pending", "many"]).is_err());
        assert!(parse(&["audit", "--everything"]).is_err());
        assert!(parse(&["frobnicate"]).unwrap_err().contains("unknown command"));
    }

    #[test]
    fn test_render_pending_mentions_remainder() {
        let wallets = vec![PendingWallet {
            id: 1,
            address: "W1".into(),
        }];
        let out = render_pending(&wallets, 3);
        assert!(out.starts_with("Pending wallets: 3\n"));
        assert!(out.contains("  W1\n"));
        assert!(out.contains("... 2 more"));
    }

    #[tokio::test]
    async fn test_wallet_view_after_queue_and_audit() {
        let store = Store::open(":memory:").await.unwrap();
        let config: Config = include_str!("../../../config/default.toml").parse().unwrap();

        run_command(
            &store,
            &config,
            Command::Queue {
                wallets: vec!["Viewed".into()],
            },
        )
        .await
        .unwrap();

        let pending = store
            .get_pending_wallets(&PendingQuery::from_config(&config.pipeline), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        store
            .record_audit(
                pending[0].id,
                WalletStats {
                    pnl_usd: 1234.5,
                    trades_30d: 9,
                    tokens: vec![PortfolioToken {
                        token_address: "TokZ".into(),
                        symbol: Some("ZZZ".into()),
                        pnl_usd: 99.0,
                        swap_count: 2,
                        ..PortfolioToken::default()
                    }],
                },
                false,
            )
            .await
            .unwrap();

        let detail = store.wallet_detail("Viewed").await.unwrap().unwrap();
        let out = render_wallet(&detail);
        assert!(out.starts_with("Wallet Viewed\n"));
        assert!(out.contains("manually queued"));
        assert!(out.contains("Audits (1):"));
        assert!(out.contains("1234.50"));
        assert!(out.contains("ZZZ"));

        let stats = store.stats().await.unwrap();
        let rendered = render_stats(&stats, &[]);
        assert!(rendered.contains("audit records    1"));
        assert!(render_report(&[]).starts_with("Qualified wallets: 0"));
    }
}
