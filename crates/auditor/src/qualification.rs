use common::config::Qualification;
use common::types::WalletStats;

/// Business disposition of one successfully fetched wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Automated trading; flagged and never queued again.
    Bot { reason: String },
    Qualified { high_profit_tokens: u32 },
    Rejected { high_profit_tokens: u32 },
}

pub fn bot_reason(trades_30d: u64) -> String {
    format!("High activity: {trades_30d} trades")
}

pub fn classify(stats: &WalletStats, rules: &Qualification) -> Verdict {
    if stats.trades_30d > rules.bot_trade_threshold {
        return Verdict::Bot {
            reason: bot_reason(stats.trades_30d),
        };
    }

    let high_profit_tokens = stats.high_profit_tokens(rules.min_token_pnl);
    if stats.pnl_usd >= rules.min_pnl
        && stats.trades_30d >= rules.min_trades
        && high_profit_tokens >= rules.min_high_profit_tokens
    {
        Verdict::Qualified { high_profit_tokens }
    } else {
        Verdict::Rejected { high_profit_tokens }
    }
}
