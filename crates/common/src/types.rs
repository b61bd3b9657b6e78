use serde::Serialize;

/// How a wallet showed up in a token's listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    SmartMoney,
    Sniper,
    Holder,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SmartMoney => "smart_money",
            Self::Sniper => "sniper",
            Self::Holder => "holder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "smart_money" => Some(Self::SmartMoney),
            "sniper" => Some(Self::Sniper),
            "holder" => Some(Self::Holder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingSource {
    Traders,
    Holders,
}

/// One per-token wallet listing queried during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listing {
    TraderProfit,
    TraderRealized,
    TraderUnrealized,
    TraderSniper,
    HolderAmount,
    HolderProfit,
    HolderUnrealized,
}

impl Listing {
    pub const ALL: [Listing; 7] = [
        Self::TraderProfit,
        Self::TraderRealized,
        Self::TraderUnrealized,
        Self::TraderSniper,
        Self::HolderAmount,
        Self::HolderProfit,
        Self::HolderUnrealized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TraderProfit => "trader_profit",
            Self::TraderRealized => "trader_realized",
            Self::TraderUnrealized => "trader_unrealized",
            Self::TraderSniper => "trader_sniper",
            Self::HolderAmount => "holder_amount",
            Self::HolderProfit => "holder_profit",
            Self::HolderUnrealized => "holder_unrealized",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Self::TraderProfit | Self::TraderRealized | Self::TraderUnrealized => {
                Category::SmartMoney
            }
            Self::TraderSniper => Category::Sniper,
            Self::HolderAmount | Self::HolderProfit | Self::HolderUnrealized => Category::Holder,
        }
    }

    pub fn source(&self) -> ListingSource {
        match self {
            Self::TraderProfit
            | Self::TraderRealized
            | Self::TraderUnrealized
            | Self::TraderSniper => ListingSource::Traders,
            _ => ListingSource::Holders,
        }
    }

    pub fn order_by(&self) -> &'static str {
        match self {
            Self::TraderProfit | Self::TraderSniper | Self::HolderProfit => "profit",
            Self::TraderRealized => "realized_profit",
            Self::TraderUnrealized | Self::HolderUnrealized => "unrealized_profit",
            Self::HolderAmount => "amount_percentage",
        }
    }

    pub fn tag(&self) -> Option<&'static str> {
        match self {
            Self::TraderSniper => Some("sniper"),
            _ => None,
        }
    }
}

/// Token metadata as reported by the discovery upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenInfo {
    pub symbol: Option<String>,
    pub ath_price: Option<f64>,
}

/// A wallet row from one listing, in listing order.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub address: String,
    pub profit: f64,
}

/// A wallet sighting ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDiscoveryHit {
    pub wallet: String,
    pub category: Category,
    pub listing: Listing,
    /// 1-based position in the listing.
    pub rank: u32,
    pub pnl_on_token: f64,
}

/// Validated audit payload for one wallet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalletStats {
    pub pnl_usd: f64,
    pub trades_30d: u64,
    pub tokens: Vec<PortfolioToken>,
}

impl WalletStats {
    pub fn high_profit_tokens(&self, min_token_pnl: f64) -> u32 {
        self.tokens
            .iter()
            .filter(|t| t.pnl_usd >= min_token_pnl)
            .count() as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortfolioToken {
    pub token_address: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub pnl_usd: f64,
    pub swap_count: u64,
    /// Unix seconds of the last trade.
    pub last_trade: Option<i64>,
}

pub fn cielo_profile_url(address: &str) -> String {
    format!("https://app.cielo.finance/profile/{address}?timeframe=30d&sortBy=pnl_desc")
}

pub fn gmgn_profile_url(address: &str) -> String {
    format!("https://gmgn.ai/sol/address/{address}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_categories() {
        assert_eq!(Listing::TraderRealized.category(), Category::SmartMoney);
        assert_eq!(Listing::TraderSniper.category(), Category::Sniper);
        assert_eq!(Listing::TraderSniper.tag(), Some("sniper"));
        assert_eq!(Listing::HolderAmount.category(), Category::Holder);
        assert_eq!(Listing::HolderAmount.source(), ListingSource::Holders);
        assert_eq!(Listing::HolderAmount.order_by(), "amount_percentage");
    }

    #[test]
    fn test_category_round_trips_through_str() {
        for c in [Category::SmartMoney, Category::Sniper, Category::Holder] {
            assert_eq!(Category::parse(c.as_str()), Some(c));
        }
        assert_eq!(Category::parse("whale"), None);
    }

    #[test]
    fn test_profile_links_are_derived_from_address() {
        assert_eq!(
            cielo_profile_url("Abc"),
            "https://app.cielo.finance/profile/Abc?timeframe=30d&sortBy=pnl_desc"
        );
        assert_eq!(gmgn_profile_url("Abc"), "https://gmgn.ai/sol/address/Abc");
    }

    #[test]
    fn test_high_profit_tokens_uses_inclusive_threshold() {
        let stats = WalletStats {
            pnl_usd: 0.0,
            trades_30d: 0,
            tokens: [999.0, 1000.0, 2500.0]
                .into_iter()
                .map(|pnl_usd| PortfolioToken {
                    pnl_usd,
                    ..Default::default()
                })
                .collect(),
        };
        assert_eq!(stats.high_profit_tokens(1000.0), 2);
    }
}
