use common::resilience::ClientError;
use common::types::{Listing, ListingEntry, TokenInfo, WalletStats};

/// Audit upstream as the pipeline sees it. `Ok(None)` is a wallet without
/// recorded activity.
pub trait AuditFetcher {
    fn fetch_wallet_stats(
        &self,
        wallet: &str,
    ) -> impl std::future::Future<Output = Result<Option<WalletStats>, ClientError>> + Send;
}

pub trait DiscoveryFetcher {
    fn fetch_trending_tokens(
        &self,
        timeframe: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, ClientError>> + Send;

    fn fetch_listing(
        &self,
        token: &str,
        listing: Listing,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ListingEntry>, ClientError>> + Send;

    fn fetch_token_info(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Option<TokenInfo>, ClientError>> + Send;
}
