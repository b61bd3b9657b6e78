use common::cielo::CieloApi;
use common::gmgn::GmgnApi;
use common::resilience::{ClientError, Transport};
use common::types::{Listing, ListingEntry, TokenInfo, WalletStats};

use super::fetcher_traits::{AuditFetcher, DiscoveryFetcher};

impl<T: Transport> AuditFetcher for CieloApi<T> {
    async fn fetch_wallet_stats(&self, wallet: &str) -> Result<Option<WalletStats>, ClientError> {
        self.wallet_stats(wallet).await
    }
}

impl<T: Transport> DiscoveryFetcher for GmgnApi<T> {
    async fn fetch_trending_tokens(&self, timeframe: &str) -> Result<Vec<String>, ClientError> {
        self.trending_tokens(timeframe).await
    }

    async fn fetch_listing(
        &self,
        token: &str,
        listing: Listing,
        limit: u32,
    ) -> Result<Vec<ListingEntry>, ClientError> {
        self.listing(token, listing, limit).await
    }

    async fn fetch_token_info(&self, token: &str) -> Result<Option<TokenInfo>, ClientError> {
        self.token_info(token).await
    }
}
