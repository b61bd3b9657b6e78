use anyhow::{Context, Result};
use reqwest::Url;
use serde_json::json;

use crate::resilience::{ClientError, ResilientClient, Transport, UpstreamRequest};
use crate::types::WalletStats;
use crate::validator::{self, Validation};

/// Audit upstream: 30-day PnL and per-token breakdown for one wallet.
pub struct CieloApi<T: Transport> {
    client: ResilientClient<T>,
    base: Url,
}

impl<T: Transport> CieloApi<T> {
    pub fn new(client: ResilientClient<T>, base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("invalid audit base url {base_url}"))?;
        Ok(Self { client, base })
    }

    pub fn client(&self) -> &ResilientClient<T> {
        &self.client
    }

    pub fn wallet_pnl_url(&self, wallet: &str) -> String {
        let input = json!({
            "json": {
                "wallet": wallet,
                "chains": "",
                "timeframe": "30d",
                "sortBy": "pnl_desc",
                "page": "1",
                "tokenFilter": ""
            }
        });
        let mut url = self.base.clone();
        url.set_path("/api/trpc/profile.fetchTokenPnlFast");
        url.query_pairs_mut()
            .append_pair("input", &input.to_string());
        url.to_string()
    }

    /// `Ok(None)` means the wallet has no recorded activity.
    pub async fn wallet_stats(&self, wallet: &str) -> Result<Option<WalletStats>, ClientError> {
        let request = UpstreamRequest::get(
            self.wallet_pnl_url(wallet),
            self.base.origin().ascii_serialization(),
        );
        let payload = self.client.get_json(&request).await?;
        match validator::validate_wallet_pnl(&payload) {
            Validation::Usable(stats) => Ok(Some(stats)),
            Validation::Empty => Ok(None),
            Validation::Malformed(reason) => {
                tracing::warn!(endpoint = "audit", wallet, %reason, "malformed wallet payload");
                Err(ClientError::Malformed { reason })
            }
        }
    }
}
