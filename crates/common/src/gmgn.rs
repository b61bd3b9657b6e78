use anyhow::{Context, Result};
use reqwest::Url;
use serde_json::json;

use crate::resilience::{ClientError, ResilientClient, Transport, UpstreamRequest};
use crate::types::{Listing, ListingEntry, ListingSource, TokenInfo};
use crate::validator::{self, Validation};

/// Discovery upstream: trending tokens, per-token wallet listings, token metadata.
pub struct GmgnApi<T: Transport> {
    client: ResilientClient<T>,
    base: Url,
}

fn malformed<T>(what: &str, validation: Validation<T>) -> Result<Option<T>, ClientError> {
    match validation {
        Validation::Usable(v) => Ok(Some(v)),
        Validation::Empty => Ok(None),
        Validation::Malformed(reason) => {
            tracing::warn!(endpoint = "discovery", what, %reason, "malformed discovery payload");
            Err(ClientError::Malformed { reason })
        }
    }
}

/// Per-request browser identifiers the web app sends with rank queries.
fn device_params() -> [(&'static str, String); 5] {
    let day = chrono::Utc::now().format("%Y%m%d");
    let build = format!("{day}-{}-{:07x}", rand::random::<u16>() % 9000 + 1000, rand::random::<u32>() & 0x0fff_ffff);
    [
        ("device_id", format_uuid(rand::random::<u128>())),
        ("fp_did", format!("{:032x}", rand::random::<u128>())),
        ("client_id", format!("gmgn_web_{build}")),
        ("from_app", "gmgn".to_string()),
        ("app_ver", build),
    ]
}

fn format_uuid(n: u128) -> String {
    let hex = format!("{n:032x}");
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

impl<T: Transport> GmgnApi<T> {
    pub fn new(client: ResilientClient<T>, base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("invalid discovery base url {base_url}"))?;
        Ok(Self { client, base })
    }

    pub fn client(&self) -> &ResilientClient<T> {
        &self.client
    }

    fn origin(&self) -> String {
        self.base.origin().ascii_serialization()
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }

    pub fn trending_url(&self, timeframe: &str) -> String {
        let mut url = self.url(&format!("/api/v1/rank/sol/swaps/{timeframe}"));
        {
            let mut qp = url.query_pairs_mut();
            for (k, v) in device_params() {
                qp.append_pair(k, &v);
            }
            qp.append_pair("orderby", "swaps");
            qp.append_pair("direction", "desc");
            qp.append_pair("filters[]", "renounced");
            qp.append_pair("filters[]", "frozen");
        }
        url.to_string()
    }

    pub fn listing_url(&self, token: &str, listing: Listing, limit: u32) -> String {
        let kind = match listing.source() {
            ListingSource::Traders => "token_traders",
            ListingSource::Holders => "token_holders",
        };
        let mut url = self.url(&format!("/vas/api/v1/{kind}/sol/{token}"));
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("limit", &limit.to_string());
            qp.append_pair("orderby", listing.order_by());
            qp.append_pair("direction", "desc");
            if let Some(tag) = listing.tag() {
                qp.append_pair("tag", tag);
            }
        }
        url.to_string()
    }

    /// Trending token addresses for one timeframe; an empty ranking is not an error.
    pub async fn trending_tokens(&self, timeframe: &str) -> Result<Vec<String>, ClientError> {
        let request = UpstreamRequest::get(self.trending_url(timeframe), self.origin());
        let payload = self.client.get_json(&request).await?;
        Ok(malformed("rank", validator::validate_trending(&payload))?.unwrap_or_default())
    }

    pub async fn listing(
        &self,
        token: &str,
        listing: Listing,
        limit: u32,
    ) -> Result<Vec<ListingEntry>, ClientError> {
        let request = UpstreamRequest::get(self.listing_url(token, listing, limit), self.origin());
        let payload = self.client.get_json(&request).await?;
        Ok(malformed(listing.as_str(), validator::validate_listing(&payload))?.unwrap_or_default())
    }

    pub async fn token_info(&self, token: &str) -> Result<Option<TokenInfo>, ClientError> {
        let request = UpstreamRequest::post_json(
            self.url("/mrwapi/v1/multi_token_info").to_string(),
            self.origin(),
            json!({ "chain": "sol", "addresses": [token] }),
        );
        let payload = self.client.get_json(&request).await?;
        malformed("token_info", validator::validate_token_info(&payload))
    }
}
