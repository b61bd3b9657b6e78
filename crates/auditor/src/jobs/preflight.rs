use super::fetcher_traits::{AuditFetcher, DiscoveryFetcher};

const PROBE_TIMEFRAME: &str = "1h";

/// One audit call for a wallet known to have history. The stage should be
/// skipped when this fails.
pub async fn audit_upstream_ready<F: AuditFetcher>(fetcher: &F, probe_wallet: &str) -> bool {
    match fetcher.fetch_wallet_stats(probe_wallet).await {
        Ok(Some(stats)) => {
            tracing::info!(
                endpoint = "audit",
                trades_30d = stats.trades_30d,
                "preflight passed"
            );
            true
        }
        Ok(None) => {
            tracing::error!(
                endpoint = "audit",
                wallet = probe_wallet,
                "preflight returned no data for the probe wallet"
            );
            false
        }
        Err(e) => {
            tracing::error!(endpoint = "audit", kind = e.kind(), error = %e, "preflight failed");
            false
        }
    }
}

pub async fn discovery_upstream_ready<F: DiscoveryFetcher>(fetcher: &F) -> bool {
    match fetcher.fetch_trending_tokens(PROBE_TIMEFRAME).await {
        Ok(tokens) if !tokens.is_empty() => {
            tracing::info!(endpoint = "discovery", tokens = tokens.len(), "preflight passed");
            true
        }
        Ok(_) => {
            tracing::error!(endpoint = "discovery", "preflight returned no trending tokens");
            false
        }
        Err(e) => {
            tracing::error!(endpoint = "discovery", kind = e.kind(), error = %e, "preflight failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::resilience::{ClientError, EndpointClass};
    use common::types::{Listing, ListingEntry, TokenInfo, WalletStats};

    struct Probe {
        wallet: Result<Option<WalletStats>, ()>,
        trending: Result<Vec<String>, ()>,
    }

    fn down() -> ClientError {
        ClientError::TransientNetwork {
            attempts: 4,
            message: "connection refused".into(),
        }
    }

    impl AuditFetcher for Probe {
        async fn fetch_wallet_stats(
            &self,
            _wallet: &str,
        ) -> Result<Option<WalletStats>, ClientError> {
            self.wallet.clone().map_err(|()| down())
        }
    }

    impl DiscoveryFetcher for Probe {
        async fn fetch_trending_tokens(&self, _timeframe: &str) -> Result<Vec<String>, ClientError> {
            self.trending.clone().map_err(|()| ClientError::CircuitOpen {
                endpoint: EndpointClass::Discovery,
            })
        }

        async fn fetch_listing(
            &self,
            _token: &str,
            _listing: Listing,
            _limit: u32,
        ) -> Result<Vec<ListingEntry>, ClientError> {
            Ok(vec![])
        }

        async fn fetch_token_info(&self, _token: &str) -> Result<Option<TokenInfo>, ClientError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_audit_probe() {
        let healthy = Probe {
            wallet: Ok(Some(WalletStats {
                trades_30d: 40,
                ..WalletStats::default()
            })),
            trending: Ok(vec![]),
        };
        assert!(audit_upstream_ready(&healthy, "Probe").await);

        let empty = Probe {
            wallet: Ok(None),
            trending: Ok(vec![]),
        };
        assert!(!audit_upstream_ready(&empty, "Probe").await);

        let broken = Probe {
            wallet: Err(()),
            trending: Ok(vec![]),
        };
        assert!(!audit_upstream_ready(&broken, "Probe").await);
    }

    #[tokio::test]
    async fn test_discovery_probe() {
        let healthy = Probe {
            wallet: Err(()),
            trending: Ok(vec!["TokA".into()]),
        };
        assert!(discovery_upstream_ready(&healthy).await);

        let empty = Probe {
            wallet: Err(()),
            trending: Ok(vec![]),
        };
        assert!(!discovery_upstream_ready(&empty).await);

        let open = Probe {
            wallet: Err(()),
            trending: Err(()),
        };
        assert!(!discovery_upstream_ready(&open).await);
    }
}
