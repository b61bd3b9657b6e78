//! Schema checks that turn untyped upstream JSON into typed results.
//!
//! Nothing here performs I/O. A payload is either usable, legitimately
//! empty (no activity, no listing entries), or malformed. Malformed
//! payloads are data-quality errors and are never retried.

use serde_json::Value;

use crate::types::{ListingEntry, PortfolioToken, TokenInfo, WalletStats};

#[derive(Debug, Clone, PartialEq)]
pub enum Validation<T> {
    Usable(T),
    Empty,
    Malformed(String),
}

impl<T> Validation<T> {
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Usable(_))
    }
}

/// Numbers arrive as JSON numbers or numeric strings depending on the endpoint.
fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Audit upstream wallet payload: `result.data.json.data`.
pub fn validate_wallet_pnl(payload: &Value) -> Validation<WalletStats> {
    let Some(json) = payload
        .get("result")
        .and_then(|r| r.get("data"))
        .and_then(|d| d.get("json"))
    else {
        return Validation::Malformed("missing result.data.json".to_string());
    };
    let inner = match json.get("data") {
        None | Some(Value::Null) => return Validation::Empty,
        Some(inner) if inner.is_object() => inner,
        Some(_) => return Validation::Malformed("result.data.json.data is not an object".into()),
    };

    // Present-but-null totals are zero; absent ones mean the schema moved.
    let pnl_usd = match inner.get("total_pnl_usd") {
        None => return Validation::Malformed("missing total_pnl_usd".to_string()),
        Some(Value::Null) => 0.0,
        Some(v) => match as_f64(v) {
            Some(f) => f,
            None => return Validation::Malformed("total_pnl_usd is not numeric".to_string()),
        },
    };
    let trades_30d = match inner.get("total_tokens_traded") {
        None => return Validation::Malformed("missing total_tokens_traded".to_string()),
        Some(Value::Null) => 0,
        Some(v) => match as_u64(v) {
            Some(n) => n,
            None => {
                return Validation::Malformed("total_tokens_traded is not a count".to_string())
            }
        },
    };

    let items = match inner.get("tokens") {
        Some(Value::Array(a)) if !a.is_empty() => a.as_slice(),
        _ => match inner.get("items") {
            Some(Value::Array(a)) => a.as_slice(),
            _ => &[],
        },
    };
    let tokens = items.iter().filter_map(portfolio_token).collect();

    Validation::Usable(WalletStats {
        pnl_usd,
        trades_30d,
        tokens,
    })
}

fn portfolio_token(item: &Value) -> Option<PortfolioToken> {
    let token_address = as_text(item.get("token_address"))?;
    Some(PortfolioToken {
        token_address,
        symbol: as_text(item.get("token_symbol")),
        name: as_text(item.get("token_name")),
        pnl_usd: item.get("total_pnl_usd").and_then(as_f64).unwrap_or(0.0),
        swap_count: item.get("num_swaps").and_then(as_u64).unwrap_or(0),
        last_trade: item.get("last_trade").and_then(as_f64).map(|t| t as i64),
    })
}

/// Discovery upstream envelope `{code, data}`; returns `data` when `code == 0`.
fn gmgn_data(payload: &Value) -> Result<&Value, String> {
    let Some(code) = payload.get("code") else {
        return Err("missing code".to_string());
    };
    if code.as_i64() != Some(0) {
        return Err(format!("upstream error code {code}"));
    }
    match payload.get("data") {
        None | Some(Value::Null) => Err("missing data".to_string()),
        Some(data) => Ok(data),
    }
}

/// Trending token addresses from `data.rank`.
pub fn validate_trending(payload: &Value) -> Validation<Vec<String>> {
    let data = match gmgn_data(payload) {
        Ok(d) => d,
        Err(reason) => return Validation::Malformed(reason),
    };
    let Some(rank) = data.get("rank").and_then(Value::as_array) else {
        return Validation::Malformed("missing data.rank list".to_string());
    };
    if rank.is_empty() {
        return Validation::Empty;
    }
    let addresses: Vec<String> = rank
        .iter()
        .filter_map(|item| as_text(item.get("address")))
        .collect();
    if addresses.is_empty() {
        return Validation::Malformed("rank items carry no address".to_string());
    }
    Validation::Usable(addresses)
}

/// Trader or holder listing from `data.list` / `data.holders`.
pub fn validate_listing(payload: &Value) -> Validation<Vec<ListingEntry>> {
    let data = match gmgn_data(payload) {
        Ok(d) => d,
        Err(reason) => return Validation::Malformed(reason),
    };
    let Some(items) = data
        .get("list")
        .or_else(|| data.get("holders"))
    else {
        return Validation::Malformed("missing data.list or data.holders".to_string());
    };
    let Some(items) = items.as_array() else {
        return Validation::Malformed("listing items are not a list".to_string());
    };
    if items.is_empty() {
        return Validation::Empty;
    }
    let entries: Vec<ListingEntry> = items
        .iter()
        .filter_map(|item| {
            Some(ListingEntry {
                address: as_text(item.get("address"))?,
                profit: item.get("profit").and_then(as_f64).unwrap_or(0.0),
            })
        })
        .collect();
    if entries.is_empty() {
        return Validation::Malformed("listing items carry no address".to_string());
    }
    Validation::Usable(entries)
}

/// First entry of a `multi_token_info` response.
pub fn validate_token_info(payload: &Value) -> Validation<TokenInfo> {
    let data = match gmgn_data(payload) {
        Ok(d) => d,
        Err(reason) => return Validation::Malformed(reason),
    };
    let Some(list) = data.as_array() else {
        return Validation::Malformed("token info data is not a list".to_string());
    };
    let Some(first) = list.first() else {
        return Validation::Empty;
    };
    Validation::Usable(TokenInfo {
        symbol: as_text(first.get("symbol")),
        ath_price: first
            .get("ath_price")
            .or_else(|| first.get("highest_price"))
            .and_then(as_f64),
    })
}
