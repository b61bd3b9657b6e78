use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ORIGIN, REFERER, USER_AGENT};
use reqwest::Method;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// A single upstream request, independent of proxy and fingerprint.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub json_body: Option<serde_json::Value>,
    /// Site the request pretends to come from (`Origin`/`Referer`).
    pub origin: String,
}

impl UpstreamRequest {
    pub fn get(url: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            json_body: None,
            origin: origin.into(),
        }
    }

    pub fn post_json(
        url: impl Into<String>,
        origin: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            json_body: Some(body),
            origin: origin.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

/// Raw HTTP seam under [`super::ResilientClient`]. Implementations must not
/// retry; the client owns retry, breaker and proxy bookkeeping.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: &UpstreamRequest,
        proxy_url: Option<&str>,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}

#[derive(Debug, Clone, Copy)]
struct BrowserIdentity {
    user_agent: &'static str,
    platform: &'static str,
}

const IDENTITIES: &[BrowserIdentity] = &[
    BrowserIdentity {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        platform: "\"macOS\"",
    },
    BrowserIdentity {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
        platform: "\"Windows\"",
    },
    BrowserIdentity {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0.0.0 Safari/537.36",
        platform: "\"Linux\"",
    },
    BrowserIdentity {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
        platform: "\"Windows\"",
    },
];

/// reqwest-backed transport with browser-like headers.
///
/// reqwest binds proxies per client, so one client is built lazily per proxy
/// URL and cached. The browser identity rotates every `rotate_every` requests.
pub struct HttpTransport {
    timeout: Duration,
    direct: reqwest::Client,
    proxied: Mutex<HashMap<String, reqwest::Client>>,
    rotate_every: u64,
    requests: AtomicU64,
    identity: AtomicUsize,
}

impl HttpTransport {
    pub fn new(timeout: Duration, rotate_every: u64) -> Result<Self, TransportError> {
        let direct = build_client(timeout, None)?;
        Ok(Self {
            timeout,
            direct,
            proxied: Mutex::new(HashMap::new()),
            rotate_every,
            requests: AtomicU64::new(0),
            identity: AtomicUsize::new(rand::thread_rng().gen_range(0..IDENTITIES.len())),
        })
    }

    fn client_for(&self, proxy_url: Option<&str>) -> Result<reqwest::Client, TransportError> {
        let Some(url) = proxy_url else {
            return Ok(self.direct.clone());
        };
        let mut cache = self.proxied.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = cache.get(url) {
            return Ok(client.clone());
        }
        let client = build_client(self.timeout, Some(url))?;
        cache.insert(url.to_string(), client.clone());
        Ok(client)
    }

    fn next_identity(&self) -> BrowserIdentity {
        let n = self.requests.fetch_add(1, Ordering::Relaxed);
        if self.rotate_every > 0 && n > 0 && n % self.rotate_every == 0 {
            let current = self.identity.load(Ordering::Relaxed);
            let offset = rand::thread_rng().gen_range(1..IDENTITIES.len());
            let next = (current + offset) % IDENTITIES.len();
            self.identity.store(next, Ordering::Relaxed);
            tracing::debug!(user_agent = IDENTITIES[next].user_agent, "rotated browser identity");
        }
        IDENTITIES[self.identity.load(Ordering::Relaxed) % IDENTITIES.len()]
    }
}

fn build_client(timeout: Duration, proxy_url: Option<&str>) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)));
    if let Some(url) = proxy_url {
        // Do not surface the reqwest error text: it can echo the proxy URL.
        let Ok(proxy) = reqwest::Proxy::all(url) else {
            return Err(TransportError::Network("invalid proxy url".to_string()));
        };
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {e}")))
}

fn browser_headers(identity: BrowserIdentity, origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(identity.user_agent));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/plain, */*"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static(identity.platform));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
    let origin = origin.trim_end_matches('/');
    if let Ok(v) = HeaderValue::from_str(origin) {
        headers.insert(ORIGIN, v);
    }
    if let Ok(v) = HeaderValue::from_str(&format!("{origin}/")) {
        headers.insert(REFERER, v);
    }
    headers
}

fn classify_reqwest_error(e: &reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &UpstreamRequest,
        proxy_url: Option<&str>,
    ) -> Result<TransportResponse, TransportError> {
        let client = self.client_for(proxy_url)?;
        let identity = self.next_identity();

        let mut builder = client
            .request(request.method.clone(), &request.url)
            .headers(browser_headers(identity, &request.origin));
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e.without_url()))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e.without_url()))?;
        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}
