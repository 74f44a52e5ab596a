//! Exchange REST Client
//! Mission: Signed, rate-limited, retrying request pipeline
//!
//! Every authenticated request carries three headers: the API key id, the
//! current epoch-millisecond timestamp, and a base64 RSA-PSS (SHA-256,
//! MGF1-SHA-256, salt length = digest length) signature over the ASCII bytes
//! `{timestamp}{METHOD}{path}` where path excludes the query string.
//!
//! A single token bucket (10 req/s) is shared across all callers. HTTP 429
//! honours the server's Retry-After; other transient failures back off
//! 1s / 2s / 4s with a three-attempt ceiling.

use crate::exchange::types::{
    ApiEvent, ApiMarket, ApiOrder, BalanceResponse, EventResponse, EventsResponse, FillsResponse,
    MarketResponse, MarketsResponse, OrderRequest, OrderResponse, PositionsResponse,
};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::SigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const MAX_RETRIES: u32 = 3;
const REQUESTS_PER_SECOND: f64 = 10.0;
const PAGE_LIMIT: u32 = 200;

struct TokenBucket {
    tokens: f64,
    last: Instant,
}

pub struct KalshiClient {
    http: reqwest::Client,
    base_url: String,
    api_key_id: String,
    signing_key: SigningKey<Sha256>,
    limiter: Mutex<TokenBucket>,
}

impl KalshiClient {
    pub fn new(api_key_id: &str, private_key_pem: &str, base_url: &str) -> Result<Self> {
        let private_key = if private_key_pem.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(private_key_pem)
                .context("Failed to parse PKCS#1 RSA private key")?
        } else {
            RsaPrivateKey::from_pkcs8_pem(private_key_pem)
                .context("Failed to parse PKCS#8 private key")?
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("edgebot/0.1 (mispricing engine)")
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key_id: api_key_id.to_string(),
            // SigningKey::new pins the PSS salt length to the digest length
            signing_key: SigningKey::new(private_key),
            limiter: Mutex::new(TokenBucket {
                tokens: REQUESTS_PER_SECOND,
                last: Instant::now(),
            }),
        })
    }

    // ----- auth helpers -----

    fn sign(&self, timestamp_ms: i64, method: &str, path: &str) -> String {
        let message = format!("{}{}{}", timestamp_ms, method, path);
        let signature = self
            .signing_key
            .sign_with_rng(&mut rand::thread_rng(), message.as_bytes());
        BASE64.encode(signature.to_bytes())
    }

    fn auth_headers(&self, method: &str, path: &str) -> Result<HeaderMap> {
        let ts = Utc::now().timestamp_millis();
        let sig = self.sign(ts, method, path);

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("kalshi-access-key"),
            HeaderValue::from_str(&self.api_key_id).context("invalid API key id header")?,
        );
        headers.insert(
            HeaderName::from_static("kalshi-access-timestamp"),
            HeaderValue::from_str(&ts.to_string())?,
        );
        headers.insert(
            HeaderName::from_static("kalshi-access-signature"),
            HeaderValue::from_str(&sig)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    // ----- rate limiting -----

    async fn acquire_token(&self) {
        let mut bucket = self.limiter.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * REQUESTS_PER_SECOND).min(REQUESTS_PER_SECOND);
        bucket.last = now;

        if bucket.tokens < 1.0 {
            let wait = (1.0 - bucket.tokens) / REQUESTS_PER_SECOND;
            sleep(Duration::from_secs_f64(wait)).await;
            bucket.tokens = 0.0;
            bucket.last = Instant::now();
        } else {
            bucket.tokens -= 1.0;
        }
    }

    // ----- low-level request -----

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut backoff = 1u64;

        for attempt in 1..=MAX_RETRIES {
            self.acquire_token().await;

            // Timestamp freshness matters, so headers are rebuilt per attempt
            let headers = self.auth_headers(method.as_str(), path)?;
            let mut req = self.http.request(method.clone(), &url).headers(headers);
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(b) = &body {
                req = req.json(b);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = resp
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(backoff);
                        warn!(
                            "Rate limited on {} {} (attempt {}), sleeping {}s",
                            method, path, attempt, retry_after
                        );
                        sleep(Duration::from_secs(retry_after)).await;
                        backoff *= 2;
                        continue;
                    }
                    if status.is_server_error() {
                        warn!(
                            "Server error {} on {} {} (attempt {})",
                            status, method, path, attempt
                        );
                    } else if !status.is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        bail!("API error {} on {} {}: {}", status, method, path, text);
                    } else {
                        let bytes = resp.bytes().await.context("Failed to read response body")?;
                        if bytes.is_empty() {
                            return Ok(Value::Null);
                        }
                        return serde_json::from_slice(&bytes)
                            .with_context(|| format!("Failed to parse response from {}", path));
                    }
                }
                Err(e) => {
                    warn!(
                        "Request error on {} {} (attempt {}): {}",
                        method, path, attempt, e
                    );
                }
            }

            if attempt < MAX_RETRIES {
                debug!("Retrying {} {} in {}s", method, path, backoff);
                sleep(Duration::from_secs(backoff)).await;
                backoff *= 2;
            }
        }

        bail!(
            "Request failed after {} attempts: {} {}",
            MAX_RETRIES,
            method,
            path
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let value = self.request(Method::GET, path, query, None).await?;
        serde_json::from_value(value).with_context(|| format!("Unexpected response shape from {}", path))
    }

    // =====================================================================
    // Market data
    // =====================================================================

    pub async fn get_markets(
        &self,
        status: &str,
        cursor: Option<&str>,
    ) -> Result<MarketsResponse> {
        let mut query = vec![
            ("status", status.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }
        self.get_json("/markets", &query).await
    }

    /// Page through every market with the given status.
    pub async fn get_all_markets(&self, status: &str) -> Result<Vec<ApiMarket>> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.get_markets(status, cursor.as_deref()).await?;
            let empty_page = page.markets.is_empty();
            all.extend(page.markets);
            cursor = page.cursor.filter(|c| !c.is_empty());
            if cursor.is_none() || empty_page {
                break;
            }
            debug!("Fetched {} markets so far", all.len());
        }
        info!("Fetched {} total markets (status={})", all.len(), status);
        Ok(all)
    }

    pub async fn get_market(&self, ticker: &str) -> Result<ApiMarket> {
        let resp: MarketResponse = self.get_json(&format!("/markets/{}", ticker), &[]).await?;
        Ok(resp.market)
    }

    pub async fn get_orderbook(&self, ticker: &str) -> Result<Value> {
        self.request(
            Method::GET,
            &format!("/markets/{}/orderbook", ticker),
            &[],
            None,
        )
        .await
    }

    pub async fn get_events(&self, status: &str, cursor: Option<&str>) -> Result<EventsResponse> {
        let mut query = vec![
            ("status", status.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }
        self.get_json("/events", &query).await
    }

    pub async fn get_all_events(&self, status: &str) -> Result<Vec<ApiEvent>> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.get_events(status, cursor.as_deref()).await?;
            let empty_page = page.events.is_empty();
            all.extend(page.events);
            cursor = page.cursor.filter(|c| !c.is_empty());
            if cursor.is_none() || empty_page {
                break;
            }
        }
        info!("Fetched {} total events (status={})", all.len(), status);
        Ok(all)
    }

    pub async fn get_event(&self, event_ticker: &str) -> Result<ApiEvent> {
        let resp: EventResponse = self.get_json(&format!("/events/{}", event_ticker), &[]).await?;
        Ok(resp.event)
    }

    // =====================================================================
    // Portfolio / trading
    // =====================================================================

    pub async fn get_balance(&self) -> Result<BalanceResponse> {
        self.get_json("/portfolio/balance", &[]).await
    }

    pub async fn get_positions(&self) -> Result<PositionsResponse> {
        self.get_json(
            "/portfolio/positions",
            &[("limit", PAGE_LIMIT.to_string())],
        )
        .await
    }

    pub async fn place_order(&self, order: &OrderRequest) -> Result<ApiOrder> {
        info!(
            "Placing order: {} {} {} x {} (yes_price={:?})",
            order.action, order.side, order.count, order.ticker, order.yes_price
        );
        let body = serde_json::to_value(order)?;
        let value = self
            .request(Method::POST, "/portfolio/orders", &[], Some(body))
            .await?;
        // The API wraps the order; tolerate a bare object as well
        match serde_json::from_value::<OrderResponse>(value.clone()) {
            Ok(resp) => Ok(resp.order),
            Err(_) => serde_json::from_value(value).context("Unexpected order response shape"),
        }
    }

    pub async fn get_order(&self, order_id: &str) -> Result<ApiOrder> {
        let value = self
            .request(
                Method::GET,
                &format!("/portfolio/orders/{}", order_id),
                &[],
                None,
            )
            .await?;
        match serde_json::from_value::<OrderResponse>(value.clone()) {
            Ok(resp) => Ok(resp.order),
            Err(_) => serde_json::from_value(value).context("Unexpected order response shape"),
        }
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.request(
            Method::DELETE,
            &format!("/portfolio/orders/{}", order_id),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn get_fills(&self, cursor: Option<&str>) -> Result<FillsResponse> {
        let mut query = vec![("limit", PAGE_LIMIT.to_string())];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }
        self.get_json("/portfolio/fills", &query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;
    use rsa::pss::VerifyingKey;
    use rsa::signature::Verifier;
    use rsa::RsaPublicKey;

    fn test_client() -> (KalshiClient, RsaPublicKey) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        let client = KalshiClient::new(
            "test-key-id",
            &pem,
            "https://demo-api.kalshi.co/trade-api/v2",
        )
        .unwrap();
        (client, public_key)
    }

    #[test]
    fn signature_verifies_under_pss() {
        let (client, public_key) = test_client();
        let sig_b64 = client.sign(1_700_000_000_000, "GET", "/markets");

        let sig_bytes = BASE64.decode(sig_b64).unwrap();
        let signature = rsa::pss::Signature::try_from(sig_bytes.as_slice()).unwrap();
        let verifier = VerifyingKey::<Sha256>::new(public_key);
        verifier
            .verify(b"1700000000000GET/markets", &signature)
            .expect("signature must verify over {ts}{METHOD}{path}");
    }

    #[test]
    fn auth_headers_carry_all_three_fields() {
        let (client, _) = test_client();
        let headers = client.auth_headers("POST", "/portfolio/orders").unwrap();
        assert_eq!(headers.get("kalshi-access-key").unwrap(), "test-key-id");
        assert!(headers.contains_key("kalshi-access-timestamp"));
        assert!(headers.contains_key("kalshi-access-signature"));
    }

    #[test]
    fn base_url_trailing_slash_is_stripped() {
        let mut rng = rand::thread_rng();
        let pem = RsaPrivateKey::new(&mut rng, 2048)
            .unwrap()
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        let client = KalshiClient::new("k", &pem, "https://example.com/trade-api/v2/").unwrap();
        assert_eq!(client.base_url, "https://example.com/trade-api/v2");
    }
}
