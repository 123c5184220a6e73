pub mod types;

pub use types::*;

use governor::{Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Baseline sleep between reconciliation cycles
pub const BASE_DELAY_MS: u64 = 2000;
/// Writes per second allowed through to the exchange
const WRITE_RATE_PER_SEC: u32 = 5;

// Type alias for the write limiter to simplify signatures
type WriteLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Closed taxonomy of exchange-call failures. Callers branch on the variant
/// to pick a disposition instead of string-matching messages.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("rate limit exceeded")]
    Throttled,

    /// Price moved past the order before it landed; one bid/ask reprice
    /// retry is warranted.
    #[error("fast market rejection (code {code})")]
    FastMarket { code: i64 },

    /// Success-equivalent rejection (not modified, already closed)
    #[error("no-op rejection (code {code}): {msg}")]
    BusinessNoop { code: i64, msg: String },

    #[error("rejected (code {code}): {msg}")]
    Rejected { code: i64, msg: String },
}

impl ExchangeError {
    fn from_ret(code: i64, msg: String) -> Self {
        match code {
            10006 => ExchangeError::Throttled,
            130024 | 130027 | 130030 => ExchangeError::FastMarket { code },
            10002 | 34040 => ExchangeError::BusinessNoop { code, msg },
            _ if msg == "not modified" => ExchangeError::BusinessNoop { code, msg },
            _ => ExchangeError::Rejected { code, msg },
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, ExchangeError::BusinessNoop { .. })
    }

    pub fn is_fast_market(&self) -> bool {
        matches!(self, ExchangeError::FastMarket { .. })
    }
}

/// Cache key for read calls. Keyed by call kind, not parameters: within one
/// reconciliation iteration repeated reads must see one logical snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Tickers,
    Positions,
    WalletBalance,
    InstrumentsInfo,
    NewOrders,
}

/// REST client with an iteration-scoped response cache, adaptive pacing
/// driven by the server's remaining-quota reports, and a registered
/// callback for hard throttling.
///
/// The client only signals throttling; the surrounding application decides
/// the escalation policy.
pub struct ExchangeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    cache: Mutex<HashMap<CallKind, Value>>,
    delay_ms: AtomicU64,
    write_limiter: Arc<WriteLimiter>,
    throttle_cb: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ExchangeClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");

        let quota = Quota::per_second(NonZeroU32::new(WRITE_RATE_PER_SEC).unwrap());

        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            cache: Mutex::new(HashMap::new()),
            delay_ms: AtomicU64::new(BASE_DELAY_MS),
            write_limiter: Arc::new(RateLimiter::direct(quota)),
            throttle_cb: None,
        }
    }

    /// Register the hard-throttling callback (invoked on a 10006 rejection)
    pub fn with_throttle_callback(mut self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.throttle_cb = Some(Box::new(cb));
        self
    }

    /// Sleep the main loop should take before the next reconciliation cycle
    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::Relaxed))
    }

    /// Drop every cached read. Called once at the start of each main-loop
    /// iteration so reads never leak across iterations.
    pub fn invalidate_all(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Integral backoff: recover slowly, back off quickly
    fn update_delay(&self, ratio: f64) {
        if ratio >= 0.7 {
            self.delay_ms.store(BASE_DELAY_MS, Ordering::Relaxed);
            tracing::debug!("Rate quota healthy ({:.2}), delay reset", ratio);
            return;
        }
        let bump = if ratio >= 0.5 {
            500
        } else if ratio >= 0.4 {
            1000
        } else if ratio >= 0.2 {
            2000
        } else {
            4000
        };
        let delay = self.delay_ms.fetch_add(bump, Ordering::Relaxed) + bump;
        tracing::warn!("Rate quota at {:.2}, delay now {}ms", ratio, delay);
    }

    fn check_envelope(&self, code: i64, msg: String, ratio: Option<f64>) -> Result<(), ExchangeError> {
        if code == 0 {
            // The quota ratio only means anything on a served request
            if let Some(ratio) = ratio {
                self.update_delay(ratio);
            }
            return Ok(());
        }
        let err = ExchangeError::from_ret(code, msg);
        if matches!(err, ExchangeError::Throttled) {
            if let Some(cb) = &self.throttle_cb {
                cb();
            }
        }
        Err(err)
    }

    /// Read call with explicit per-call cache opt-in. Responses are stored
    /// only on success.
    async fn get_read<T: DeserializeOwned>(
        &self,
        kind: CallKind,
        path: &str,
        query: &[(&str, String)],
        use_cache: bool,
    ) -> Result<T, ExchangeError> {
        if use_cache {
            let cache = self.cache.lock().unwrap();
            if let Some(value) = cache.get(&kind) {
                return serde_json::from_value(value.clone())
                    .map_err(|e| ExchangeError::Decode(e.to_string()));
            }
        }

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .header("X-API-SECRET", &self.api_secret)
            .query(&[("category", "linear")])
            .query(query)
            .send()
            .await?;

        let envelope: RestResponse<Value> = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;

        self.check_envelope(envelope.ret_code, envelope.ret_msg, envelope.rate_limit_ratio)?;

        let value = envelope
            .result
            .ok_or_else(|| ExchangeError::Decode("missing result".to_string()))?;

        self.cache.lock().unwrap().insert(kind, value.clone());

        serde_json::from_value(value).map_err(|e| ExchangeError::Decode(e.to_string()))
    }

    /// Write call: never cached, paced through the write limiter
    async fn post_write<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ExchangeError> {
        self.write_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .header("X-API-SECRET", &self.api_secret)
            .json(body)
            .send()
            .await?;

        let envelope: RestResponse<T> = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;

        self.check_envelope(envelope.ret_code, envelope.ret_msg, envelope.rate_limit_ratio)?;

        envelope
            .result
            .ok_or_else(|| ExchangeError::Decode("missing result".to_string()))
    }

    // ---- read surface ----

    pub async fn get_tickers(&self, cached: bool) -> Result<Vec<Ticker>, ExchangeError> {
        let result: ListResult<Ticker> = self
            .get_read(CallKind::Tickers, "/v5/market/tickers", &[], cached)
            .await?;
        Ok(result.list)
    }

    pub async fn get_ticker(&self, symbol: &str, cached: bool) -> Result<Ticker, ExchangeError> {
        let tickers = self.get_tickers(cached).await?;
        tickers
            .into_iter()
            .find(|t| t.symbol == symbol)
            .ok_or_else(|| ExchangeError::Decode(format!("no ticker for {}", symbol)))
    }

    pub async fn get_positions(&self, cached: bool) -> Result<Vec<PositionInfo>, ExchangeError> {
        let result: ListResult<PositionInfo> = self
            .get_read(
                CallKind::Positions,
                "/v5/position/list",
                &[("settleCoin", "USDT".to_string())],
                cached,
            )
            .await?;
        Ok(result.list)
    }

    pub async fn get_wallet_balance(&self, cached: bool) -> Result<WalletBalance, ExchangeError> {
        self.get_read(
            CallKind::WalletBalance,
            "/v5/account/wallet-balance",
            &[("coin", "USDT".to_string())],
            cached,
        )
        .await
    }

    pub async fn get_instruments_info(
        &self,
        cached: bool,
    ) -> Result<Vec<InstrumentInfo>, ExchangeError> {
        let result: ListResult<InstrumentInfo> = self
            .get_read(
                CallKind::InstrumentsInfo,
                "/v5/market/instruments-info",
                &[],
                cached,
            )
            .await?;
        Ok(result.list)
    }

    /// Resting (not yet filled) orders, for orphan detection
    pub async fn get_new_orders(&self, cached: bool) -> Result<Vec<OpenOrder>, ExchangeError> {
        let result: ListResult<OpenOrder> = self
            .get_read(
                CallKind::NewOrders,
                "/v5/order/history",
                &[("orderStatus", "New".to_string())],
                cached,
            )
            .await?;
        Ok(result.list)
    }

    /// Recent klines for the volatility filter. Intentionally uncached:
    /// parameterized per symbol and only hit on the entry path.
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval_minutes: u32,
        limit: u32,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let url = format!("{}/v5/market/kline", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .header("X-API-SECRET", &self.api_secret)
            .query(&[
                ("category", "linear".to_string()),
                ("symbol", symbol.to_string()),
                ("interval", interval_minutes.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;

        let envelope: RestResponse<ListResult<Kline>> = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Decode(e.to_string()))?;
        self.check_envelope(envelope.ret_code, envelope.ret_msg, envelope.rate_limit_ratio)?;
        Ok(envelope
            .result
            .ok_or_else(|| ExchangeError::Decode("missing result".to_string()))?
            .list)
    }

    // ---- write surface ----

    pub async fn submit_order(&self, req: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        self.post_write("/v5/order/create", req).await
    }

    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<(), ExchangeError> {
        let body = serde_json::json!({ "category": "linear", "symbol": symbol });
        let _: Value = self.post_write("/v5/order/cancel-all", &body).await?;
        Ok(())
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<(), ExchangeError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": leverage,
            "sellLeverage": leverage,
        });
        let _: Value = self.post_write("/v5/position/set-leverage", &body).await?;
        Ok(())
    }

    pub async fn switch_position_mode(&self, mode: u8) -> Result<(), ExchangeError> {
        let body = serde_json::json!({ "category": "linear", "coin": "USDT", "mode": mode });
        let _: Value = self.post_write("/v5/position/switch-mode", &body).await?;
        Ok(())
    }

    pub async fn set_trading_stop(&self, req: &TradingStopRequest) -> Result<(), ExchangeError> {
        let _: Value = self.post_write("/v5/position/trading-stop", req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use std::sync::atomic::AtomicBool;

    fn tickers_body() -> String {
        serde_json::json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": { "list": [
                { "symbol": "XYZUSDT", "lastPrice": 2.0, "bidPrice": 1.99, "askPrice": 2.01 }
            ]}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_cached_read_hits_server_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_body(tickers_body())
            .expect(1)
            .create_async()
            .await;

        let client = ExchangeClient::new(server.url(), "key", "secret");

        let first = client.get_tickers(true).await.unwrap();
        let second = client.get_tickers(true).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second[0].symbol, "XYZUSDT");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalidate_all_forces_refetch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_body(tickers_body())
            .expect(2)
            .create_async()
            .await;

        let client = ExchangeClient::new(server.url(), "key", "secret");

        client.get_tickers(true).await.unwrap();
        client.invalidate_all();
        client.get_tickers(true).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_low_quota_ratio_bumps_delay() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": { "list": [] },
            "rateLimitRatio": 0.15
        })
        .to_string();
        server
            .mock("GET", mockito::Matcher::Any)
            .with_body(body)
            .create_async()
            .await;

        let client = ExchangeClient::new(server.url(), "key", "secret");
        let before = client.current_delay();

        client.get_tickers(false).await.unwrap();

        assert_eq!(
            client.current_delay(),
            before + Duration::from_millis(4000)
        );
    }

    #[tokio::test]
    async fn test_healthy_ratio_resets_delay() {
        let mut server = mockito::Server::new_async().await;
        let low = serde_json::json!({
            "retCode": 0, "retMsg": "OK",
            "result": { "list": [] }, "rateLimitRatio": 0.45
        });
        let healthy = serde_json::json!({
            "retCode": 0, "retMsg": "OK",
            "result": { "list": [] }, "rateLimitRatio": 0.9
        });
        server
            .mock("GET", mockito::Matcher::Any)
            .with_body(low.to_string())
            .expect(1)
            .create_async()
            .await;

        let client = ExchangeClient::new(server.url(), "key", "secret");
        client.get_tickers(false).await.unwrap();
        assert_eq!(
            client.current_delay(),
            Duration::from_millis(BASE_DELAY_MS + 1000)
        );

        let mut server2 = mockito::Server::new_async().await;
        server2
            .mock("GET", mockito::Matcher::Any)
            .with_body(healthy.to_string())
            .create_async()
            .await;
        // Same delay state, fresh server reporting a healthy quota
        let client = ExchangeClient::new(server2.url(), "key", "secret");
        client.delay_ms.store(7500, Ordering::Relaxed);
        client.get_tickers(false).await.unwrap();
        assert_eq!(client.current_delay(), Duration::from_millis(BASE_DELAY_MS));
    }

    #[tokio::test]
    async fn test_rejected_response_leaves_delay_untouched() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "retCode": 10001, "retMsg": "bad", "rateLimitRatio": 0.15
        })
        .to_string();
        server
            .mock("GET", mockito::Matcher::Any)
            .with_body(body)
            .create_async()
            .await;

        let client = ExchangeClient::new(server.url(), "key", "secret");
        assert!(client.get_tickers(false).await.is_err());
        assert_eq!(client.current_delay(), Duration::from_millis(BASE_DELAY_MS));
    }

    #[tokio::test]
    async fn test_throttle_invokes_callback() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({ "retCode": 10006, "retMsg": "rate limit" }).to_string();
        server
            .mock("GET", mockito::Matcher::Any)
            .with_body(body)
            .create_async()
            .await;

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let client = ExchangeClient::new(server.url(), "key", "secret")
            .with_throttle_callback(move || fired_clone.store(true, Ordering::Relaxed));

        let err = client.get_tickers(false).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Throttled));
        assert!(fired.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_fast_market_classification() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({ "retCode": 130027, "retMsg": "price moved" }).to_string();
        server
            .mock("POST", mockito::Matcher::Any)
            .with_body(body)
            .create_async()
            .await;

        let client = ExchangeClient::new(server.url(), "key", "secret");
        let req = OrderRequest::market("XYZUSDT", Side::Buy, 1.0);
        let err = client.submit_order(&req).await.unwrap_err();

        assert!(err.is_fast_market());
    }

    #[tokio::test]
    async fn test_not_modified_is_noop() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({ "retCode": 140025, "retMsg": "not modified" }).to_string();
        server
            .mock("POST", mockito::Matcher::Any)
            .with_body(body)
            .create_async()
            .await;

        let client = ExchangeClient::new(server.url(), "key", "secret");
        let req = TradingStopRequest::new("XYZUSDT", Side::Buy);
        let err = client.set_trading_stop(&req).await.unwrap_err();

        assert!(err.is_noop());
    }

    #[tokio::test]
    async fn test_error_response_not_cached() {
        let mut server = mockito::Server::new_async().await;
        let bad = server
            .mock("GET", mockito::Matcher::Any)
            .with_body(serde_json::json!({ "retCode": 10001, "retMsg": "bad" }).to_string())
            .expect(1)
            .create_async()
            .await;

        let client = ExchangeClient::new(server.url(), "key", "secret");
        assert!(client.get_tickers(true).await.is_err());
        bad.assert_async().await;

        // After the failure the cache must still be empty
        assert!(client.cache.lock().unwrap().is_empty());
    }
}
