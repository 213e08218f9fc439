//! Bybit V5 linear-perpetuals REST adapter (C2): signed requests, retry with
//! exponential backoff, and a benign/transient/fatal error taxonomy. The
//! `ExchangeClient` trait exists so the controller can be driven against a
//! recorded fake in tests, per the substitutable-adapter design note.

use crate::config::Config;
use crate::types::{Candle, Execution, Instrument, RemotePosition, Side, Ticker};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: &str = "10000";

/// retCode values the original bot treats as idempotent/no-op successes.
const BENIGN_CODES: &[i64] = &[110043, 100028, 110007, 110025, 110026];
/// retCode values worth retrying with backoff.
const RETRY_CODES: &[i64] = &[10002, 10006, 10018, 10019, 10004];

#[derive(Debug, Clone)]
pub enum BybitError {
    /// Rate limited (retCode=10006 or HTTP 429).
    RateLimit { retry_after: u64 },
    /// Transient error: network, timeout, HTTP 5xx, server overload, timestamp skew.
    Transient(String),
    /// Benign business-level reject the controller treats as a no-op.
    Benign { code: i64, msg: String },
    /// Fatal: auth failure, schema error, unknown code.
    Fatal { code: i64, msg: String },
}

impl std::fmt::Display for BybitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BybitError::RateLimit { retry_after } => {
                write!(f, "rate limited (retry after {retry_after}s)")
            }
            BybitError::Transient(msg) => write!(f, "transient error: {msg}"),
            BybitError::Benign { code, msg } => write!(f, "benign retCode={code} msg={msg}"),
            BybitError::Fatal { code, msg } => write!(f, "fatal retCode={code} msg={msg}"),
        }
    }
}

impl std::error::Error for BybitError {}

fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> BybitError {
    if ret_code == 10006 || http_status == 429 {
        BybitError::RateLimit { retry_after: 10 }
    } else if RETRY_CODES.contains(&ret_code) || (500..=599).contains(&http_status) {
        BybitError::Transient(msg.to_string())
    } else if BENIGN_CODES.contains(&ret_code) {
        BybitError::Benign {
            code: ret_code,
            msg: msg.to_string(),
        }
    } else {
        BybitError::Fatal {
            code: ret_code,
            msg: msg.to_string(),
        }
    }
}

/// Generic retry wrapper: up to `max_retries` attempts, `2^attempt` second
/// backoff on transient/rate-limit errors. Benign and fatal errors return
/// immediately.
async fn with_retry<F, Fut, T>(operation: F, max_retries: u32) -> Result<T, BybitError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, BybitError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(r) => return Ok(r),
            Err(BybitError::RateLimit { retry_after }) => {
                if attempt >= max_retries {
                    return Err(BybitError::RateLimit { retry_after });
                }
                log::warn!(
                    "rate limited — sleeping {retry_after}s (attempt {}/{max_retries})",
                    attempt + 1
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                attempt += 1;
            }
            Err(BybitError::Transient(msg)) => {
                if attempt >= max_retries {
                    return Err(BybitError::Transient(msg));
                }
                let wait = 2u64.pow(attempt);
                log::warn!("transient error: {msg} — retry in {wait}s ({}/{max_retries})", attempt + 1);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderResponse {
    pub ret_code: i64,
    pub ret_msg: String,
    pub order_id: Option<String>,
}

/// The semantic operation set the trading controller depends on. Implemented
/// by `BybitClient` against the real venue, and by recorded fakes in tests.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, BybitError>;
    async fn get_ticker(&self, symbol: &str) -> Result<Option<Ticker>, BybitError>;
    async fn get_instrument(&self, symbol: &str) -> Result<Option<Instrument>, BybitError>;
    async fn set_leverage(&self, symbol: &str, leverage: i64) -> Result<(), BybitError>;
    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> Result<(), BybitError>;
    async fn get_position(&self, symbol: &str) -> Result<Option<RemotePosition>, BybitError>;
    async fn get_wallet_balance(&self) -> Result<Option<f64>, BybitError>;
    async fn get_total_equity(&self) -> Result<Option<f64>, BybitError>;
    async fn calculate_qty(&self, symbol: &str, size_usdt: f64, price: f64) -> Result<f64, BybitError>;
    async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        qty: f64,
        reduce_only: bool,
        price: Option<f64>,
    ) -> Result<OrderResponse, BybitError>;
    async fn cancel_order(&self, symbol: &str, order_id: Option<&str>) -> Result<(), BybitError>;
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<String>, BybitError>;
    async fn get_order_execution_price(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<f64>, BybitError>;
    async fn get_recent_executions(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Execution>, BybitError>;
}

#[derive(Clone)]
pub struct BybitClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BybitClient {
    pub fn new(cfg: &Config) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("HTTP client build failed");

        BybitClient {
            client,
            base_url: cfg.base_url().to_string(),
            api_key: cfg.bybit_api_key.clone(),
            api_secret: cfg.bybit_api_secret.clone(),
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("HMAC init failed");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn headers(&self, ts: &str, signature: &str) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("X-BAPI-API-KEY", self.api_key.parse().unwrap());
        headers.insert("X-BAPI-TIMESTAMP", ts.parse().unwrap());
        headers.insert("X-BAPI-SIGN", signature.parse().unwrap());
        headers.insert("X-BAPI-SIGN-TYPE", "2".parse().unwrap());
        headers.insert("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.parse().unwrap());
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            "application/json".parse().unwrap(),
        );
        headers
    }

    fn sorted_query(params: &BTreeMap<&str, String>) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn get_signed(
        &self,
        endpoint: &str,
        params: &BTreeMap<&str, String>,
    ) -> Result<serde_json::Value, BybitError> {
        let query = Self::sorted_query(params);
        let ts = Self::timestamp_ms().to_string();
        let payload = format!("{}{}{}{}", ts, self.api_key, RECV_WINDOW_MS, query);
        let signature = self.sign(&payload);
        let url = format!("{}{}?{}", self.base_url, endpoint, query);

        let resp = self
            .client
            .get(&url)
            .headers(self.headers(&ts, &signature))
            .send()
            .await
            .map_err(|e| BybitError::Transient(format!("HTTP error: {e}")))?;
        self.parse_envelope(resp).await
    }

    async fn get_public(&self, endpoint: &str, params: &BTreeMap<&str, String>) -> Result<serde_json::Value, BybitError> {
        let query = Self::sorted_query(params);
        let url = format!("{}{}?{}", self.base_url, endpoint, query);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BybitError::Transient(format!("HTTP error: {e}")))?;
        self.parse_envelope(resp).await
    }

    async fn post_signed(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, BybitError> {
        let body_str = body.to_string();
        let ts = Self::timestamp_ms().to_string();
        let payload = format!("{}{}{}{}", ts, self.api_key, RECV_WINDOW_MS, body_str);
        let signature = self.sign(&payload);
        let url = format!("{}{}", self.base_url, endpoint);

        let resp = self
            .client
            .post(&url)
            .headers(self.headers(&ts, &signature))
            .body(body_str)
            .send()
            .await
            .map_err(|e| BybitError::Transient(format!("HTTP error: {e}")))?;
        self.parse_envelope(resp).await
    }

    async fn parse_envelope(&self, resp: reqwest::Response) -> Result<serde_json::Value, BybitError> {
        let http_status = resp.status().as_u16();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BybitError::Transient(format!("parse error: {e}")))?;
        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        let ret_msg = json["retMsg"].as_str().unwrap_or("unknown");
        if ret_code != 0 {
            return Err(classify_error(ret_code, http_status, ret_msg));
        }
        Ok(json)
    }

    fn parse_candle(row: &serde_json::Value) -> Option<Candle> {
        let arr = row.as_array()?;
        Some(Candle {
            timestamp: arr.first()?.as_str()?.parse().ok()?,
            open: arr.get(1)?.as_str()?.parse().ok()?,
            high: arr.get(2)?.as_str()?.parse().ok()?,
            low: arr.get(3)?.as_str()?.parse().ok()?,
            close: arr.get(4)?.as_str()?.parse().ok()?,
            volume: arr.get(5)?.as_str()?.parse().ok()?,
            turnover: arr.get(6).and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
        })
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn get_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>, BybitError> {
        let symbol = symbol.to_string();
        let interval = interval.to_string();
        with_retry(
            || {
                let symbol = symbol.clone();
                let interval = interval.clone();
                async move {
                    let mut params = BTreeMap::new();
                    params.insert("category", "linear".to_string());
                    params.insert("symbol", symbol.clone());
                    params.insert("interval", interval.clone());
                    params.insert("limit", limit.to_string());
                    let json = self.get_public("/v5/market/kline", &params).await?;
                    let list = json["result"]["list"].as_array().cloned().unwrap_or_default();
                    if (list.len() as f64) < 0.9 * limit as f64 {
                        log::warn!(
                            "[{symbol}] received fewer candles than requested: {}/{limit}",
                            list.len()
                        );
                    }
                    // Bybit returns newest-first; present newest-first to the caller
                    // (per the adapter operation contract), cache layer re-sorts as needed.
                    Ok(list.iter().filter_map(Self::parse_candle).collect())
                }
            },
            3,
        )
        .await
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Option<Ticker>, BybitError> {
        let mut params = BTreeMap::new();
        params.insert("category", "linear".to_string());
        params.insert("symbol", symbol.to_string());
        let json = self.get_public("/v5/market/tickers", &params).await?;
        let list = json["result"]["list"].as_array().cloned().unwrap_or_default();
        Ok(list.first().and_then(|t| {
            t["lastPrice"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .map(|last_price| Ticker { last_price })
        }))
    }

    async fn get_instrument(&self, symbol: &str) -> Result<Option<Instrument>, BybitError> {
        let mut params = BTreeMap::new();
        params.insert("category", "linear".to_string());
        params.insert("symbol", symbol.to_string());
        let json = self.get_public("/v5/market/instruments-info", &params).await?;
        let list = json["result"]["list"].as_array().cloned().unwrap_or_default();
        Ok(list.first().and_then(|item| {
            let lot = &item["lotSizeFilter"];
            let price = &item["priceFilter"];
            Some(Instrument {
                lot_step: lot["qtyStep"].as_str()?.parse().ok()?,
                min_qty: lot["minOrderQty"].as_str()?.parse().ok()?,
                max_qty: lot["maxOrderQty"].as_str()?.parse().ok()?,
                tick_size: price["tickSize"].as_str()?.parse().ok()?,
                min_price: price["minPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                max_price: price["maxPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(f64::MAX),
            })
        }))
    }

    async fn set_leverage(&self, symbol: &str, leverage: i64) -> Result<(), BybitError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self.post_signed("/v5/position/set-leverage", &body).await {
            Ok(_) => Ok(()),
            Err(BybitError::Benign { code, .. }) => {
                log::debug!("{symbol} leverage already {leverage}x (retCode={code})");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> Result<(), BybitError> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "tradeMode": if mode == "CROSS" { 1 } else { 0 },
            "buyLeverage": "0",
            "sellLeverage": "0",
        });
        match self.post_signed("/v5/position/switch-isolated", &body).await {
            Ok(_) => Ok(()),
            Err(BybitError::Benign { code, .. }) => {
                log::debug!("{symbol} margin mode already {mode} (retCode={code})");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<RemotePosition>, BybitError> {
        let mut params = BTreeMap::new();
        params.insert("category", "linear".to_string());
        params.insert("symbol", symbol.to_string());
        let json = self.get_signed("/v5/position/list", &params).await?;
        let list = json["result"]["list"].as_array().cloned().unwrap_or_default();
        Ok(list.into_iter().find_map(|p| {
            let size: f64 = p["size"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            if size <= 0.0 {
                return None;
            }
            let side = match p["side"].as_str() {
                Some("Buy") => Side::Long,
                Some("Sell") => Side::Short,
                _ => return None,
            };
            let avg_price = p["avgPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            Some(RemotePosition { side, size, avg_price })
        }))
    }

    async fn get_wallet_balance(&self) -> Result<Option<f64>, BybitError> {
        let mut params = BTreeMap::new();
        params.insert("accountType", "UNIFIED".to_string());
        let json = self.get_signed("/v5/account/wallet-balance", &params).await?;
        let accounts = json["result"]["list"].as_array().cloned().unwrap_or_default();
        let Some(account) = accounts.first() else {
            return Ok(None);
        };
        let coins = account["coin"].as_array().cloned().unwrap_or_default();
        for coin in &coins {
            if coin["coin"].as_str() == Some("USDT") {
                let raw = coin["availableBalance"]
                    .as_str()
                    .or_else(|| coin["availableToWithdraw"].as_str());
                if let Some(v) = raw.and_then(|s| s.parse::<f64>().ok()) {
                    if v > 0.0 {
                        return Ok(Some(v));
                    }
                }
            }
        }
        let total_equity: Option<f64> = account["totalEquity"].as_str().and_then(|s| s.parse().ok());
        Ok(total_equity.filter(|v| *v > 0.0))
    }

    async fn get_total_equity(&self) -> Result<Option<f64>, BybitError> {
        let mut params = BTreeMap::new();
        params.insert("accountType", "UNIFIED".to_string());
        let json = self.get_signed("/v5/account/wallet-balance", &params).await?;
        let accounts = json["result"]["list"].as_array().cloned().unwrap_or_default();
        Ok(accounts
            .first()
            .and_then(|a| a["totalEquity"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| *v > 0.0))
    }

    async fn calculate_qty(&self, symbol: &str, size_usdt: f64, price: f64) -> Result<f64, BybitError> {
        let info = self
            .get_instrument(symbol)
            .await?
            .ok_or_else(|| BybitError::Fatal {
                code: 0,
                msg: format!("cannot get instrument info for {symbol}"),
            })?;
        let raw_qty = size_usdt / price;
        let stepped = (raw_qty / info.lot_step).floor() * info.lot_step;
        Ok(stepped.clamp(info.min_qty, info.max_qty))
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        qty: f64,
        reduce_only: bool,
        price: Option<f64>,
    ) -> Result<OrderResponse, BybitError> {
        let order_type = if price.is_some() { "Limit" } else { "Market" };
        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": side,
            "orderType": order_type,
            "qty": qty.to_string(),
            "timeInForce": "GTC",
        });
        if reduce_only {
            body["reduceOnly"] = serde_json::json!(true);
        }
        if let Some(p) = price {
            body["price"] = serde_json::json!(p.to_string());
        }
        // placeOrder never raises on business-level rejects: inspect the
        // envelope directly rather than routing through parse_envelope.
        let body_str = body.to_string();
        let ts = Self::timestamp_ms().to_string();
        let payload = format!("{}{}{}{}", ts, self.api_key, RECV_WINDOW_MS, body_str);
        let signature = self.sign(&payload);
        let url = format!("{}/v5/order/create", self.base_url);
        let resp = self
            .client
            .post(&url)
            .headers(self.headers(&ts, &signature))
            .body(body_str)
            .send()
            .await
            .map_err(|e| BybitError::Transient(format!("HTTP error: {e}")))?;
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BybitError::Transient(format!("parse error: {e}")))?;
        let ret_code = json["retCode"].as_i64().unwrap_or(-1);
        let ret_msg = json["retMsg"].as_str().unwrap_or("unknown").to_string();
        let order_id = json["result"]["orderId"].as_str().map(|s| s.to_string());
        if ret_code == 0 {
            log::info!("order placed: {symbol} {side} qty={qty} reduce_only={reduce_only}");
        } else {
            log::warn!("order response: {symbol} {side} - {ret_msg} (code={ret_code})");
        }
        Ok(OrderResponse { ret_code, ret_msg, order_id })
    }

    async fn cancel_order(&self, symbol: &str, order_id: Option<&str>) -> Result<(), BybitError> {
        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
        });
        if let Some(id) = order_id {
            body["orderId"] = serde_json::json!(id);
        }
        self.post_signed("/v5/order/cancel", &body).await?;
        log::info!("order cancelled: {symbol} {}", order_id.unwrap_or("all"));
        Ok(())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<String>, BybitError> {
        let mut params = BTreeMap::new();
        params.insert("category", "linear".to_string());
        params.insert("orderStatus", "New,PartiallyFilled".to_string());
        if let Some(s) = symbol {
            params.insert("symbol", s.to_string());
        }
        let json = self.get_signed("/v5/order/realtime", &params).await?;
        let list = json["result"]["list"].as_array().cloned().unwrap_or_default();
        Ok(list
            .iter()
            .filter_map(|o| o["orderId"].as_str().map(|s| s.to_string()))
            .collect())
    }

    async fn get_order_execution_price(&self, symbol: &str, order_id: &str) -> Result<Option<f64>, BybitError> {
        let mut params = BTreeMap::new();
        params.insert("category", "linear".to_string());
        params.insert("symbol", symbol.to_string());
        params.insert("orderId", order_id.to_string());
        let json = self.get_signed("/v5/execution/list", &params).await?;
        let list = json["result"]["list"].as_array().cloned().unwrap_or_default();
        let (mut total_qty, mut total_value) = (0.0, 0.0);
        for e in &list {
            let qty: f64 = e["execQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let price: f64 = e["execPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            if qty > 0.0 && price > 0.0 {
                total_qty += qty;
                total_value += qty * price;
            }
        }
        Ok((total_qty > 0.0).then_some(total_value / total_qty))
    }

    async fn get_recent_executions(&self, symbol: &str, limit: usize) -> Result<Vec<Execution>, BybitError> {
        let mut params = BTreeMap::new();
        params.insert("category", "linear".to_string());
        params.insert("symbol", symbol.to_string());
        params.insert("limit", limit.to_string());
        let json = self.get_signed("/v5/execution/list", &params).await?;
        let list = json["result"]["list"].as_array().cloned().unwrap_or_default();
        let mut execs: Vec<Execution> = list
            .iter()
            .filter_map(|e| {
                let side = match e["side"].as_str()? {
                    "Buy" => Side::Long,
                    "Sell" => Side::Short,
                    _ => return None,
                };
                Some(Execution {
                    side,
                    exec_qty: e["execQty"].as_str()?.parse().ok()?,
                    exec_price: e["execPrice"].as_str()?.parse().ok()?,
                    exec_time_ms: e["execTime"].as_str()?.parse().ok()?,
                })
            })
            .collect();
        execs.sort_by_key(|e| std::cmp::Reverse(e.exec_time_ms));
        Ok(execs)
    }
}
