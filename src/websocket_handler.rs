//! Market-data stream (C3): one WebSocket, ticker + kline subscriptions,
//! an ordered per-key candle cache, heartbeat and backoff reconnection.
//!
//! Confirmed-candle and ticker events are pushed onto an mpsc channel
//! rather than invoked via a registered-callback map (the original bot's
//! idiom): this is the idiomatic async-Rust equivalent — the controller's
//! event loop `select!`s on the receiver the same way it would dispatch a
//! callback, without needing `dyn Fn` callbacks stored behind a mutex.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::types::Candle;

const PING_INTERVAL_SECS: u64 = 20;
const CACHE_SIZE: usize = 500;
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const BACKOFF_SCHEDULE_SECS: &[u64] = &[5, 10, 20, 40, 60];

#[derive(Debug, Clone)]
pub enum MarketEvent {
    Ticker { symbol: String, price: f64 },
    ConfirmedCandle {
        symbol: String,
        interval: String,
        candle: Candle,
    },
}

pub type CandleCache = Arc<Mutex<HashMap<String, VecDeque<Candle>>>>;

fn cache_key(symbol: &str, interval: &str) -> String {
    format!("{symbol}:{interval}")
}

pub struct MarketDataStream {
    ws_url: String,
    symbols: Vec<String>,
    intervals: Vec<String>,
    cache: CandleCache,
    events_tx: mpsc::UnboundedSender<MarketEvent>,
}

impl MarketDataStream {
    pub fn new(
        ws_url: impl Into<String>,
        symbols: &[String],
        intervals: &[String],
    ) -> (Self, mpsc::UnboundedReceiver<MarketEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut cache = HashMap::new();
        for s in symbols {
            for iv in intervals {
                cache.insert(cache_key(s, iv), VecDeque::with_capacity(CACHE_SIZE));
            }
        }
        (
            MarketDataStream {
                ws_url: ws_url.into(),
                symbols: symbols.to_vec(),
                intervals: intervals.to_vec(),
                cache: Arc::new(Mutex::new(cache)),
                events_tx,
            },
            events_rx,
        )
    }

    fn subscribe_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for s in &self.symbols {
            args.push(format!("tickers.{s}"));
            for iv in &self.intervals {
                args.push(format!("kline.{iv}.{s}"));
            }
        }
        args
    }

    /// Run a single connection to completion; always returns `Err` on
    /// disconnect so the caller's `reconnect_with_backoff` loop retries.
    pub async fn connect(&self) -> Result<(), String> {
        let (ws_stream, _) = connect_async(&self.ws_url).await.map_err(|e| e.to_string())?;
        log::info!("market data stream connected to {}", self.ws_url);
        let (mut write, mut read) = ws_stream.split();

        let args = self.subscribe_args();
        let sub_msg = json!({ "op": "subscribe", "args": args });
        write
            .send(Message::Text(sub_msg.to_string()))
            .await
            .map_err(|e| e.to_string())?;
        log::info!("subscribed to {} topics", args.len());

        let mut ping_timer = interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_timer.tick().await;

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    let ping = json!({"op": "ping"}).to_string();
                    if let Err(e) = write.send(Message::Text(ping)).await {
                        return Err(format!("ping failed: {e}"));
                    }
                    log::debug!("ping sent");
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_message(&text),
                        Some(Ok(Message::Close(_))) => return Err("closed by server".into()),
                        Some(Err(e)) => return Err(e.to_string()),
                        None => return Err("stream ended".into()),
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let Ok(data) = serde_json::from_str::<serde_json::Value>(text) else {
            return;
        };
        if data["op"].as_str() == Some("pong") {
            log::debug!("pong received");
            return;
        }
        let Some(topic) = data["topic"].as_str() else {
            return;
        };
        if let Some(symbol) = topic.strip_prefix("tickers.") {
            if let Some(price) = data["data"]["lastPrice"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
            {
                let _ = self.events_tx.send(MarketEvent::Ticker {
                    symbol: symbol.to_string(),
                    price,
                });
            }
            return;
        }
        // topic format: "kline.<interval>.<symbol>"
        let mut parts = topic.splitn(3, '.');
        if parts.next() != Some("kline") {
            return;
        }
        let (Some(interval), Some(symbol)) = (parts.next(), parts.next()) else {
            return;
        };
        let Some(items) = data["data"].as_array() else {
            return;
        };
        for item in items {
            let Some(candle) = Self::parse_candle(item) else {
                continue;
            };
            let confirmed = item["confirm"].as_bool().unwrap_or(false);
            self.update_cache(symbol, interval, candle);
            if confirmed {
                let _ = self.events_tx.send(MarketEvent::ConfirmedCandle {
                    symbol: symbol.to_string(),
                    interval: interval.to_string(),
                    candle,
                });
            }
        }
    }

    fn update_cache(&self, symbol: &str, interval: &str, candle: Candle) {
        if candle.timestamp == 0 {
            return;
        }
        let key = cache_key(symbol, interval);
        let mut map = self.cache.lock().unwrap();
        let Some(buf) = map.get_mut(&key) else {
            return;
        };
        match buf.back() {
            Some(tail) if tail.timestamp == candle.timestamp => {
                *buf.back_mut().unwrap() = candle;
            }
            Some(tail) if candle.timestamp > tail.timestamp => {
                buf.push_back(candle);
                if buf.len() > CACHE_SIZE {
                    buf.pop_front();
                }
            }
            Some(_) => { /* stale, out-of-order update: discard */ }
            None => buf.push_back(candle),
        }
    }

    fn parse_candle(data: &serde_json::Value) -> Option<Candle> {
        Some(Candle {
            timestamp: data["start"].as_i64()?,
            open: data["open"].as_str()?.parse().ok()?,
            high: data["high"].as_str()?.parse().ok()?,
            low: data["low"].as_str()?.parse().ok()?,
            close: data["close"].as_str()?.parse().ok()?,
            volume: data["volume"].as_str()?.parse().ok()?,
            turnover: data["turnover"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
        })
    }

    /// Chronological (oldest-first) snapshot of up to `limit` cached candles.
    pub fn get_candles_chronological(&self, symbol: &str, interval: &str, limit: usize) -> Vec<Candle> {
        let key = cache_key(symbol, interval);
        let map = self.cache.lock().unwrap();
        let Some(buf) = map.get(&key) else {
            return Vec::new();
        };
        let start = buf.len().saturating_sub(limit);
        buf.iter().skip(start).cloned().collect()
    }

    /// Newest-first snapshot, matching the REST API's ordering convention.
    pub fn get_candles_newest_first(&self, symbol: &str, interval: &str, limit: usize) -> Vec<Candle> {
        let mut v = self.get_candles_chronological(symbol, interval, limit);
        v.reverse();
        v
    }
}

pub async fn reconnect_with_backoff(stream: &MarketDataStream) -> Result<(), String> {
    let mut attempt: u32 = 0;
    loop {
        match stream.connect().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    return Err(format!("market data stream failed after {attempt} attempts: {e}"));
                }
                let idx = (attempt as usize - 1).min(BACKOFF_SCHEDULE_SECS.len() - 1);
                let delay = BACKOFF_SCHEDULE_SECS[idx];
                log::warn!("market data stream error: {e}. reconnecting in {delay}s ({attempt}/{MAX_RECONNECT_ATTEMPTS})");
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64) -> Candle {
        Candle { timestamp: ts, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0, turnover: 1.0 }
    }

    #[test]
    fn cache_stays_sorted_and_deduplicated() {
        let (stream, _rx) = MarketDataStream::new("wss://example", &["BTCUSDT".to_string()], &["60".to_string()]);
        stream.update_cache("BTCUSDT", "60", candle(1000));
        stream.update_cache("BTCUSDT", "60", candle(1000)); // live update, same ts
        stream.update_cache("BTCUSDT", "60", candle(2000));
        stream.update_cache("BTCUSDT", "60", candle(1500)); // stale, discarded
        let snap = stream.get_candles_chronological("BTCUSDT", "60", 10);
        let timestamps: Vec<_> = snap.iter().map(|c| c.timestamp).collect();
        assert_eq!(timestamps, vec![1000, 2000]);
    }

    #[test]
    fn cache_is_bounded_by_ring_size() {
        let (stream, _rx) = MarketDataStream::new("wss://example", &["BTCUSDT".to_string()], &["60".to_string()]);
        for i in 0..(CACHE_SIZE + 10) {
            stream.update_cache("BTCUSDT", "60", candle(i as i64));
        }
        let snap = stream.get_candles_chronological("BTCUSDT", "60", CACHE_SIZE + 10);
        assert_eq!(snap.len(), CACHE_SIZE);
    }
}
