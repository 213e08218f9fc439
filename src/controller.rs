//! Trading controller (C6): the event loop fusing the market-data stream
//! with a periodic tick, orchestrating entries, partial-TP lifecycle,
//! exits, reconciliation, the circuit breaker, and persistence.
//!
//! Lock hierarchy (acquired in this order, matching the design's
//! deadlock-avoidance rule): `state` > `entry` > `price` > `journals`.
//! The kline cache lives inside `MarketDataStream` and is acquired in
//! isolation, never nested under the others.

use crate::bybit_api::{ExchangeClient, OrderResponse};
use crate::config::Config;
use crate::error::EngineError;
use crate::indicators::{ema, supertrend};
use crate::persistence::{EquityJournal, TradeJournal};
use crate::strategy::{entry_signal, exit_signal, trend_filter};
use crate::symbol_state::SymbolState;
use crate::types::{Candle, Direction, EquityPoint, Side, SideLabel, StatusSnapshot, Trade, TrendLabel};
use crate::websocket_handler::{MarketDataStream, MarketEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

const MAX_OPEN_POSITIONS: usize = 8;
const CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_BREAKER_PAUSE_SECS: i64 = 300;
const ENTRY_COOLDOWN_SECS: i64 = 3600;
const TP_MANUAL_SCAN_WINDOW_SECS: i64 = 300;
const TICKER_EXIT_TRIGGER_PCT: f64 = 0.5;
const KLINE_LIMIT: usize = 300;

/// Injectable wall clock, so cooldown logic can be driven by a fixed value
/// in tests without sleeping real time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

struct CircuitBreaker {
    consecutive_failures: u32,
    until_ms: Option<i64>,
}

impl CircuitBreaker {
    fn new() -> Self {
        CircuitBreaker {
            consecutive_failures: 0,
            until_ms: None,
        }
    }

    fn is_active(&self, now_ms: i64) -> bool {
        self.until_ms.map(|u| now_ms < u).unwrap_or(false)
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.until_ms = None;
    }

    fn record_failure(&mut self, now_ms: i64) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= CIRCUIT_BREAKER_FAILURE_THRESHOLD {
            log::error!(
                "circuit breaker tripped after {} consecutive failures",
                self.consecutive_failures
            );
            self.until_ms = Some(now_ms + CIRCUIT_BREAKER_PAUSE_SECS * 1000);
        }
    }
}

pub struct TradingController<C: ExchangeClient> {
    config: Config,
    exchange: Arc<C>,
    stream: Arc<MarketDataStream>,
    clock: Arc<dyn Clock>,

    state: AsyncMutex<HashMap<String, SymbolState>>,
    entry_lock: AsyncMutex<()>,
    price: std::sync::Mutex<HashMap<String, f64>>,
    equity_journal: AsyncMutex<EquityJournal>,
    trade_journal: AsyncMutex<TradeJournal>,
    breaker: AsyncMutex<CircuitBreaker>,
    background_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    running: std::sync::atomic::AtomicBool,
}

impl<C: ExchangeClient + 'static> TradingController<C> {
    pub fn new(
        config: Config,
        exchange: Arc<C>,
        stream: Arc<MarketDataStream>,
        data_dir: &std::path::Path,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut state = HashMap::new();
        for s in &config.symbols {
            state.insert(s.clone(), SymbolState::new(s.clone()));
        }
        TradingController {
            exchange,
            stream,
            clock,
            state: AsyncMutex::new(state),
            entry_lock: AsyncMutex::new(()),
            price: std::sync::Mutex::new(HashMap::new()),
            equity_journal: AsyncMutex::new(EquityJournal::load(data_dir)),
            trade_journal: AsyncMutex::new(TradeJournal::load(data_dir)),
            breaker: AsyncMutex::new(CircuitBreaker::new()),
            background_tasks: std::sync::Mutex::new(Vec::new()),
            running: std::sync::atomic::AtomicBool::new(false),
            config,
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    pub async fn start(&self) -> Result<(), EngineError> {
        self.running.store(true, std::sync::atomic::Ordering::SeqCst);

        for symbol in &self.config.symbols {
            self.record_outcome(self.exchange.set_leverage(symbol, self.config.leverage).await)
                .await;
            self.record_outcome(
                self.exchange
                    .set_margin_mode(symbol, &self.config.margin_mode)
                    .await,
            )
            .await;
        }

        self.reconcile_all().await;
        self.refresh_equity(false).await;

        log::info!("controller started for {} symbols", self.config.symbols.len());
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
        let handles: Vec<_> = {
            let mut tasks = self.background_tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for h in handles {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), h).await;
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }

    // ── Event dispatch ───────────────────────────────────────────────────────

    /// Drains market-data events; drive this from a task spawned alongside
    /// `reconnect_with_backoff`.
    pub async fn handle_event(&self, event: MarketEvent) {
        match event {
            MarketEvent::Ticker { symbol, price } => self.handle_ticker(&symbol, price).await,
            MarketEvent::ConfirmedCandle { symbol, interval, candle } => {
                if interval == "60" {
                    self.handle_confirmed_1h_candle(&symbol, candle).await;
                } else if interval == "240" {
                    self.handle_confirmed_4h_candle(&symbol, candle).await;
                }
            }
        }
    }

    async fn handle_ticker(&self, symbol: &str, price: f64) {
        {
            let mut map = self.price.lock().unwrap();
            map.insert(symbol.to_string(), price);
        }
        // Price-triggered extra exit check: a sharp intrabar move is not
        // left unhandled until the next periodic tick.
        let entry_price = {
            let state = self.state.lock().await;
            state.get(symbol).and_then(|s| s.position.entry_price)
        };
        if let Some(entry) = entry_price {
            if entry > 0.0 {
                let move_pct = ((price - entry) / entry).abs() * 100.0;
                if move_pct > TICKER_EXIT_TRIGGER_PCT {
                    self.check_exit(symbol).await;
                }
            }
        }
    }

    async fn handle_confirmed_1h_candle(&self, symbol: &str, candle: Candle) {
        {
            let mut state = self.state.lock().await;
            let Some(s) = state.get_mut(symbol) else { return };
            if s.is_watermark_stale("60", candle.timestamp) {
                return;
            }
            s.advance_watermark("60", candle.timestamp);
        }
        self.refresh_1h_signal(symbol).await;
        self.try_enter(symbol).await;
    }

    async fn handle_confirmed_4h_candle(&self, symbol: &str, candle: Candle) {
        {
            let mut state = self.state.lock().await;
            let Some(s) = state.get_mut(symbol) else { return };
            if s.is_watermark_stale("240", candle.timestamp) {
                return;
            }
            s.advance_watermark("240", candle.timestamp);
        }
        self.refresh_4h_trend(symbol).await;
        self.check_exit(symbol).await;
    }

    // ── Periodic loop ────────────────────────────────────────────────────────

    pub async fn run_periodic_loop(&self) {
        let mut iteration: u64 = 0;
        let interval = std::time::Duration::from_secs(self.config.check_interval_seconds);
        while self.is_running() {
            tokio::time::sleep(interval).await;
            iteration += 1;
            self.periodic_tick(iteration).await;
        }
    }

    async fn periodic_tick(&self, iteration: u64) {
        let now = self.clock.now_ms();
        if self.breaker.lock().await.is_active(now) {
            log::warn!("circuit breaker active, skipping periodic tick");
            return;
        }
        if iteration % 10 == 0 {
            self.refresh_equity(false).await;
        }
        for symbol in self.config.symbols.clone() {
            self.reconcile_position(&symbol).await;
            let stale = {
                let state = self.state.lock().await;
                match state.get(&symbol).and_then(|s| s.indicators.last_4h_update) {
                    None => true,
                    Some(last) => {
                        now - last >= self.config.update_4h_interval_hours * 3600 * 1000
                    }
                }
            };
            if stale {
                self.refresh_4h_trend(&symbol).await;
            }
            self.refresh_1h_signal(&symbol).await;
            let has_position = {
                let state = self.state.lock().await;
                state.get(&symbol).map(|s| s.has_position()).unwrap_or(false)
            };
            if has_position {
                self.check_partial_tp(&symbol).await;
                self.check_exit(&symbol).await;
            }
        }
    }

    // ── Indicator refresh ────────────────────────────────────────────────────

    async fn refresh_4h_trend(&self, symbol: &str) {
        let candles = self.stream.get_candles_chronological(symbol, "240", KLINE_LIMIT);
        let candles = if candles.len() < self.config.ema_period_4h {
            match self.exchange.get_klines(symbol, "240", KLINE_LIMIT).await {
                Ok(mut c) => {
                    c.sort_by_key(|c| c.timestamp);
                    c
                }
                Err(e) => {
                    self.record_failure(e).await;
                    return;
                }
            }
        } else {
            candles
        };
        if candles.len() < self.config.ema_period_4h.max(self.config.st_period_4h + 1) {
            return;
        }
        let Ok(ema200) = ema(&candles, self.config.ema_period_4h) else { return };
        let Ok(st) = supertrend(&candles, self.config.st_period_4h, self.config.st_multiplier_4h) else { return };
        let Some(last) = st.last() else { return };
        let close = candles.last().unwrap().close;
        let trend = trend_filter(close, ema200, last.direction);

        let mut state = self.state.lock().await;
        if let Some(s) = state.get_mut(symbol) {
            s.update_trend_4h(trend, ema200, last.value, last.direction, self.clock.now_ms());
        }
    }

    async fn refresh_1h_signal(&self, symbol: &str) {
        let candles = match self.exchange.get_klines(symbol, "60", KLINE_LIMIT).await {
            Ok(mut c) => {
                c.sort_by_key(|c| c.timestamp);
                c
            }
            Err(e) => {
                self.record_failure(e).await;
                return;
            }
        };
        if candles.len() < self.config.st_period_1h + 1 {
            return;
        }
        let Ok(st) = supertrend(&candles, self.config.st_period_1h, self.config.st_multiplier_1h) else { return };
        let Some(last) = st.last() else { return };

        let mut state = self.state.lock().await;
        if let Some(s) = state.get_mut(symbol) {
            s.update_1h_signal(last.value, last.direction);
        }
        self.record_success().await;
    }

    // ── Entry path ───────────────────────────────────────────────────────────

    async fn try_enter(&self, symbol: &str) {
        let now = self.clock.now_ms();
        if self.breaker.lock().await.is_active(now) {
            return;
        }
        if !self.config.trading_enabled {
            return;
        }

        let (side, total_open) = {
            let state = self.state.lock().await;
            let Some(s) = state.get(symbol) else { return };
            if s.has_position() {
                return;
            }
            let (Some(trend), Some(st_1h_dir)) = (s.indicators.trend_4h, s.indicators.st_1h_dir) else {
                return;
            };
            let side = entry_signal(trend, st_1h_dir);
            let total_open = state.values().filter(|s| s.has_position()).count();
            (side, total_open)
        };
        if side == Side::None || total_open >= MAX_OPEN_POSITIONS {
            return;
        }

        let required_margin = 1.5 * self.config.position_size_usdt / self.config.leverage as f64;
        let available = match self.exchange.get_wallet_balance().await {
            Ok(Some(b)) => b,
            Ok(None) => return,
            Err(e) => {
                self.record_failure(e).await;
                return;
            }
        };
        if available < required_margin {
            log::warn!("{symbol}: insufficient balance for entry ({available} < {required_margin})");
            return;
        }

        let _entry_guard = self.entry_lock.lock().await;
        {
            let state = self.state.lock().await;
            if state.get(symbol).map(|s| s.has_position()).unwrap_or(true) {
                return;
            }
        }
        let available = match self.exchange.get_wallet_balance().await {
            Ok(Some(b)) => b,
            Ok(None) => return,
            Err(e) => {
                self.record_failure(e).await;
                return;
            }
        };
        if available < required_margin {
            log::warn!("{symbol}: insufficient balance for entry ({available} < {required_margin})");
            return;
        }

        let price = match self.exchange.get_ticker(symbol).await {
            Ok(Some(t)) => t.last_price,
            _ => return,
        };
        let qty = match self
            .exchange
            .calculate_qty(symbol, self.config.position_size_usdt, price)
            .await
        {
            Ok(q) if q > 0.0 => q,
            _ => return,
        };

        let venue_side = side.venue_side();
        match self.exchange.place_order(symbol, venue_side, qty, false, None).await {
            Ok(o) if o.ret_code == 0 => {}
            Ok(o) => {
                log::warn!("{symbol}: entry order rejected: {}", o.ret_msg);
                return;
            }
            Err(e) => {
                self.record_failure(e).await;
                return;
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let remote = match self.exchange.get_position(symbol).await {
            Ok(Some(p)) if p.size > 0.0 && p.avg_price > 0.0 => p,
            _ => {
                log::error!("{symbol}: could not confirm position after entry order");
                return;
            }
        };

        {
            let mut state = self.state.lock().await;
            if let Some(s) = state.get_mut(symbol) {
                s.open_position(remote.side, remote.size, remote.avg_price, self.clock.now_ms());
            }
        }
        self.record_success().await;
        log::info!("{symbol}: entered {side:?} size={} @ {}", remote.size, remote.avg_price);
        self.place_partial_tp(symbol).await;
        self.refresh_equity(true).await;
    }

    // ── Partial take-profit ──────────────────────────────────────────────────

    /// Pure target-profit computation, kept free-standing so it is unit
    /// testable against the numeric reference scenario directly.
    pub fn tp_target_profit(position_size_usdt: f64, leverage: f64) -> f64 {
        position_size_usdt / leverage + (position_size_usdt * 0.5) * 0.002
    }

    pub fn tp_target_price(side: Side, entry: f64, q_partial: f64, target_profit: f64) -> Option<f64> {
        if q_partial <= 0.0 {
            return None;
        }
        let mut t = target_profit;
        let delta = t / q_partial;
        let raw = match side {
            Side::Long => entry + delta,
            Side::Short => {
                let max_t = 0.95 * entry * q_partial;
                if t > max_t {
                    t = max_t;
                }
                entry - t / q_partial
            }
            Side::None => return None,
        };
        let distance_pct = ((raw - entry) / entry).abs();
        if distance_pct < 0.001 || distance_pct > 0.5 {
            return None;
        }
        Some(raw)
    }

    async fn place_partial_tp(&self, symbol: &str) {
        let (side, size, entry, already_done, existing_id) = {
            let state = self.state.lock().await;
            let Some(s) = state.get(symbol) else { return };
            (
                s.position.side,
                s.position.size,
                s.position.entry_price,
                s.position.partial_tp_done,
                s.tp_limit_order_id.clone(),
            )
        };
        if already_done || existing_id.is_some() || side == Side::None {
            return;
        }
        let Some(entry) = entry else { return };

        let instrument = match self.exchange.get_instrument(symbol).await {
            Ok(Some(i)) => i,
            _ => return,
        };
        let q_partial_raw = 0.5 * size;
        let q_partial = (q_partial_raw / instrument.lot_step).floor() * instrument.lot_step;
        if q_partial <= 0.0 {
            return;
        }
        let t = Self::tp_target_profit(self.config.position_size_usdt, self.config.leverage as f64);
        let Some(raw_price) = Self::tp_target_price(side, entry, q_partial, t) else {
            log::warn!("{symbol}: computed TP target outside validity bounds");
            return;
        };
        let price = (raw_price / instrument.tick_size).round() * instrument.tick_size;
        let price = price.clamp(instrument.min_price, instrument.max_price);

        let tp_side = side.opposite_venue_side();
        match self.exchange.place_order(symbol, tp_side, q_partial, true, Some(price)).await {
            Ok(o) if o.ret_code == 0 => {
                let mut state = self.state.lock().await;
                if let Some(s) = state.get_mut(symbol) {
                    s.tp_limit_order_id = o.order_id;
                }
                log::info!("{symbol}: placed partial TP at {price}, qty={q_partial}");
            }
            Ok(o) => log::warn!("{symbol}: TP order rejected: {}", o.ret_msg),
            Err(e) => self.record_failure(e).await,
        }
    }

    async fn check_partial_tp(&self, symbol: &str) {
        let tp_id = {
            let state = self.state.lock().await;
            state.get(symbol).and_then(|s| s.tp_limit_order_id.clone())
        };
        let Some(tp_id) = tp_id else {
            let done = {
                let state = self.state.lock().await;
                state.get(symbol).map(|s| s.position.partial_tp_done).unwrap_or(true)
            };
            if !done {
                self.place_partial_tp(symbol).await;
            }
            return;
        };

        let open_orders = match self.exchange.get_open_orders(Some(symbol)).await {
            Ok(ids) => ids,
            Err(e) => {
                self.record_failure(e).await;
                return;
            }
        };
        if open_orders.iter().any(|id| id == &tp_id) {
            return; // still resting
        }

        let remote = match self.exchange.get_position(symbol).await {
            Ok(p) => p,
            Err(e) => {
                self.record_failure(e).await;
                return;
            }
        };
        let (local_size, local_side, entry) = {
            let state = self.state.lock().await;
            let Some(s) = state.get(symbol) else { return };
            (s.position.size, s.position.side, s.position.entry_price)
        };
        if local_size <= 0.0 {
            return;
        }
        let remote_size = remote.map(|p| p.size).unwrap_or(0.0);
        let ratio = remote_size / local_size;

        if ratio < 0.6 {
            let Some(entry_price) = entry else { return };
            let qty_closed = local_size - remote_size;
            let target_profit =
                Self::tp_target_profit(self.config.position_size_usdt, self.config.leverage as f64);
            let fallback_price = Self::tp_target_price(local_side, entry_price, qty_closed, target_profit)
                .unwrap_or(entry_price);
            let exec_price = self
                .exchange
                .get_order_execution_price(symbol, &tp_id)
                .await
                .ok()
                .flatten()
                .unwrap_or(fallback_price);
            self.record_partial_fill(symbol, local_side, entry, exec_price, qty_closed, remote_size)
                .await;
        } else if ratio >= 0.95 {
            let mut state = self.state.lock().await;
            if let Some(s) = state.get_mut(symbol) {
                s.tp_limit_order_id = None;
            }
        } else if (0.45..=0.55).contains(&ratio) {
            let qty_closed = local_size - remote_size;
            let now = self.clock.now_ms();
            let exec_price = self
                .find_recent_opposite_fill(symbol, local_side, now)
                .await
                .unwrap_or_else(|| entry.unwrap_or(0.0));
            self.record_partial_fill(symbol, local_side, entry, exec_price, qty_closed, remote_size)
                .await;
        } else {
            log::warn!("{symbol}: unexpected position mutation while TP resting (ratio={ratio})");
            let mut state = self.state.lock().await;
            if let Some(s) = state.get_mut(symbol) {
                s.tp_limit_order_id = None;
            }
        }
    }

    async fn find_recent_opposite_fill(&self, symbol: &str, side: Side, now_ms: i64) -> Option<f64> {
        let execs = self.exchange.get_recent_executions(symbol, 50).await.ok()?;
        let exit_side = match side {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
            Side::None => return None,
        };
        execs
            .into_iter()
            .find(|e| e.side == exit_side && now_ms - e.exec_time_ms <= TP_MANUAL_SCAN_WINDOW_SECS * 1000)
            .map(|e| e.exec_price)
    }

    async fn record_partial_fill(
        &self,
        symbol: &str,
        side: Side,
        entry: Option<f64>,
        exec_price: f64,
        qty_closed: f64,
        remaining_size: f64,
    ) {
        let Some(entry) = entry else { return };
        let pnl = match side {
            Side::Long => (exec_price - entry) * qty_closed,
            Side::Short => (entry - exec_price) * qty_closed,
            Side::None => 0.0,
        };
        let pnl_percent = if entry != 0.0 { pnl / (entry * qty_closed) * 100.0 } else { 0.0 };
        let now = self.clock.now_ms();
        let trade = Trade {
            symbol: symbol.to_string(),
            side: SideLabel::from(side),
            entry_price: entry,
            exit_price: exec_price,
            size: qty_closed,
            pnl,
            pnl_percent,
            entry_time: now,
            exit_time: now,
            is_partial: true,
        };
        {
            let mut journal = self.trade_journal.lock().await;
            let _ = journal.append(trade);
        }
        {
            let mut state = self.state.lock().await;
            if let Some(s) = state.get_mut(symbol) {
                s.position.size = remaining_size;
                s.position.partial_tp_done = true;
                s.tp_limit_order_id = None;
            }
        }
        log::info!("{symbol}: partial TP executed, size now {remaining_size}");
        self.refresh_equity(true).await;
    }

    // ── Exit path ────────────────────────────────────────────────────────────

    async fn check_exit(&self, symbol: &str) {
        let now = self.clock.now_ms();
        let (side, st_4h_dir, st_4h_prev_dir, entry_time) = {
            let state = self.state.lock().await;
            let Some(s) = state.get(symbol) else { return };
            if !s.has_position() {
                return;
            }
            let (Some(dir), prev) = (s.indicators.st_4h_dir, s.indicators.st_4h_prev_dir) else {
                return;
            };
            (s.position.side, dir, prev, s.position.entry_time)
        };

        if !exit_signal(side, st_4h_dir, st_4h_prev_dir) {
            return;
        }

        if let Some(entry_time) = entry_time {
            if now - entry_time < ENTRY_COOLDOWN_SECS * 1000 {
                let opposite_strong = match side {
                    Side::Long => st_4h_dir == Direction::Red,
                    Side::Short => st_4h_dir == Direction::Green,
                    Side::None => false,
                };
                let genuine_flip = match (side, st_4h_prev_dir) {
                    (Side::Long, Some(Direction::Green)) => st_4h_dir == Direction::Red,
                    (Side::Short, Some(Direction::Red)) => st_4h_dir == Direction::Green,
                    _ => false,
                };
                if !opposite_strong && !genuine_flip {
                    return;
                }
            }
        }

        self.execute_exit(symbol, side).await;
    }

    async fn execute_exit(&self, symbol: &str, side: Side) {
        let tp_id = {
            let state = self.state.lock().await;
            state.get(symbol).and_then(|s| s.tp_limit_order_id.clone())
        };
        if let Some(id) = tp_id {
            let _ = self.exchange.cancel_order(symbol, Some(&id)).await;
        }
        {
            let mut state = self.state.lock().await;
            if let Some(s) = state.get_mut(symbol) {
                s.tp_limit_order_id = None;
            }
        }

        let price = match self.exchange.get_ticker(symbol).await {
            Ok(Some(t)) => t.last_price,
            _ => return,
        };
        let (size, entry) = {
            let state = self.state.lock().await;
            let Some(s) = state.get(symbol) else { return };
            (s.position.size, s.position.entry_price)
        };
        let Some(entry) = entry else { return };

        let order_side = side.opposite_venue_side();
        let result: Result<OrderResponse, _> =
            self.exchange.place_order(symbol, order_side, size, true, None).await;
        match result {
            Ok(o) if o.ret_code == 0 => {}
            Ok(o) => {
                log::warn!("{symbol}: exit order rejected: {}", o.ret_msg);
                return;
            }
            Err(e) => {
                self.record_failure(e).await;
                return;
            }
        }

        let pnl = match side {
            Side::Long => (price - entry) * size,
            Side::Short => (entry - price) * size,
            Side::None => 0.0,
        };
        let pnl_percent = if entry != 0.0 { pnl / (entry * size) * 100.0 } else { 0.0 };
        let now = self.clock.now_ms();
        let entry_time = {
            let state = self.state.lock().await;
            state.get(symbol).and_then(|s| s.position.entry_time).unwrap_or(now)
        };
        let trade = Trade {
            symbol: symbol.to_string(),
            side: SideLabel::from(side),
            entry_price: entry,
            exit_price: price,
            size,
            pnl,
            pnl_percent,
            entry_time,
            exit_time: now,
            is_partial: false,
        };
        {
            let mut journal = self.trade_journal.lock().await;
            let _ = journal.append(trade);
        }
        {
            let mut state = self.state.lock().await;
            if let Some(s) = state.get_mut(symbol) {
                s.close_position(price, Some(pnl));
            }
        }
        self.record_success().await;
        log::info!("{symbol}: exited {side:?} @ {price}, pnl={pnl}");
        self.refresh_equity(true).await;
    }

    // ── Reconciliation ───────────────────────────────────────────────────────

    async fn reconcile_all(&self) {
        for symbol in self.config.symbols.clone() {
            self.reconcile_position(&symbol).await;
        }
    }

    async fn reconcile_position(&self, symbol: &str) {
        let remote = match self.exchange.get_position(symbol).await {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(e).await;
                return;
            }
        };
        self.record_success().await;

        let needs_tp_lookup = remote.is_some() && {
            let state = self.state.lock().await;
            state
                .get(symbol)
                .map(|s| s.tp_limit_order_id.is_none() && !s.position.partial_tp_done)
                .unwrap_or(false)
        };
        let adopted_tp_id = if needs_tp_lookup {
            match self.exchange.get_open_orders(Some(symbol)).await {
                Ok(ids) => ids.into_iter().next(),
                Err(e) => {
                    self.record_failure(e).await;
                    None
                }
            }
        } else {
            None
        };

        let mut state = self.state.lock().await;
        let Some(s) = state.get_mut(symbol) else { return };
        match remote {
            Some(r) => {
                let drift = !s.has_position()
                    || s.position.side != r.side
                    || (s.position.size - r.size).abs() > 0.0001;
                if drift {
                    if s.has_position() {
                        log::warn!(
                            "{symbol}: reconciliation drift, adopting remote side={:?} size={}",
                            r.side,
                            r.size
                        );
                    }
                    let entry_time = s.position.entry_time.unwrap_or_else(|| self.clock.now_ms());
                    s.position.side = r.side;
                    s.position.size = r.size;
                    s.position.entry_price = Some(r.avg_price);
                    s.position.entry_time = Some(entry_time);
                }
                if let Some(id) = adopted_tp_id {
                    if s.tp_limit_order_id.is_none() {
                        log::info!("{symbol}: adopted existing resting TP order {id}");
                        s.tp_limit_order_id = Some(id);
                    }
                }
            }
            None => {
                if s.has_position() {
                    log::warn!("{symbol}: remote position vanished, resetting local state");
                    s.reset_position();
                }
            }
        }
    }

    // ── Equity / circuit breaker bookkeeping ─────────────────────────────────

    async fn refresh_equity(&self, force: bool) {
        let any_open = {
            let state = self.state.lock().await;
            state.values().any(|s| s.has_position())
        };
        let value = if !any_open {
            match self.exchange.get_total_equity().await {
                Ok(Some(v)) => v,
                _ => return,
            }
        } else {
            let available = match self.exchange.get_wallet_balance().await {
                Ok(Some(v)) => v,
                _ => return,
            };
            let prices = self.price.lock().unwrap().clone();
            let state = self.state.lock().await;
            let unrealized: f64 = state
                .values()
                .filter_map(|s| {
                    prices
                        .get(&s.symbol)
                        .and_then(|p| s.position.unrealized_pnl(*p))
                })
                .sum();
            available + unrealized
        };
        let point = EquityPoint {
            timestamp: self.clock.now_ms(),
            value,
        };
        let mut journal = self.equity_journal.lock().await;
        let _ = journal.maybe_append(point, force);
    }

    async fn record_outcome<T>(&self, result: Result<T, crate::bybit_api::BybitError>) {
        match result {
            Ok(_) => self.record_success().await,
            Err(e) => self.record_failure(e).await,
        }
    }

    async fn record_success(&self) {
        self.breaker.lock().await.record_success();
    }

    async fn record_failure(&self, err: crate::bybit_api::BybitError) {
        log::error!("adapter call failed: {err}");
        self.breaker.lock().await.record_failure(self.clock.now_ms());
    }

    // ── Status snapshot ──────────────────────────────────────────────────────

    pub async fn status_snapshot(&self) -> Vec<StatusSnapshot> {
        let prices = self.price.lock().unwrap().clone();
        let state = self.state.lock().await;
        state
            .values()
            .map(|s| {
                let price = prices.get(&s.symbol).copied();
                StatusSnapshot {
                    symbol: s.symbol.clone(),
                    side: s.has_position().then(|| SideLabel::from(s.position.side)),
                    size: s.position.size,
                    entry_price: s.position.entry_price,
                    unrealized_pnl: price.and_then(|p| s.position.unrealized_pnl(p)),
                    unrealized_pnl_percent: price.and_then(|p| s.position.unrealized_pnl_percent(p)),
                    trend_4h: s
                        .indicators
                        .trend_4h
                        .map(TrendLabel::from)
                        .unwrap_or(TrendLabel::Neutral),
                    total_trades: s.stats.total_trades,
                    winning_trades: s.stats.winning_trades,
                    total_pnl: s.stats.total_pnl,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tp_target_profit_matches_reference_example() {
        let t = TradingController::<crate::bybit_api::BybitClient>::tp_target_profit(100.0, 20.0);
        assert!((t - 5.1).abs() < 1e-9);
    }

    #[test]
    fn tp_target_price_long_within_validity_bounds() {
        let entry = 50000.0;
        let q_partial = 100.0 / 20.0 / entry / 2.0 * entry; // placeholder not used directly
        let _ = q_partial;
        let qty = 0.001; // arbitrary small slice
        let t = TradingController::<crate::bybit_api::BybitClient>::tp_target_profit(100.0, 20.0);
        let target = TradingController::<crate::bybit_api::BybitClient>::tp_target_price(
            Side::Long, entry, qty, t,
        );
        assert!(target.is_some());
        let target = target.unwrap();
        assert!(target > entry);
        let distance_pct = (target - entry) / entry;
        assert!(distance_pct >= 0.001 && distance_pct <= 0.5);
    }

    #[test]
    fn tp_target_price_short_moves_below_entry_within_bounds() {
        let entry = 50000.0;
        let qty = 0.02;
        let t = TradingController::<crate::bybit_api::BybitClient>::tp_target_profit(100.0, 20.0);
        let target = TradingController::<crate::bybit_api::BybitClient>::tp_target_price(
            Side::Short, entry, qty, t,
        );
        let target = target.expect("target within validity bounds");
        assert!(target < entry);
        assert!((entry - target) / entry <= 0.5);
    }

    #[test]
    fn tp_target_price_short_clamp_keeps_result_inside_validity_band() {
        // A tiny slice pushes the unclamped target far from entry; the 0.95x
        // achievable-profit clamp and the 50% validity band interact, but the
        // function must never panic and must respect the band when it returns Some.
        let entry = 50000.0;
        let qty = 0.00005;
        let t = TradingController::<crate::bybit_api::BybitClient>::tp_target_profit(100.0, 20.0);
        let target = TradingController::<crate::bybit_api::BybitClient>::tp_target_price(
            Side::Short, entry, qty, t,
        );
        if let Some(target) = target {
            assert!(target < entry);
            assert!((entry - target) / entry <= 0.5);
        }
    }

    #[test]
    fn tp_target_price_rejects_target_too_close_to_entry() {
        let target = TradingController::<crate::bybit_api::BybitClient>::tp_target_price(
            Side::Long, 50000.0, 1_000_000.0, 0.000001,
        );
        assert!(target.is_none());
    }

    #[test]
    fn circuit_breaker_trips_after_threshold_and_resets_on_success() {
        let mut cb = CircuitBreaker::new();
        for _ in 0..4 {
            cb.record_failure(0);
        }
        assert!(!cb.is_active(0));
        cb.record_failure(0);
        assert!(cb.is_active(0));
        assert!(cb.is_active(CIRCUIT_BREAKER_PAUSE_SECS * 1000 - 1));
        assert!(!cb.is_active(CIRCUIT_BREAKER_PAUSE_SECS * 1000 + 1));
        cb.record_success();
        assert_eq!(cb.consecutive_failures, 0);
    }
}
