//! Per-symbol state: indicator snapshot, position snapshot, TP bookkeeping,
//! processed-candle watermarks and running PnL stats. Mutation only through
//! methods; the controller is the sole owner of these records.

use crate::types::{Direction, Side, Trend};

#[derive(Clone, Copy, Debug, Default)]
pub struct IndicatorSnapshot {
    pub trend_4h: Option<Trend>,
    pub ema200_4h: Option<f64>,
    pub st_4h_value: Option<f64>,
    pub st_4h_dir: Option<Direction>,
    pub st_4h_prev_dir: Option<Direction>,
    pub st_1h_value: Option<f64>,
    pub st_1h_dir: Option<Direction>,
    pub st_1h_prev_dir: Option<Direction>,
    pub last_4h_update: Option<i64>,
}

#[derive(Clone, Copy, Debug)]
pub struct PositionSnapshot {
    pub side: Side,
    pub size: f64,
    pub entry_price: Option<f64>,
    pub entry_time: Option<i64>,
    pub partial_tp_done: bool,
}

impl Default for PositionSnapshot {
    fn default() -> Self {
        PositionSnapshot {
            side: Side::None,
            size: 0.0,
            entry_price: None,
            entry_time: None,
            partial_tp_done: false,
        }
    }
}

impl PositionSnapshot {
    pub fn has_position(&self) -> bool {
        self.side != Side::None
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> Option<f64> {
        let entry = self.entry_price?;
        match self.side {
            Side::Long => Some((current_price - entry) * self.size),
            Side::Short => Some((entry - current_price) * self.size),
            Side::None => None,
        }
    }

    pub fn unrealized_pnl_percent(&self, current_price: f64) -> Option<f64> {
        let entry = self.entry_price?;
        if entry == 0.0 {
            return None;
        }
        let pnl = self.unrealized_pnl(current_price)?;
        let margin = entry * self.size;
        if margin == 0.0 {
            return None;
        }
        Some(pnl / margin * 100.0)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SymbolStats {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub total_pnl: f64,
}

#[derive(Clone, Debug)]
pub struct SymbolState {
    pub symbol: String,
    pub indicators: IndicatorSnapshot,
    pub position: PositionSnapshot,
    pub tp_limit_order_id: Option<String>,
    pub stats: SymbolStats,
    watermark_1h: i64,
    watermark_4h: i64,
}

impl SymbolState {
    pub fn new(symbol: impl Into<String>) -> Self {
        SymbolState {
            symbol: symbol.into(),
            indicators: IndicatorSnapshot::default(),
            position: PositionSnapshot::default(),
            tp_limit_order_id: None,
            stats: SymbolStats::default(),
            watermark_1h: i64::MIN,
            watermark_4h: i64::MIN,
        }
    }

    pub fn has_position(&self) -> bool {
        self.position.has_position()
    }

    /// Cold-start-safe update: `prev_dir` is set to `current_dir` before
    /// overwriting with `new_dir` on subsequent calls, but on the very
    /// first call `prev_dir` is seeded equal to `new_dir` so flip
    /// detection cannot fire spuriously.
    pub fn update_trend_4h(
        &mut self,
        trend: Trend,
        ema200: f64,
        st_value: f64,
        st_dir: Direction,
        now_ms: i64,
    ) {
        let i = &mut self.indicators;
        i.st_4h_prev_dir = Some(i.st_4h_dir.unwrap_or(st_dir));
        i.trend_4h = Some(trend);
        i.ema200_4h = Some(ema200);
        i.st_4h_value = Some(st_value);
        i.st_4h_dir = Some(st_dir);
        i.last_4h_update = Some(now_ms);
    }

    /// No cold-start guard: `prev_dir` legitimately stays `None` until the
    /// second call, since the 1H signal is informational/entry-driving but
    /// not subject to flip-based exit logic.
    pub fn update_1h_signal(&mut self, st_value: f64, st_dir: Direction) {
        let i = &mut self.indicators;
        i.st_1h_prev_dir = i.st_1h_dir;
        i.st_1h_value = Some(st_value);
        i.st_1h_dir = Some(st_dir);
    }

    pub fn is_watermark_stale(&self, interval: &str, ts_ms: i64) -> bool {
        let wm = match interval {
            "60" => self.watermark_1h,
            "240" => self.watermark_4h,
            _ => return false,
        };
        ts_ms <= wm
    }

    pub fn advance_watermark(&mut self, interval: &str, ts_ms: i64) {
        match interval {
            "60" => self.watermark_1h = self.watermark_1h.max(ts_ms),
            "240" => self.watermark_4h = self.watermark_4h.max(ts_ms),
            _ => {}
        }
    }

    pub fn open_position(&mut self, side: Side, size: f64, price: f64, now_ms: i64) {
        self.position = PositionSnapshot {
            side,
            size,
            entry_price: Some(price),
            entry_time: Some(now_ms),
            partial_tp_done: false,
        };
        self.tp_limit_order_id = None;
    }

    pub fn close_position(&mut self, _exit_price: f64, pnl: Option<f64>) {
        if let Some(p) = pnl {
            self.stats.total_trades += 1;
            if p > 0.0 {
                self.stats.winning_trades += 1;
            }
            self.stats.total_pnl += p;
        }
        self.reset_position();
    }

    pub fn reset_position(&mut self) {
        self.position = PositionSnapshot::default();
        self.tp_limit_order_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_start_seeds_prev_dir_equal_to_current() {
        let mut s = SymbolState::new("BTCUSDT");
        s.update_trend_4h(Trend::Bullish, 100.0, 101.0, Direction::Green, 1000);
        assert_eq!(s.indicators.st_4h_prev_dir, Some(Direction::Green));
        assert_eq!(s.indicators.st_4h_dir, Some(Direction::Green));
    }

    #[test]
    fn subsequent_update_carries_previous_direction_forward() {
        let mut s = SymbolState::new("BTCUSDT");
        s.update_trend_4h(Trend::Bullish, 100.0, 101.0, Direction::Green, 1000);
        s.update_trend_4h(Trend::Bearish, 100.0, 99.0, Direction::Red, 2000);
        assert_eq!(s.indicators.st_4h_prev_dir, Some(Direction::Green));
        assert_eq!(s.indicators.st_4h_dir, Some(Direction::Red));
    }

    #[test]
    fn update_1h_signal_has_no_cold_start_guard() {
        let mut s = SymbolState::new("BTCUSDT");
        s.update_1h_signal(101.0, Direction::Green);
        assert_eq!(s.indicators.st_1h_prev_dir, None);
        s.update_1h_signal(99.0, Direction::Red);
        assert_eq!(s.indicators.st_1h_prev_dir, Some(Direction::Green));
    }

    #[test]
    fn close_position_resets_and_updates_stats_exactly_once() {
        let mut s = SymbolState::new("BTCUSDT");
        s.open_position(Side::Long, 1.0, 50000.0, 1000);
        s.tp_limit_order_id = Some("abc".into());
        s.close_position(51000.0, Some(1000.0));
        assert!(!s.has_position());
        assert!(!s.position.partial_tp_done);
        assert_eq!(s.stats.total_trades, 1);
        assert_eq!(s.stats.winning_trades, 1);
        assert!(s.tp_limit_order_id.is_none());
    }

    #[test]
    fn watermark_dedupes_repeated_confirmed_candle() {
        let mut s = SymbolState::new("BTCUSDT");
        assert!(!s.is_watermark_stale("60", 1000));
        s.advance_watermark("60", 1000);
        assert!(s.is_watermark_stale("60", 1000));
        assert!(!s.is_watermark_stale("60", 2000));
    }
}
