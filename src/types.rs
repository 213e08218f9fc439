use serde::{Deserialize, Serialize};

/// OHLCV bar for one interval. Cache invariant: per (symbol, interval) the
/// cache is strictly monotone in `timestamp`; the tail may be replaced in
/// place when a live update shares the same `timestamp`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
    None,
}

impl Side {
    /// Internal side mapped to the venue's buy/sell vocabulary.
    pub fn venue_side(self) -> &'static str {
        match self {
            Side::Long => "Buy",
            Side::Short => "Sell",
            Side::None => "",
        }
    }

    /// The venue side that closes a position opened on this side.
    pub fn opposite_venue_side(self) -> &'static str {
        match self {
            Side::Long => "Sell",
            Side::Short => "Buy",
            Side::None => "",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Green,
    Red,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

/// Latest ticker quote for a symbol.
#[derive(Clone, Copy, Debug)]
pub struct Ticker {
    pub last_price: f64,
}

/// Instrument trading rules, as returned by instruments-info.
#[derive(Clone, Copy, Debug)]
pub struct Instrument {
    pub lot_step: f64,
    pub min_qty: f64,
    pub max_qty: f64,
    pub tick_size: f64,
    pub min_price: f64,
    pub max_price: f64,
}

/// Remote position snapshot, as reported by the exchange (not the local bookkeeping copy).
#[derive(Clone, Copy, Debug)]
pub struct RemotePosition {
    pub side: Side,
    pub size: f64,
    pub avg_price: f64,
}

/// A single fill against an order.
#[derive(Clone, Copy, Debug)]
pub struct Execution {
    pub side: Side,
    pub exec_qty: f64,
    pub exec_price: f64,
    pub exec_time_ms: i64,
}

/// A closed (fully or partially) trade, appended to the trade journal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub side: SideLabel,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub entry_time: i64,
    pub exit_time: i64,
    pub is_partial: bool,
}

/// Serializable mirror of `Side` used on journalled records (no `None` variant needed there).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideLabel {
    Long,
    Short,
}

impl From<Side> for SideLabel {
    fn from(s: Side) -> Self {
        match s {
            Side::Long => SideLabel::Long,
            Side::Short | Side::None => SideLabel::Short,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub value: f64,
}

/// 1-3 informational score describing how many corroborating factors line up
/// behind an entry. Never gates entries; carried on trade records for
/// diagnostic/journal context only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalStrength(pub u8);

/// Read-only snapshot of a symbol's trading state, suitable for handing to a
/// status surface (e.g. a dashboard) without exposing the mutation API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub symbol: String,
    pub side: Option<SideLabel>,
    pub size: f64,
    pub entry_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub unrealized_pnl_percent: Option<f64>,
    pub trend_4h: TrendLabel,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub total_pnl: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendLabel {
    Bullish,
    Bearish,
    Neutral,
}

impl From<Trend> for TrendLabel {
    fn from(t: Trend) -> Self {
        match t {
            Trend::Bullish => TrendLabel::Bullish,
            Trend::Bearish => TrendLabel::Bearish,
            Trend::Neutral => TrendLabel::Neutral,
        }
    }
}
