//! Pure indicator math: EMA, SMA, Wilder RMA, SuperTrend.
//!
//! Every function here sorts its input by `timestamp` ascending before
//! computing, accepts candles in either chronological order, and fails with
//! `IndicatorError::InvalidCandles` on malformed or insufficient input. None
//! of this module touches the network or the clock.

use crate::types::{Candle, Direction};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndicatorError {
    #[error("need at least {need} candles, got {got}")]
    InsufficientCandles { need: usize, got: usize },
    #[error("invalid candle data: {0}")]
    InvalidCandles(String),
}

fn sorted_by_time(candles: &[Candle]) -> Vec<Candle> {
    let mut v = candles.to_vec();
    v.sort_by_key(|c| c.timestamp);
    v
}

fn validate(candles: &[Candle], period: usize) -> Result<Vec<Candle>, IndicatorError> {
    if candles.is_empty() {
        return Err(IndicatorError::InvalidCandles("empty candle set".into()));
    }
    for c in candles {
        if !c.close.is_finite() || !c.high.is_finite() || !c.low.is_finite() {
            return Err(IndicatorError::InvalidCandles(
                "non-finite OHLC value".into(),
            ));
        }
    }
    if candles.len() < period {
        return Err(IndicatorError::InsufficientCandles {
            need: period,
            got: candles.len(),
        });
    }
    Ok(sorted_by_time(candles))
}

/// EMA seeded with `EMA[0] = close[0]`, `alpha = 2/(period+1)` — equivalent to
/// exponential smoothing with `adjust=false`. Returns the value at the last index.
pub fn ema(candles: &[Candle], period: usize) -> Result<f64, IndicatorError> {
    Ok(*ema_series(candles, period)?.last().unwrap())
}

/// Full EMA series aligned with the (sorted) input, one value per candle.
/// Unlike the single-value `ema`, every index is populated (no `None`
/// leading run) because the seed makes `EMA[0]` well-defined; the `period-1`
/// warm-up distinction only matters for the charting-oriented variant below.
pub fn ema_series(candles: &[Candle], period: usize) -> Result<Vec<f64>, IndicatorError> {
    let sorted = validate(candles, period)?;
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(sorted.len());
    let mut prev = sorted[0].close;
    out.push(prev);
    for c in &sorted[1..] {
        let v = alpha * c.close + (1.0 - alpha) * prev;
        out.push(v);
        prev = v;
    }
    Ok(out)
}

/// Charting-oriented EMA series: `None` for indices `< period - 1`, matching
/// the reference implementation's convention for "not yet reliable" values.
pub fn ema_series_charting(
    candles: &[Candle],
    period: usize,
) -> Result<Vec<Option<f64>>, IndicatorError> {
    let raw = ema_series(candles, period)?;
    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(i, v)| if i < period - 1 { None } else { Some(v) })
        .collect())
}

/// Simple moving average of the trailing `period` closes.
pub fn sma(candles: &[Candle], period: usize) -> Result<f64, IndicatorError> {
    let sorted = validate(candles, period)?;
    let tail = &sorted[sorted.len() - period..];
    Ok(tail.iter().map(|c| c.close).sum::<f64>() / period as f64)
}

/// Wilder's running moving average over an arbitrary series `s`.
/// `RMA[period-1] = mean(s[0..period])`; `RMA[i] = s[i]/period + RMA[i-1]*(1-1/period)`.
/// Indices `< period - 1` are `None`.
pub fn wilder_rma(s: &[f64], period: usize) -> Result<Vec<Option<f64>>, IndicatorError> {
    if s.len() < period {
        return Err(IndicatorError::InsufficientCandles {
            need: period,
            got: s.len(),
        });
    }
    let mut out = vec![None; s.len()];
    let seed = s[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(seed);
    let mut prev = seed;
    let inv = 1.0 / period as f64;
    for i in period..s.len() {
        let v = s[i] * inv + prev * (1.0 - inv);
        out[i] = Some(v);
        prev = v;
    }
    Ok(out)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SuperTrendPoint {
    pub value: f64,
    pub direction: Direction,
}

/// SuperTrend(period, multiplier): ATR-banded trend indicator with
/// band-locking and trend-inheritance. Returns one point per input candle
/// (sorted ascending), with the first `period` entries undefined in the
/// reference sense — here the caller should rely only on the last entry
/// once at least `period + 1` candles are provided, matching common
/// charting-platform behavior where ATR needs `period` warm-up bars.
pub fn supertrend(
    candles: &[Candle],
    period: usize,
    multiplier: f64,
) -> Result<Vec<SuperTrendPoint>, IndicatorError> {
    let sorted = validate(candles, period + 1)?;
    let n = sorted.len();

    let mut tr = vec![0.0f64; n];
    tr[0] = sorted[0].high - sorted[0].low;
    for i in 1..n {
        let prev_close = sorted[i - 1].close;
        tr[i] = (sorted[i].high - sorted[i].low)
            .max((sorted[i].high - prev_close).abs())
            .max((sorted[i].low - prev_close).abs());
    }
    let atr = wilder_rma(&tr, period)?;

    let mut final_upper = vec![0.0f64; n];
    let mut final_lower = vec![0.0f64; n];
    let mut trend = vec![1i8; n];
    let mut points = Vec::with_capacity(n);
    let mut atr_seeded = false;

    for i in 0..n {
        let a = match atr[i] {
            Some(v) => v,
            None => {
                // Not enough warm-up yet; carry hl2 as a neutral placeholder band.
                let hl2 = (sorted[i].high + sorted[i].low) / 2.0;
                final_upper[i] = hl2;
                final_lower[i] = hl2;
                trend[i] = 1;
                points.push(SuperTrendPoint {
                    value: final_lower[i],
                    direction: Direction::Green,
                });
                continue;
            }
        };
        let hl2 = (sorted[i].high + sorted[i].low) / 2.0;
        let basic_upper = hl2 + multiplier * a;
        let basic_lower = hl2 - multiplier * a;

        if i == 0 || !atr_seeded {
            final_upper[i] = basic_upper;
            final_lower[i] = basic_lower;
            trend[i] = 1;
            atr_seeded = true;
        } else {
            final_upper[i] = if basic_upper < final_upper[i - 1] || sorted[i - 1].close > final_upper[i - 1]
            {
                basic_upper
            } else {
                final_upper[i - 1]
            };
            final_lower[i] = if basic_lower > final_lower[i - 1] || sorted[i - 1].close < final_lower[i - 1]
            {
                basic_lower
            } else {
                final_lower[i - 1]
            };

            if sorted[i].close > final_upper[i - 1] {
                trend[i] = 1;
            } else if sorted[i].close < final_lower[i - 1] {
                trend[i] = -1;
            } else {
                trend[i] = trend[i - 1];
                if trend[i] == 1 && final_lower[i] < final_lower[i - 1] {
                    final_lower[i] = final_lower[i - 1];
                } else if trend[i] == -1 && final_upper[i] > final_upper[i - 1] {
                    final_upper[i] = final_upper[i - 1];
                }
            }
        }

        let (value, direction) = if trend[i] == 1 {
            (final_lower[i], Direction::Green)
        } else {
            (final_upper[i], Direction::Red)
        };
        points.push(SuperTrendPoint { value, direction });
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            turnover: close,
        }
    }

    #[test]
    fn ema_matches_reference_seed_sequence() {
        let closes = [10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0, 17.0, 18.0, 19.0];
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| candle(i as i64, c))
            .collect();
        let series = ema_series(&candles, 3).unwrap();
        let expected = [
            10.0,
            10.5,
            11.25,
            12.125,
            13.0625,
            14.03125,
            15.015625,
            16.0078125,
            17.00390625,
            18.001953125,
        ];
        for (got, want) in series.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-9, "{got} vs {want}");
        }
    }

    #[test]
    fn ema_rejects_insufficient_candles() {
        let candles = vec![candle(0, 10.0), candle(1, 11.0)];
        assert!(matches!(
            ema(&candles, 5),
            Err(IndicatorError::InsufficientCandles { need: 5, got: 2 })
        ));
    }

    #[test]
    fn supertrend_flat_series_has_zero_atr_and_constant_direction() {
        let candles: Vec<Candle> = (0..12).map(|i| candle(i, 100.0)).collect();
        let points = supertrend(&candles, 10, 3.0).unwrap();
        for p in &points[10..] {
            assert_eq!(p.direction, Direction::Green);
            assert!((p.value - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn supertrend_direction_steady_inside_bands() {
        // A gentle oscillation that never breaches the bands should never flip.
        let closes = [
            100.0, 101.0, 100.5, 101.5, 100.8, 101.2, 100.6, 101.1, 100.9, 101.3, 100.7, 101.0,
            100.9, 101.1,
        ];
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                timestamp: i as i64,
                open: c,
                high: c + 0.2,
                low: c - 0.2,
                close: c,
                volume: 1.0,
                turnover: c,
            })
            .collect();
        let points = supertrend(&candles, 10, 3.0).unwrap();
        let dirs: Vec<_> = points[10..].iter().map(|p| p.direction).collect();
        assert!(dirs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn supertrend_seeds_basic_bands_at_first_atr_defined_index() {
        let candles = vec![
            Candle { timestamp: 0, open: 9.0, high: 10.0, low: 8.0, close: 9.0, volume: 1.0, turnover: 9.0 },
            Candle { timestamp: 1, open: 12.0, high: 13.0, low: 11.0, close: 12.0, volume: 1.0, turnover: 12.0 },
            Candle { timestamp: 2, open: 8.0, high: 10.0, low: 7.0, close: 8.0, volume: 1.0, turnover: 8.0 },
            Candle { timestamp: 3, open: 15.0, high: 16.0, low: 13.0, close: 15.0, volume: 1.0, turnover: 15.0 },
            Candle { timestamp: 4, open: 11.0, high: 12.0, low: 9.0, close: 11.0, volume: 1.0, turnover: 11.0 },
        ];
        let points = supertrend(&candles, 3, 2.0).unwrap();
        let seeded = points[2];
        assert_eq!(seeded.direction, Direction::Green);
        assert!((seeded.value - (8.5 - 2.0 * (11.0 / 3.0))).abs() < 1e-9);
    }
}
