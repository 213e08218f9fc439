//! Pure decision functions: trend classification, entry/exit signals, TP
//! price target, and the informational signal-strength score.

use crate::types::{Direction, Side, SignalStrength, Trend};

/// BULLISH iff close > ema200 and ST direction is green; BEARISH iff
/// close < ema200 and ST direction is red; NEUTRAL otherwise (including
/// exact equality).
pub fn trend_filter(close: f64, ema200: f64, st_dir: Direction) -> Trend {
    if close > ema200 && st_dir == Direction::Green {
        Trend::Bullish
    } else if close < ema200 && st_dir == Direction::Red {
        Trend::Bearish
    } else {
        Trend::Neutral
    }
}

/// LONG iff BULLISH 4H trend and 1H SuperTrend is red (pullback within an
/// uptrend); SHORT iff BEARISH and 1H is green; else no entry.
pub fn entry_signal(trend_4h: Trend, st_1h_dir: Direction) -> Side {
    match (trend_4h, st_1h_dir) {
        (Trend::Bullish, Direction::Red) => Side::Long,
        (Trend::Bearish, Direction::Green) => Side::Short,
        _ => Side::None,
    }
}

/// True if the 4H SuperTrend direction opposes the position side, or a
/// flip between `prev` and `now` is observed (direction change).
pub fn exit_signal(side: Side, st_4h_dir: Direction, st_4h_prev_dir: Option<Direction>) -> bool {
    let opposite = match side {
        Side::Long => st_4h_dir == Direction::Red,
        Side::Short => st_4h_dir == Direction::Green,
        Side::None => return false,
    };
    if opposite {
        return true;
    }
    match (side, st_4h_prev_dir) {
        (Side::Long, Some(Direction::Green)) if st_4h_dir == Direction::Red => true,
        (Side::Short, Some(Direction::Red)) if st_4h_dir == Direction::Green => true,
        _ => false,
    }
}

/// 1-3 informational score: 3 when both timeframes' SuperTrend directions
/// and the EMA relation all corroborate the entry, 2 for one corroborating
/// factor beyond the bare entry condition, 1 otherwise. Never gates entries.
pub fn signal_strength(
    side: Side,
    close_1h: f64,
    ema200_4h: f64,
    st_1h_dir: Direction,
    st_4h_dir: Direction,
) -> SignalStrength {
    let ema_agrees = match side {
        Side::Long => close_1h > ema200_4h,
        Side::Short => close_1h < ema200_4h,
        Side::None => false,
    };
    let st_4h_agrees = match side {
        Side::Long => st_4h_dir == Direction::Green,
        Side::Short => st_4h_dir == Direction::Red,
        Side::None => false,
    };
    let st_1h_agrees = match side {
        Side::Long => st_1h_dir == Direction::Red,
        Side::Short => st_1h_dir == Direction::Green,
        Side::None => false,
    };
    let corroborating = [ema_agrees, st_4h_agrees].iter().filter(|&&b| b).count();
    if corroborating >= 2 && st_1h_agrees {
        SignalStrength(3)
    } else if corroborating >= 1 {
        SignalStrength(2)
    } else {
        SignalStrength(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trend_filter_neutral_on_exact_equality() {
        assert_eq!(trend_filter(100.0, 100.0, Direction::Green), Trend::Neutral);
        assert_eq!(trend_filter(100.0, 100.0, Direction::Red), Trend::Neutral);
    }

    #[test]
    fn trend_filter_requires_both_conditions() {
        // Close above EMA but ST red -> neutral, not bullish.
        assert_eq!(trend_filter(110.0, 100.0, Direction::Red), Trend::Neutral);
        assert_eq!(trend_filter(110.0, 100.0, Direction::Green), Trend::Bullish);
    }

    #[test]
    fn entry_signal_is_contrarian() {
        assert_eq!(entry_signal(Trend::Bullish, Direction::Red), Side::Long);
        assert_eq!(entry_signal(Trend::Bearish, Direction::Green), Side::Short);
        assert_eq!(entry_signal(Trend::Bullish, Direction::Green), Side::None);
        assert_eq!(entry_signal(Trend::Neutral, Direction::Red), Side::None);
    }

    #[test]
    fn exit_signal_monotone_in_opposite_direction() {
        // Opposite direction triggers regardless of prev_dir.
        assert!(exit_signal(Side::Long, Direction::Red, None));
        assert!(exit_signal(Side::Long, Direction::Red, Some(Direction::Red)));
        assert!(exit_signal(Side::Long, Direction::Red, Some(Direction::Green)));
        assert!(exit_signal(Side::Short, Direction::Green, None));
    }

    #[test]
    fn exit_signal_false_when_aligned_and_no_flip() {
        assert!(!exit_signal(Side::Long, Direction::Green, Some(Direction::Green)));
        assert!(!exit_signal(Side::Short, Direction::Red, Some(Direction::Red)));
    }

    #[test]
    fn exit_signal_none_side_never_exits() {
        assert!(!exit_signal(Side::None, Direction::Red, None));
    }
}
