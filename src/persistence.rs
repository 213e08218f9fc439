//! Equity/trade journal persistence: append-only, capped, atomically
//! written (`*.tmp` + rename), corrupted files backed up to `*.bak` and
//! reinitialized empty.

use crate::types::{EquityPoint, Trade};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAX_EQUITY_POINTS: usize = 1000;
const MAX_TRADES: usize = 1000;
const EQUITY_MIN_CHANGE_PCT: f64 = 1.0;
const EQUITY_MAX_STALE_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("io error writing {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Default)]
struct EquityFile {
    last_update: i64,
    history: Vec<EquityPoint>,
}

#[derive(Serialize, Deserialize, Default)]
struct TradeFile {
    last_update: i64,
    trades: Vec<Trade>,
}

fn atomic_write(path: &Path, contents: &str) -> Result<(), JournalError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents).map_err(|source| JournalError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn load_or_reinit<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                log::warn!(
                    "journal {} is corrupted ({e}); backing up to .bak and reinitializing",
                    path.display()
                );
                let bak = path.with_extension("bak");
                let _ = std::fs::rename(path, &bak);
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

pub struct EquityJournal {
    path: PathBuf,
    history: Vec<EquityPoint>,
}

impl EquityJournal {
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("equity_history.json");
        let file: EquityFile = load_or_reinit(&path);
        EquityJournal {
            path,
            history: file.history,
        }
    }

    /// Append filter: keep if the series is empty, value moved >= 1% from
    /// the last kept point, or >= 3600s elapsed since it. `force` (used on
    /// trade events) bypasses the filter.
    pub fn maybe_append(&mut self, point: EquityPoint, force: bool) -> Result<bool, JournalError> {
        let should_append = force
            || match self.history.last() {
                None => true,
                Some(last) => {
                    let elapsed = point.timestamp - last.timestamp;
                    let pct_change = if last.value != 0.0 {
                        ((point.value - last.value) / last.value).abs() * 100.0
                    } else {
                        100.0
                    };
                    pct_change >= EQUITY_MIN_CHANGE_PCT || elapsed >= EQUITY_MAX_STALE_SECS
                }
            };
        if !should_append {
            return Ok(false);
        }
        self.history.push(point);
        if self.history.len() > MAX_EQUITY_POINTS {
            let overflow = self.history.len() - MAX_EQUITY_POINTS;
            self.history.drain(0..overflow);
        }
        self.persist(point.timestamp)?;
        Ok(true)
    }

    fn persist(&self, now_ms: i64) -> Result<(), JournalError> {
        let file = EquityFile {
            last_update: now_ms,
            history: self.history.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        atomic_write(&self.path, &json)
    }
}

pub struct TradeJournal {
    path: PathBuf,
    trades: Vec<Trade>,
}

impl TradeJournal {
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("trade_history.json");
        let file: TradeFile = load_or_reinit(&path);
        TradeJournal {
            path,
            trades: file.trades,
        }
    }

    pub fn append(&mut self, trade: Trade) -> Result<(), JournalError> {
        let exit_time = trade.exit_time;
        self.trades.push(trade);
        if self.trades.len() > MAX_TRADES {
            let overflow = self.trades.len() - MAX_TRADES;
            self.trades.drain(0..overflow);
        }
        self.persist(exit_time)
    }

    fn persist(&self, now_ms: i64) -> Result<(), JournalError> {
        let file = TradeFile {
            last_update: now_ms,
            trades: self.trades.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        atomic_write(&self.path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SideLabel;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("engine_journal_test_{name}"));
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    #[test]
    fn equity_journal_filters_small_changes() {
        let dir = tmp_dir("equity_filter");
        let mut j = EquityJournal::load(&dir);
        assert!(j
            .maybe_append(EquityPoint { timestamp: 0, value: 100.0 }, false)
            .unwrap());
        // Tiny change, not enough time elapsed -> filtered.
        assert!(!j
            .maybe_append(EquityPoint { timestamp: 1, value: 100.1 }, false)
            .unwrap());
        // >= 1% change -> kept.
        assert!(j
            .maybe_append(EquityPoint { timestamp: 2, value: 102.0 }, false)
            .unwrap());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn equity_journal_forced_append_bypasses_filter() {
        let dir = tmp_dir("equity_forced");
        let mut j = EquityJournal::load(&dir);
        j.maybe_append(EquityPoint { timestamp: 0, value: 100.0 }, false)
            .unwrap();
        assert!(j
            .maybe_append(EquityPoint { timestamp: 1, value: 100.0 }, true)
            .unwrap());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn trade_journal_round_trips_through_disk() {
        let dir = tmp_dir("trades");
        {
            let mut j = TradeJournal::load(&dir);
            j.append(Trade {
                symbol: "BTCUSDT".into(),
                side: SideLabel::Long,
                entry_price: 50000.0,
                exit_price: 51000.0,
                size: 1.0,
                pnl: 1000.0,
                pnl_percent: 2.0,
                entry_time: 0,
                exit_time: 1,
                is_partial: false,
            })
            .unwrap();
        }
        let reloaded = TradeJournal::load(&dir);
        assert_eq!(reloaded.trades.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupted_journal_backs_up_and_reinitializes() {
        let dir = tmp_dir("corrupt");
        std::fs::write(dir.join("equity_history.json"), "not json").unwrap();
        let j = EquityJournal::load(&dir);
        assert!(j.history.is_empty());
        assert!(dir.join("equity_history.bak").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
