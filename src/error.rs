//! Controller-level error taxonomy. Adapter errors (`BybitError`) are
//! classified at the adapter boundary; this enum is what the periodic loop
//! and entry/exit paths actually match on.

use crate::bybit_api::BybitError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("exchange error: {0}")]
    Exchange(#[from] BybitError),
    #[error("journal error: {0}")]
    Journal(#[from] crate::persistence::JournalError),
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}
