//! Environment-variable configuration, validated eagerly at startup.
//!
//! Mirrors the original bot's `BotConfig`/`TradingConfig`/`IndicatorConfig`
//! split but flattened into one struct, since Rust has no equivalent need
//! for dataclass composition here.

use thiserror::Error;

const DEFAULT_SYMBOLS: &str =
    "BTCUSDT,ETHUSDT,BNBUSDT,SOLUSDT,XRPUSDT,ADAUSDT,DOGEUSDT,AVAXUSDT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BYBIT_API_KEY and BYBIT_API_SECRET must be set")]
    MissingCredentials,
    #[error("at least one trading symbol must be configured")]
    EmptySymbols,
    #[error("leverage must be between 1 and 100, got {0}")]
    LeverageOutOfRange(i64),
    #[error("invalid value for {var}: {source}")]
    InvalidValue {
        var: &'static str,
        source: std::num::ParseFloatError,
    },
    #[error("invalid integer for {var}: {source}")]
    InvalidInt {
        var: &'static str,
        source: std::num::ParseIntError,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bybit_api_key: String,
    pub bybit_api_secret: String,
    pub bybit_testnet: bool,

    pub symbols: Vec<String>,
    pub position_size_usdt: f64,
    pub leverage: i64,
    pub margin_mode: String,

    pub ema_period_4h: usize,
    pub st_period_4h: usize,
    pub st_multiplier_4h: f64,
    pub st_period_1h: usize,
    pub st_multiplier_1h: f64,

    pub check_interval_seconds: u64,
    pub update_4h_interval_hours: i64,
    pub trading_enabled: bool,
    pub port: u16,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_f64(var: &'static str, raw: &str) -> Result<f64, ConfigError> {
    raw.parse()
        .map_err(|source| ConfigError::InvalidValue { var, source })
}

fn parse_int<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    raw.parse()
        .map_err(|source| ConfigError::InvalidInt { var, source })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let symbols: Vec<String> = env_or("SYMBOLS", DEFAULT_SYMBOLS)
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let cfg = Config {
            bybit_api_key: env_or("BYBIT_API_KEY", ""),
            bybit_api_secret: env_or("BYBIT_API_SECRET", ""),
            bybit_testnet: env_or("BYBIT_TESTNET", "false").to_lowercase() == "true",

            symbols,
            position_size_usdt: parse_f64("POSITION_SIZE_USDT", &env_or("POSITION_SIZE_USDT", "100"))?,
            leverage: parse_int("LEVERAGE", &env_or("LEVERAGE", "20"))?,
            margin_mode: env_or("MARGIN_MODE", "ISOLATED"),

            ema_period_4h: parse_int("EMA_PERIOD_4H", &env_or("EMA_PERIOD_4H", "200"))?,
            st_period_4h: parse_int("ST_PERIOD_4H", &env_or("ST_PERIOD_4H", "10"))?,
            st_multiplier_4h: parse_f64("ST_MULTIPLIER_4H", &env_or("ST_MULTIPLIER_4H", "3.0"))?,
            st_period_1h: parse_int("ST_PERIOD_1H", &env_or("ST_PERIOD_1H", "10"))?,
            st_multiplier_1h: parse_f64("ST_MULTIPLIER_1H", &env_or("ST_MULTIPLIER_1H", "3.0"))?,

            check_interval_seconds: parse_int(
                "CHECK_INTERVAL_SECONDS",
                &env_or("CHECK_INTERVAL_SECONDS", "300"),
            )?,
            update_4h_interval_hours: parse_int(
                "UPDATE_4H_HOURS",
                &env_or("UPDATE_4H_HOURS", "4"),
            )?,
            trading_enabled: true,
            port: parse_int("PORT", &env_or("PORT", "10000"))?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bybit_api_key.is_empty() || self.bybit_api_secret.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.symbols.is_empty() {
            return Err(ConfigError::EmptySymbols);
        }
        if !(1..=100).contains(&self.leverage) {
            return Err(ConfigError::LeverageOutOfRange(self.leverage));
        }
        Ok(())
    }

    pub fn base_url(&self) -> &'static str {
        if self.bybit_testnet {
            "https://api-testnet.bybit.com"
        } else {
            "https://api.bybit.com"
        }
    }

    pub fn ws_url(&self) -> &'static str {
        if self.bybit_testnet {
            "wss://stream-testnet.bybit.com/v5/public/linear"
        } else {
            "wss://stream.bybit.com/v5/public/linear"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Config reads process-wide env vars; serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn rejects_missing_credentials() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("BYBIT_API_KEY");
        std::env::remove_var("BYBIT_API_SECRET");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::MissingCredentials)
        ));
    }

    #[test]
    fn rejects_leverage_out_of_range() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("BYBIT_API_KEY", "k");
        std::env::set_var("BYBIT_API_SECRET", "s");
        std::env::set_var("LEVERAGE", "200");
        let result = Config::from_env();
        std::env::remove_var("LEVERAGE");
        std::env::remove_var("BYBIT_API_KEY");
        std::env::remove_var("BYBIT_API_SECRET");
        assert!(matches!(result, Err(ConfigError::LeverageOutOfRange(200))));
    }
}
