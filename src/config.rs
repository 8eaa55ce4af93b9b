//! Configuration management
//!
//! Loads the exchange configuration from JSON. Every section is optional and
//! falls back to its defaults; a handful of environment variables (read after
//! `.env` is loaded) override the file.

use anyhow::{bail, Context, Result};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::RateLimiterConfig;
use crate::{Money, Quantity, Symbol};

/// Upper bound on impact report retries; the backoff doubles per attempt
pub const MAX_IMPACT_RETRIES: u32 = 10;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trading: TradingConfig,
    pub rate_limit: RateLimitConfig,
    pub engine: EngineConfig,
    pub instruments: Vec<InstrumentConfig>,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// `EXCHANGE_STATE_DIR` and `EXCHANGE_COMMISSION_RATE` win over the file
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("EXCHANGE_STATE_DIR") {
            self.storage.state_dir = Some(PathBuf::from(dir));
        }
        if let Ok(rate) = std::env::var("EXCHANGE_COMMISSION_RATE") {
            self.trading.commission_rate = rate
                .parse()
                .with_context(|| format!("Invalid EXCHANGE_COMMISSION_RATE: {rate}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.trading;
        if t.commission_rate.is_negative() {
            bail!("commission_rate must not be negative");
        }
        if t.reservation_buffer < t.commission_rate {
            bail!(
                "reservation_buffer ({}) must cover commission_rate ({})",
                t.reservation_buffer,
                t.commission_rate
            );
        }
        if !t.price_band_pct.is_positive() {
            bail!("price_band_pct must be positive");
        }
        if t.order_ttl_hours <= 0 {
            bail!("order_ttl_hours must be positive");
        }
        if self.engine.impact_max_retries > MAX_IMPACT_RETRIES {
            bail!(
                "impact_max_retries ({}) must be at most {}",
                self.engine.impact_max_retries,
                MAX_IMPACT_RETRIES
            );
        }
        if self.rate_limit.max_submissions == 0 || self.rate_limit.window_secs == 0 {
            bail!("rate_limit needs a positive budget and window");
        }
        for instrument in &self.instruments {
            if !instrument.reference_price.is_positive() {
                bail!("instrument {} has a non-positive reference price", instrument.symbol);
            }
        }
        Ok(())
    }

    pub fn with_trading(mut self, trading: TradingConfig) -> Self {
        self.trading = trading;
        self
    }

    pub fn with_rate_limit(mut self, max_submissions: u32, window_secs: u64) -> Self {
        self.rate_limit = RateLimitConfig {
            max_submissions,
            window_secs,
        };
        self
    }

    pub fn with_instrument(mut self, symbol: impl Into<Symbol>, reference_price: Money) -> Self {
        self.instruments.push(InstrumentConfig {
            symbol: symbol.into(),
            reference_price,
        });
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.state_dir = Some(dir.into());
        self
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.instruments.iter().map(|i| i.symbol.clone()).collect()
    }
}

/// Per-session trading rules applied to newly created sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub commission_rate: Money,
    pub price_band_pct: Money,
    /// Safety margin on reserved cash; must be at least the commission rate
    pub reservation_buffer: Money,
    pub order_ttl_hours: i64,
    pub allow_short_selling: bool,
    pub max_position_size: Option<Quantity>,
    pub starting_cash: Money,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            commission_rate: Money::new(dec!(0.001)), // 0.1%
            price_band_pct: Money::new(dec!(0.10)),
            reservation_buffer: Money::new(dec!(0.01)),
            order_ttl_hours: 24,
            allow_short_selling: false,
            max_position_size: None,
            starting_cash: Money::from_i64(100_000),
        }
    }
}

impl TradingConfig {
    pub fn with_commission_rate(mut self, rate: Money) -> Self {
        self.commission_rate = rate;
        self
    }

    pub fn with_short_selling(mut self, allowed: bool) -> Self {
        self.allow_short_selling = allowed;
        self
    }

    pub fn with_max_position_size(mut self, cap: Quantity) -> Self {
        self.max_position_size = Some(cap);
        self
    }

    pub fn with_starting_cash(mut self, cash: Money) -> Self {
        self.starting_cash = cash;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_submissions: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_submissions: 30,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::default()
            .with_max_submissions(self.max_submissions)
            .with_window(Duration::from_secs(self.window_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sweep_interval_secs: u64,
    pub event_channel_capacity: usize,
    /// Reference price move per share traded, as a fraction
    pub impact_factor: Money,
    pub impact_max_retries: u32,
    pub impact_retry_base_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            event_channel_capacity: 1024,
            impact_factor: Money::new(dec!(0.00001)),
            impact_max_retries: 3,
            impact_retry_base_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: Symbol,
    pub reference_price: Money,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for `exchange.db` and `exchange_backup.json`; in-memory only when unset
    pub state_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn db_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("exchange.db"))
    }

    pub fn json_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join("exchange_backup.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.trading.order_ttl_hours, 24);
        assert_eq!(config.rate_limit.max_submissions, 30);
        assert_eq!(config.engine.sweep_interval_secs, 30);
        assert!(config.instruments.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parses_instruments_and_numbers() {
        let json = r#"{
            "trading": { "commission_rate": 0.002, "reservation_buffer": "0.02", "max_position_size": 500 },
            "instruments": [ { "symbol": "ACME", "reference_price": 100.5 } ]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.trading.commission_rate, Money::new(dec!(0.002)));
        assert_eq!(config.trading.max_position_size, Some(500));
        assert_eq!(config.symbols(), vec![Symbol::new("ACME")]);
        assert_eq!(config.instruments[0].reference_price, Money::new(dec!(100.5)));
    }

    #[test]
    fn test_buffer_must_cover_commission() {
        let config = Config::default().with_trading(
            TradingConfig::default().with_commission_rate(Money::new(dec!(0.05))),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_impact_retries_are_bounded() {
        let mut config = Config::default();
        config.engine.impact_max_retries = MAX_IMPACT_RETRIES + 1;
        assert!(config.validate().is_err());
        config.engine.impact_max_retries = MAX_IMPACT_RETRIES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = Config::default()
            .with_rate_limit(5, 10)
            .with_instrument("ACME", Money::from_i64(100))
            .with_state_dir("state");
        assert_eq!(config.rate_limit.limiter_config().max_submissions, 5);
        assert_eq!(config.storage.db_path(), Some(PathBuf::from("state/exchange.db")));
        assert!(config.validate().is_ok());
    }
}
