use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // Storage
    pub database_url: String,

    // Order sizing
    pub quantity_scale: u32,            // 0 = whole shares
    pub cash_buffer_bps: u32,           // 50 = 0.5% headroom over the quote

    // Batching
    pub max_batch_size: i64,            // requests per batch
    pub batch_interval_seconds: u64,    // runner loop period

    // Broker fills
    pub fill_poll_attempts: u32,
    pub fill_poll_interval_ms: u64,

    // Paper broker
    pub paper_starting_cash: Decimal,
    pub paper_slippage_bps: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:smallcase.db".to_string(),
            quantity_scale: 0,
            cash_buffer_bps: 50,
            max_batch_size: 500,
            batch_interval_seconds: 5,
            fill_poll_attempts: 3,
            fill_poll_interval_ms: 500,
            paper_starting_cash: Decimal::from(10_000_000),
            paper_slippage_bps: 0,
        }
    }
}

fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + ToString,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            quantity_scale: var_or("QUANTITY_SCALE", defaults.quantity_scale)?,
            cash_buffer_bps: var_or("CASH_BUFFER_BPS", defaults.cash_buffer_bps)?,
            max_batch_size: var_or("MAX_BATCH_SIZE", defaults.max_batch_size)?,
            batch_interval_seconds: var_or("BATCH_INTERVAL_SECONDS", defaults.batch_interval_seconds)?,
            fill_poll_attempts: var_or("FILL_POLL_ATTEMPTS", defaults.fill_poll_attempts)?,
            fill_poll_interval_ms: var_or("FILL_POLL_INTERVAL_MS", defaults.fill_poll_interval_ms)?,
            paper_starting_cash: var_or("PAPER_STARTING_CASH", defaults.paper_starting_cash)?,
            paper_slippage_bps: var_or("PAPER_SLIPPAGE_BPS", defaults.paper_slippage_bps)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.quantity_scale > 8 {
            anyhow::bail!("QUANTITY_SCALE must be at most 8, got {}", self.quantity_scale);
        }
        if self.max_batch_size <= 0 {
            anyhow::bail!("MAX_BATCH_SIZE must be positive");
        }
        if self.cash_buffer_bps >= 10_000 {
            anyhow::bail!("CASH_BUFFER_BPS must be below 10000");
        }
        Ok(())
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_seconds.max(1))
    }

    pub fn fill_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fill_poll_interval_ms)
    }

    /// 1 + buffer, applied to planned buy costs
    pub fn buy_headroom(&self) -> Decimal {
        Decimal::ONE + Decimal::from(self.cash_buffer_bps) / Decimal::from(10_000)
    }

    /// 1 - buffer, applied to planned sale proceeds
    pub fn sell_haircut(&self) -> Decimal {
        Decimal::ONE - Decimal::from(self.cash_buffer_bps) / Decimal::from(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buy_headroom(), dec!(1.005));
        assert_eq!(config.sell_haircut(), dec!(0.995));
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = EngineConfig {
            quantity_scale: 12,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
