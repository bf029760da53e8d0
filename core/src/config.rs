//! Engine configuration.
//!
//! Passed explicitly to the engine at construction. Nothing in the engine
//! reads settings from anywhere else.

use crate::types::Money;
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Decimal places of the ledger currency. Amounts with more places
    /// are rejected; computed returns are rounded to this.
    pub currency_precision: u32,
    /// Decimal places kept on a compounding investment's accrued value.
    pub accrual_scale: u32,
    /// Interval the scheduler is expected to call `tick()` at.
    pub tick_interval_secs: u64,
    /// Investments claimed per batch.
    pub batch_size: usize,
    /// Upper bound on batches one tick will claim.
    pub max_batches_per_tick: usize,
    /// How long a worker's claim on an investment stays exclusive.
    pub lease_secs: i64,
    /// Busy timeout on every database connection.
    pub storage_timeout_ms: u64,
    /// Attempts per investment per tick when storage is transiently failing.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_backoff_ms: u64,
    /// Rows fetched per page when listing the ledger.
    pub page_size: usize,
    /// Wallet scope used when a request does not name one.
    pub default_wallet: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency_precision:   2,
            accrual_scale:        12,
            tick_interval_secs:   60,
            batch_size:           100,
            max_batches_per_tick: 50,
            lease_secs:           300,
            storage_timeout_ms:   5_000,
            max_attempts:         3,
            retry_backoff_ms:     50,
            page_size:            200,
            default_wallet:       "main".into(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file. Missing keys keep their defaults.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Config with small batches and no retry delay, for tests.
    pub fn default_test() -> Self {
        Self {
            batch_size:         10,
            storage_timeout_ms: 2_000,
            retry_backoff_ms:   0,
            page_size:          4,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.currency_precision > self.accrual_scale {
            anyhow::bail!(
                "accrual_scale ({}) must be >= currency_precision ({})",
                self.accrual_scale,
                self.currency_precision
            );
        }
        if self.accrual_scale > 20 {
            anyhow::bail!("accrual_scale ({}) must be <= 20", self.accrual_scale);
        }
        if self.batch_size == 0 || self.page_size == 0 || self.max_batches_per_tick == 0 {
            anyhow::bail!("batch_size, page_size and max_batches_per_tick must be positive");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        if self.lease_secs <= 0 {
            anyhow::bail!("lease_secs must be positive");
        }
        if self.default_wallet.trim().is_empty() {
            anyhow::bail!("default_wallet must not be empty");
        }
        Ok(())
    }

    /// Round to currency precision, half away from zero.
    pub fn round(&self, amount: Money) -> Money {
        amount.round_dp_with_strategy(self.currency_precision, RoundingStrategy::MidpointAwayFromZero)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn rounds_half_away_from_zero() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.round(Decimal::new(20_805, 3)), Decimal::new(2_081, 2));
        assert_eq!(cfg.round(Decimal::new(-20_805, 3)), Decimal::new(-2_081, 2));
    }

    #[test]
    fn backoff_doubles() {
        let cfg = EngineConfig { retry_backoff_ms: 10, ..EngineConfig::default() };
        assert_eq!(cfg.retry_backoff(1), Duration::from_millis(10));
        assert_eq!(cfg.retry_backoff(3), Duration::from_millis(40));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{ "batch_size": 7 }"#).unwrap();
        assert_eq!(cfg.batch_size, 7);
        assert_eq!(cfg.default_wallet, "main");
        assert!(cfg.validate().is_ok());
    }
}
