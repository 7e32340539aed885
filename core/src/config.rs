//! Runtime configuration, threaded explicitly into `Engine::build`.
//!
//! Every field has a default so a partial JSON file is valid.

use crate::money::{Currency, Money};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Score bands. `[0, medium)` low, `[medium, high)` medium,
/// `[high, critical)` high, `[critical, 1]` critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self { medium: 0.30, high: 0.60, critical: 0.80 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    pub amount_deviation: f64,
    pub location_anomaly: f64,
    pub device_novelty: f64,
    pub frequency_anomaly: f64,
    pub velocity: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            amount_deviation: 0.30,
            location_anomaly: 0.25,
            device_novelty: 0.20,
            frequency_anomaly: 0.15,
            velocity: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningPenalties {
    pub sanctions: f64,
    pub pep: f64,
    pub watchlist: f64,
}

impl Default for ScreeningPenalties {
    fn default() -> Self {
        Self { sanctions: 0.50, pep: 0.30, watchlist: 0.20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub thresholds: RiskThresholds,
    pub weights: FactorWeights,
    pub penalties: ScreeningPenalties,
    /// How many of the user's most recent completed transactions form the profile.
    pub history_window: usize,
    pub velocity_window_secs: i64,
    pub location_radius_km: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            weights: FactorWeights::default(),
            penalties: ScreeningPenalties::default(),
            history_window: 50,
            velocity_window_secs: 3600,
            location_radius_km: 1000.0,
        }
    }
}

/// Bounded exponential backoff around external screening lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Total time budget (T) across all attempts.
    pub budget_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_delay_ms: 100, max_delay_ms: 2_000, budget_ms: 10_000 }
    }
}

impl RetryPolicy {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    /// Per-lookup timeout (T₁).
    pub lookup_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Threads that call the screening provider.
    pub workers: usize,
    /// Lookups allowed to wait for a free worker before callers are turned away.
    pub queue_depth: usize,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self { lookup_timeout_ms: 2_000, retry: RetryPolicy::default(), workers: 4, queue_depth: 64 }
    }
}

impl ScreeningConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Attempts (K) at drawing an unused account number.
    pub account_number_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { account_number_attempts: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoanConfig {
    /// Missed installments (D) beyond which an active loan may be defaulted.
    pub default_after_missed: u32,
    /// Remaining principal at or below this counts as fully repaid.
    pub epsilon: Money,
}

impl Default for LoanConfig {
    fn default() -> Self {
        Self { default_after_missed: 3, epsilon: Money::from_minor(100) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub pool_size: usize,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { pool_size: 8, busy_timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub currencies: Vec<Currency>,
    pub risk: RiskConfig,
    pub screening: ScreeningConfig,
    pub ledger: LedgerConfig,
    pub loans: LoanConfig,
    pub store: StoreConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let currencies = ["USD", "EUR", "GBP", "CAD", "JPY", "CHF", "AUD"]
            .iter()
            .filter_map(|c| Currency::parse(c).ok())
            .collect();
        Self {
            currencies,
            risk: RiskConfig::default(),
            screening: ScreeningConfig::default(),
            ledger: LedgerConfig::default(),
            loans: LoanConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load from a JSON file. Missing keys fall back to defaults.
    /// In tests, use `CoreConfig::default_test()`.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: CoreConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.check()?;
        Ok(config)
    }

    /// Defaults with short retry budgets so failure paths run quickly in tests.
    pub fn default_test() -> Self {
        let mut config = Self::default();
        config.screening = ScreeningConfig {
            lookup_timeout_ms: 200,
            retry: RetryPolicy { base_delay_ms: 5, max_delay_ms: 20, budget_ms: 100 },
            ..ScreeningConfig::default()
        };
        config.store.busy_timeout_ms = 10_000;
        config
    }

    pub fn is_allowed_currency(&self, currency: &Currency) -> bool {
        self.currencies.contains(currency)
    }

    fn check(&self) -> anyhow::Result<()> {
        let t = &self.risk.thresholds;
        if !(0.0 < t.medium && t.medium < t.high && t.high < t.critical && t.critical <= 1.0) {
            anyhow::bail!("risk thresholds must satisfy 0 < medium < high < critical <= 1");
        }
        if self.currencies.is_empty() {
            anyhow::bail!("currency allow-list is empty");
        }
        if self.ledger.account_number_attempts == 0 {
            anyhow::bail!("ledger.account_number_attempts must be at least 1");
        }
        if self.store.pool_size == 0 {
            anyhow::bail!("store.pool_size must be at least 1");
        }
        if self.screening.workers == 0 {
            anyhow::bail!("screening.workers must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core_config.json");
        std::fs::write(&path, r#"{ "loans": { "default_after_missed": 5 }, "currencies": ["USD"] }"#).unwrap();
        let config = CoreConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.loans.default_after_missed, 5);
        assert_eq!(config.loans.epsilon, Money::from_minor(100));
        assert_eq!(config.currencies.len(), 1);
        assert_eq!(config.risk.thresholds.high, 0.60);
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "risk": { "thresholds": { "medium": 0.7, "high": 0.6, "critical": 0.8 } } }"#).unwrap();
        assert!(CoreConfig::load(path.to_str().unwrap()).is_err());
    }
}
