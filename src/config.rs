//! Runtime settings.
//!
//! Sources, later overriding earlier: built-in defaults, an optional file
//! (format taken from its extension), then `SUBSETTLE__<SECTION>__<KEY>`
//! environment variables.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SUBSETTLE";
/// Environment variable holding the log filter.
pub const LOG_ENV_VAR: &str = "SUBSETTLE_LOG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub referral: ReferralSettings,
    pub cache: CacheSettings,
    pub sync: SyncSettings,
    pub providers: ProviderSettings,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        use config::{Config, Environment, File};

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Self>()?
            .validated()
    }

    fn validated(self) -> Result<Self, config::ConfigError> {
        let percent = self.referral.percent;
        if percent < Decimal::ZERO || percent > Decimal::ONE_HUNDRED {
            return Err(config::ConfigError::Message(format!(
                "referral.percent must be between 0 and 100, got {percent}"
            )));
        }
        Ok(self)
    }
}

/// Reconciliation engine limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Upper bound on one store transaction.
    pub transaction_timeout_ms: u64,
    /// Attempts per event, counting the first, on timeouts and conflicts.
    pub max_attempts: usize,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: 5_000,
            max_attempts: 3,
            retry_min_delay_ms: 10,
            retry_max_delay_ms: 500,
        }
    }
}

impl EngineSettings {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn retry_min_delay(&self) -> Duration {
        Duration::from_millis(self.retry_min_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReferralSettings {
    /// Share of a confirmed purchase credited to the referrer, in percent.
    pub percent: Decimal,
}

impl Default for ReferralSettings {
    fn default() -> Self {
        Self {
            percent: Decimal::from(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            capacity: 10_000,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Sync dispatcher queue and retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub queue_capacity: usize,
    /// Delivery attempts per change, counting the first.
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// How often the worker re-scans the outbox for changes the queue dropped.
    pub sweep_interval_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 5,
            min_delay_ms: 100,
            max_delay_ms: 5_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl SyncSettings {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Provider credentials. Without them, notifications are accepted unsigned.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub crypto_pay_token: Option<String>,
    pub yookassa_secret: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.engine.max_attempts, 3);
        assert_eq!(settings.engine.transaction_timeout(), Duration::from_secs(5));
        assert_eq!(settings.referral.percent, dec!(5));
        assert_eq!(settings.cache.ttl(), Duration::from_secs(300));
        assert_eq!(settings.sync.queue_capacity, 1024);
        assert!(settings.providers.crypto_pay_token.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[referral]\npercent = 10\n\n[sync]\nmax_attempts = 2\n\n[providers]\nyookassa_secret = \"s3cret\""
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.referral.percent, dec!(10));
        assert_eq!(settings.sync.max_attempts, 2);
        assert_eq!(settings.sync.min_delay_ms, 100);
        assert_eq!(settings.providers.yookassa_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_referral_percent_out_of_range_is_rejected() {
        for percent in ["-5", "101"] {
            let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
            writeln!(file, "[referral]\npercent = {percent}").unwrap();

            let err = Settings::load(Some(file.path())).unwrap_err();
            assert!(err.to_string().contains("referral.percent"));
        }
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/subsettle.toml"))).is_err());
    }
}
