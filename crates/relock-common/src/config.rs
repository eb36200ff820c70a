// Lock configuration
// Tunables for the store transaction retry loop and the local blocking layer

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use config::{Config, Environment};

use crate::error::LockError;

pub const TX_MAX_RETRIES_PROPERTY: &str = "relock.transaction.max-retries";
pub const TX_RETRY_DELAY_PROPERTY: &str = "relock.transaction.retry-delay-ms";
pub const PARK_INTERVAL_PROPERTY: &str = "relock.sync.park-interval-ms";

// Keys produced by `RELOCK_`-prefixed environment variables, where `__`
// separates sections: RELOCK_TRANSACTION__MAX_RETRIES,
// RELOCK_TRANSACTION__RETRY_DELAY_MS and RELOCK_SYNC__PARK_INTERVAL_MS
pub const TX_MAX_RETRIES_ENV_KEY: &str = "transaction.max_retries";
pub const TX_RETRY_DELAY_ENV_KEY: &str = "transaction.retry_delay_ms";
pub const PARK_INTERVAL_ENV_KEY: &str = "sync.park_interval_ms";

pub const DEFAULT_TX_MAX_RETRIES: u32 = 8;
pub const DEFAULT_TX_RETRY_DELAY_MS: u64 = 5;
pub const DEFAULT_PARK_INTERVAL_MS: u64 = 10;

/// Configuration shared by every lock handle on a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockConfig {
    /// Number of times a transaction is retried after a topology change (default: 8)
    pub tx_max_retries: u32,

    /// Pause between transaction retries in milliseconds (default: 5ms)
    pub tx_retry_delay_ms: u64,

    /// Upper bound on how long a parked thread sleeps before re-checking
    /// its interrupt flag and deadline (default: 10ms)
    pub park_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            tx_max_retries: DEFAULT_TX_MAX_RETRIES,
            tx_retry_delay_ms: DEFAULT_TX_RETRY_DELAY_MS,
            park_interval_ms: DEFAULT_PARK_INTERVAL_MS,
        }
    }
}

impl LockConfig {
    /// Read settings from an already built `Config`, falling back to defaults.
    ///
    /// Environment keys take precedence over the dotted file properties.
    pub fn from_config(config: &Config) -> Self {
        Self {
            tx_max_retries: read_int(config, TX_MAX_RETRIES_ENV_KEY, TX_MAX_RETRIES_PROPERTY)
                .map(|v| u32::try_from(v.max(0)).unwrap_or(u32::MAX))
                .unwrap_or(DEFAULT_TX_MAX_RETRIES),
            tx_retry_delay_ms: read_int(config, TX_RETRY_DELAY_ENV_KEY, TX_RETRY_DELAY_PROPERTY)
                .map(|v| v.max(0) as u64)
                .unwrap_or(DEFAULT_TX_RETRY_DELAY_MS),
            park_interval_ms: read_int(config, PARK_INTERVAL_ENV_KEY, PARK_INTERVAL_PROPERTY)
                .map(|v| v.max(1) as u64)
                .unwrap_or(DEFAULT_PARK_INTERVAL_MS),
        }
    }

    /// Load configuration from an optional file, overridden by `RELOCK_`
    /// environment variables (e.g. `RELOCK_SYNC__PARK_INTERVAL_MS=20`).
    pub fn load(path: Option<&Path>) -> Result<Self, LockError> {
        Self::build(path, None)
            .map(|config| Self::from_config(&config))
            .map_err(|e| LockError::Config(format!("{:#}", e)))
    }

    /// `env` replaces the process environment when set
    fn build(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> anyhow::Result<Config> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                Environment::with_prefix("RELOCK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .with_context(|| match path {
                Some(p) => format!("failed to load lock configuration from {}", p.display()),
                None => "failed to load lock configuration".to_string(),
            })
    }

    pub fn park_interval(&self) -> Duration {
        Duration::from_millis(self.park_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.tx_retry_delay_ms)
    }
}

fn read_int(config: &Config, env_key: &str, property: &str) -> Option<i64> {
    config
        .get_int(env_key)
        .or_else(|_| config.get_int(property))
        .ok()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = LockConfig::default();
        assert_eq!(config.tx_max_retries, 8);
        assert_eq!(config.tx_retry_delay_ms, 5);
        assert_eq!(config.park_interval_ms, 10);
    }

    #[test]
    fn test_duration_conversions() {
        let config = LockConfig::default();
        assert_eq!(config.park_interval(), Duration::from_millis(10));
        assert_eq!(config.retry_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_from_config_overrides() {
        let raw = Config::builder()
            .set_override(TX_MAX_RETRIES_PROPERTY, 3)
            .unwrap()
            .set_override(PARK_INTERVAL_PROPERTY, 0)
            .unwrap()
            .build()
            .unwrap();

        let config = LockConfig::from_config(&raw);
        assert_eq!(config.tx_max_retries, 3);
        assert_eq!(config.tx_retry_delay_ms, DEFAULT_TX_RETRY_DELAY_MS);
        // Park interval is clamped so parked threads never spin
        assert_eq!(config.park_interval_ms, 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[relock.transaction]\n\"max-retries\" = 2\n\"retry-delay-ms\" = 1\n"
        )
        .unwrap();

        let config = LockConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.tx_max_retries, 2);
        assert_eq!(config.tx_retry_delay_ms, 1);
        assert_eq!(config.park_interval_ms, DEFAULT_PARK_INTERVAL_MS);
    }

    #[test]
    fn test_from_config_clamps_large_retry_count() {
        let raw = Config::builder()
            .set_override(TX_MAX_RETRIES_PROPERTY, i64::from(u32::MAX) + 10)
            .unwrap()
            .set_override(TX_RETRY_DELAY_PROPERTY, -3)
            .unwrap()
            .build()
            .unwrap();

        let config = LockConfig::from_config(&raw);
        assert_eq!(config.tx_max_retries, u32::MAX);
        assert_eq!(config.tx_retry_delay_ms, 0);
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[relock.transaction]\n\"max-retries\" = 2\n\"retry-delay-ms\" = 1\n"
        )
        .unwrap();

        let env = config::Map::from([
            ("RELOCK_TRANSACTION__MAX_RETRIES".to_string(), "4".to_string()),
            ("RELOCK_SYNC__PARK_INTERVAL_MS".to_string(), "7".to_string()),
            ("UNRELATED_SYNC__PARK_INTERVAL_MS".to_string(), "99".to_string()),
        ]);
        let raw = LockConfig::build(Some(file.path()), Some(env)).unwrap();
        let config = LockConfig::from_config(&raw);
        assert_eq!(config.tx_max_retries, 4);
        assert_eq!(config.tx_retry_delay_ms, 1);
        assert_eq!(config.park_interval_ms, 7);
    }

    #[test]
    fn test_load_missing_file() {
        let err = LockConfig::load(Some(Path::new("/nonexistent/relock.toml"))).unwrap_err();
        assert!(matches!(err, LockError::Config(_)));
    }
}
