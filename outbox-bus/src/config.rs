//! Environment-driven configuration for the bus and its adapters.
//!
//! Follows the same `env::var(..).ok().and_then(parse).unwrap_or(default)`
//! convention the rest of the corpus uses for service configuration
//! rather than a derive-based env loader, since no piece of this
//! workspace has ever used one.

use std::str::FromStr;
use std::time::Duration;

fn parse_env_with_default<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Recognized tunables for the polling service, the claim/settle
/// protocol, and the bus's emit-middleware concurrency.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub batch_size: u32,
    pub poll_interval_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_error_backoff_ms: u64,
    pub processing_timeout_ms: u64,
    pub middleware_concurrency: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval_ms: 1000,
            max_retries: 5,
            base_backoff_ms: 1000,
            max_error_backoff_ms: 30_000,
            processing_timeout_ms: 30_000,
            middleware_concurrency: 10,
        }
    }
}

impl BusConfig {
    /// Read every recognized option from the environment, falling back
    /// to its documented default for anything absent or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: parse_env_with_default("OUTBOX_BATCH_SIZE", defaults.batch_size),
            poll_interval_ms: parse_env_with_default("OUTBOX_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            max_retries: parse_env_with_default("OUTBOX_MAX_RETRIES", defaults.max_retries),
            base_backoff_ms: parse_env_with_default("OUTBOX_BASE_BACKOFF_MS", defaults.base_backoff_ms),
            max_error_backoff_ms: parse_env_with_default(
                "OUTBOX_MAX_ERROR_BACKOFF_MS",
                defaults.max_error_backoff_ms,
            ),
            processing_timeout_ms: parse_env_with_default(
                "OUTBOX_PROCESSING_TIMEOUT_MS",
                defaults.processing_timeout_ms,
            ),
            middleware_concurrency: parse_env_with_default(
                "OUTBOX_MIDDLEWARE_CONCURRENCY",
                defaults.middleware_concurrency,
            ),
        }
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_match_spec_table_when_unset() {
        for key in [
            "OUTBOX_BATCH_SIZE",
            "OUTBOX_POLL_INTERVAL_MS",
            "OUTBOX_MAX_RETRIES",
            "OUTBOX_BASE_BACKOFF_MS",
            "OUTBOX_MAX_ERROR_BACKOFF_MS",
            "OUTBOX_PROCESSING_TIMEOUT_MS",
            "OUTBOX_MIDDLEWARE_CONCURRENCY",
        ] {
            std::env::remove_var(key);
        }

        let config = BusConfig::from_env();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_backoff_ms, 1000);
        assert_eq!(config.max_error_backoff_ms, 30_000);
        assert_eq!(config.processing_timeout_ms, 30_000);
        assert_eq!(config.middleware_concurrency, 10);
    }

    #[test]
    #[serial]
    fn overrides_are_picked_up_from_the_environment() {
        std::env::set_var("OUTBOX_BATCH_SIZE", "200");
        std::env::set_var("OUTBOX_MAX_RETRIES", "3");

        let config = BusConfig::from_env();
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.max_retries, 3);

        std::env::remove_var("OUTBOX_BATCH_SIZE");
        std::env::remove_var("OUTBOX_MAX_RETRIES");
    }

    #[test]
    #[serial]
    fn unparsable_value_falls_back_to_default() {
        std::env::set_var("OUTBOX_BATCH_SIZE", "not-a-number");
        let config = BusConfig::from_env();
        assert_eq!(config.batch_size, 50);
        std::env::remove_var("OUTBOX_BATCH_SIZE");
    }
}
