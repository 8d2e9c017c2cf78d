//! Environment-driven configuration, validated eagerly at process start.
//!
//! There is no other configuration surface in scope for this crate: no config files, no
//! CLI flags. Every field has a default, so a missing variable is not an error, but a
//! present-and-unparseable one is — fail fast rather than limp along on a silently-ignored
//! bad value.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Errors constructing a [`Config`] from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable was present but could not be parsed.
    #[error("invalid value for {var}: {reason}")]
    InvalidValue {
        /// The environment variable name.
        var: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// A required variable (one with no sensible default) was missing.
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
}

/// Runtime configuration for the relay and the consumer/dispatcher.
#[derive(Debug, Clone)]
pub struct Config {
    /// `PostgreSQL` connection string. Required.
    pub database_url: String,
    /// Redis connection string. Required.
    pub redis_url: String,
    /// Maximum rows the relay reads per `ReadPending` call. Default 100.
    pub outbox_batch_size: u32,
    /// Relay's base sleep interval when the outbox has no pending rows. Default 200ms.
    pub relay_poll_interval: Duration,
    /// Outbox rows terminate as `failed` after this many publish attempts. Default 5.
    pub relay_max_retries: u32,
    /// Rows stuck in `publishing` longer than this are reclaimed as `pending`. Default 30s.
    pub relay_reclaim_timeout: Duration,
    /// How long a single blocking `Subscribe(...).Next()` call waits before returning
    /// empty. Default 5s.
    pub consumer_block_timeout: Duration,
    /// Per-handler-chain deadline; exceeding it aborts the transaction. Default 30s.
    pub handler_deadline: Duration,
    /// Consumer group name this process joins. Default `"default"`.
    pub consumer_group_name: String,
    /// Approximate cap on stream length passed to `XADD ... MAXLEN ~`. Default 1,000,000.
    pub stream_maxlen: u64,
}

impl Config {
    /// Load configuration from the process environment, applying defaults for any variable
    /// that is unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `DATABASE_URL` or `REDIS_URL` are unset, or
    /// [`ConfigError::InvalidValue`] if a set variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required_string("DATABASE_URL")?;
        let redis_url = required_string("REDIS_URL")?;

        Ok(Self {
            database_url,
            redis_url,
            outbox_batch_size: parsed_or("OUTBOX_BATCH_SIZE", 100)?,
            relay_poll_interval: millis_or("RELAY_POLL_INTERVAL_MS", 200)?,
            relay_max_retries: parsed_or("RELAY_MAX_RETRIES", 5)?,
            relay_reclaim_timeout: millis_or("RELAY_RECLAIM_TIMEOUT_MS", 30_000)?,
            consumer_block_timeout: millis_or("CONSUMER_BLOCK_TIMEOUT_MS", 5_000)?,
            handler_deadline: millis_or("HANDLER_DEADLINE_MS", 30_000)?,
            consumer_group_name: env::var("CONSUMER_GROUP_NAME")
                .unwrap_or_else(|_| "default".to_string()),
            stream_maxlen: parsed_or("STREAM_MAXLEN", 1_000_000)?,
        })
    }
}

fn required_string(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::Missing(var))
}

fn parsed_or<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn millis_or(var: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    parsed_or(var, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_database_url_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        // SAFETY (test-only): env var mutation is guarded by ENV_LOCK so tests in this
        // module never race each other; no other code in the process reads these keys.
        unsafe {
            env::remove_var("DATABASE_URL");
            env::remove_var("REDIS_URL");
        }
        let err = Config::from_env().expect_err("should fail without DATABASE_URL");
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn defaults_apply_when_optional_vars_are_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            env::set_var("DATABASE_URL", "postgres://localhost/test");
            env::set_var("REDIS_URL", "redis://localhost");
            env::remove_var("OUTBOX_BATCH_SIZE");
        }
        let config = Config::from_env().expect("should succeed with required vars set");
        assert_eq!(config.outbox_batch_size, 100);
        assert_eq!(config.relay_poll_interval, Duration::from_millis(200));
        unsafe {
            env::remove_var("DATABASE_URL");
            env::remove_var("REDIS_URL");
        }
    }

    #[test]
    fn invalid_numeric_value_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            env::set_var("DATABASE_URL", "postgres://localhost/test");
            env::set_var("REDIS_URL", "redis://localhost");
            env::set_var("OUTBOX_BATCH_SIZE", "not-a-number");
        }
        let err = Config::from_env().expect_err("should reject unparseable value");
        assert!(matches!(err, ConfigError::InvalidValue { var: "OUTBOX_BATCH_SIZE", .. }));
        unsafe {
            env::remove_var("DATABASE_URL");
            env::remove_var("REDIS_URL");
            env::remove_var("OUTBOX_BATCH_SIZE");
        }
    }
}
