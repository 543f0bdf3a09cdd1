//! Environment-driven configuration.
//!
//! Every setting has a default; only `COURIER_DATABASE_URL` (or
//! `DATABASE_URL`) is required. Malformed values are errors rather than
//! silently ignored.

use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::pool::PoolConfig;
use crate::queue::{DEFAULT_STALE_PROCESSING_AFTER, RetryPolicy};
use crate::rate_limit::RateLimiterConfig;
use crate::workers::WorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for a complete delivery service.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    pub pool: PoolConfig,
    pub worker: WorkerConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
    /// How long a `processing` claim stays exclusive
    pub stale_processing_after: Duration,
}

impl CourierConfig {
    /// Read `COURIER_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let database_url = env
            .string("COURIER_DATABASE_URL")
            .or_else(|| env.string("DATABASE_URL"))
            .ok_or(ConfigError::Missing("COURIER_DATABASE_URL"))?;

        let mut pool = PoolConfig::new(database_url);
        if let Some(prefix) = env.string("COURIER_WORKSPACE_PREFIX") {
            pool = pool.with_workspace_prefix(prefix);
        }
        if let Some(max) = env.parse::<u32>("COURIER_MAX_CONNECTIONS_PER_WORKSPACE")? {
            pool = pool.with_max_connections_per_workspace(max);
        }

        let defaults = WorkerConfig::default();
        let retry_defaults = RetryPolicy::default();
        let retry_policy = RetryPolicy::exponential(
            env.secs("COURIER_RETRY_BASE_SECS")?.unwrap_or(retry_defaults.base_delay),
            env.secs("COURIER_RETRY_MAX_SECS")?.unwrap_or(retry_defaults.max_delay),
        );

        let worker = WorkerConfig::default()
            .with_poll_interval(
                env.millis("COURIER_POLL_INTERVAL_MS")?
                    .unwrap_or(defaults.poll_interval),
            )
            .with_batch_size(env.parse("COURIER_BATCH_SIZE")?.unwrap_or(defaults.batch_size))
            .with_max_concurrent_tenants(
                env.parse("COURIER_MAX_CONCURRENT_TENANTS")?
                    .unwrap_or(defaults.max_concurrent_tenants),
            )
            .with_shutdown_timeout(
                env.secs("COURIER_SHUTDOWN_TIMEOUT_SECS")?
                    .unwrap_or(defaults.shutdown_timeout),
            )
            .with_retry_policy(retry_policy);

        let breaker_defaults = CircuitBreakerConfig::default();
        let circuit_breaker = CircuitBreakerConfig::default()
            .with_threshold(
                env.parse("COURIER_BREAKER_THRESHOLD")?
                    .unwrap_or(breaker_defaults.threshold),
            )
            .with_cooldown(
                env.secs("COURIER_BREAKER_COOLDOWN_SECS")?
                    .unwrap_or(breaker_defaults.cooldown),
            );

        let mut rate_limiter = RateLimiterConfig::default();
        if let Some(rate) = env.parse::<u32>("COURIER_DEFAULT_RATE_PER_MINUTE")? {
            if rate == 0 {
                return Err(ConfigError::Invalid {
                    key: "COURIER_DEFAULT_RATE_PER_MINUTE",
                    value: rate.to_string(),
                    reason: "must be positive".to_string(),
                });
            }
            rate_limiter = rate_limiter.with_default_per_minute(rate);
        }

        Ok(Self {
            pool,
            worker,
            circuit_breaker,
            rate_limiter,
            stale_processing_after: env
                .secs("COURIER_STALE_PROCESSING_SECS")?
                .unwrap_or(DEFAULT_STALE_PROCESSING_AFTER),
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    key,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn secs(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}
