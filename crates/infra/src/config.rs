//! Configuration loading and representation.
//!
//! Everything is read from environment variables once at startup. Parsing
//! goes through a lookup function so tests can supply values directly.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::queue::RetryPolicy;
use crate::rate_limit::RateLimitProfiles;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    /// Postgres queue store; in-memory when unset
    pub database_url: Option<String>,
    /// Redis admission store; in-memory when unset
    pub redis_url: Option<String>,
    /// Deadline for one admission-store round trip
    pub redis_timeout: Duration,
    pub dispatcher: DispatcherConfig,
    pub retry: RetryPolicy,
    pub profiles: RateLimitProfiles,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let listen_addr = parse_or(&get, "BACKLOT_LISTEN_ADDR", "0.0.0.0:8080".parse().ok())?;

        let dispatcher = DispatcherConfig {
            poll_interval: Duration::from_millis(parse_or(&get, "BACKLOT_POLL_INTERVAL_MS", Some(5_000))?),
            batch_size: parse_or(&get, "BACKLOT_BATCH_SIZE", Some(10))?,
            max_concurrent: parse_or(&get, "BACKLOT_MAX_CONCURRENT", Some(4))?,
            lease_timeout: Duration::from_secs(parse_or(&get, "BACKLOT_LEASE_TIMEOUT_SECS", Some(300))?),
            sweep_interval: Duration::from_secs(parse_or(&get, "BACKLOT_SWEEP_INTERVAL_SECS", Some(60))?),
            handler_timeout: match parse_or(&get, "BACKLOT_HANDLER_TIMEOUT_SECS", Some(120u64))? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            name: "dispatcher".to_string(),
        };
        dispatcher.validate().map_err(|e| invalid("BACKLOT_*", "dispatcher", e))?;

        let retry = RetryPolicy::exponential(
            Duration::from_millis(parse_or(&get, "BACKLOT_BACKOFF_BASE_MS", Some(1_000))?),
            Duration::from_millis(parse_or(&get, "BACKLOT_BACKOFF_MAX_MS", Some(300_000))?),
        )
        .with_unroutable_delay(Duration::from_secs(parse_or(
            &get,
            "BACKLOT_UNROUTABLE_DELAY_SECS",
            Some(3_600),
        )?));
        retry
            .validate()
            .map_err(|e| invalid("BACKLOT_BACKOFF_*", "retry policy", e))?;

        let profiles = match get("BACKLOT_RATE_LIMIT_PROFILES") {
            Some(json) => RateLimitProfiles::default()
                .with_json_overrides(&json)
                .map_err(|e| invalid("BACKLOT_RATE_LIMIT_PROFILES", &json, e))?,
            None => RateLimitProfiles::default(),
        };

        let redis_timeout =
            Duration::from_millis(parse_or(&get, "BACKLOT_REDIS_TIMEOUT_MS", Some(500))?);
        if redis_timeout.is_zero() {
            return Err(invalid("BACKLOT_REDIS_TIMEOUT_MS", "0", "must be > 0"));
        }

        Ok(Self {
            listen_addr,
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            redis_timeout,
            dispatcher,
            retry,
            profiles,
        })
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw.trim().parse().map_err(|e| invalid(var, &raw, e)),
        None => default.ok_or_else(|| invalid(var, "", "required")),
    }
}

fn invalid(var: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
