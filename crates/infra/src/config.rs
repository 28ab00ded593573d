//! Process configuration from `CAIRN_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::command_processor::ProcessorConfig;
use crate::retry::RetryPolicy;
use crate::snapshot::SnapshotStrategy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Number of concurrent command workers.
    pub concurrency: usize,
    pub lease_renew_interval: Duration,
    /// Lease duration handed out by the in-process dispatcher.
    pub lease_duration: Duration,
    pub acknowledge_retries: u32,
    pub publish_retries: u32,
    pub lock_ttl: Duration,
    pub lock_backoff: Duration,
    pub snapshot_strategy: SnapshotStrategy,
    pub max_conflict_retries: u32,
    pub redis_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            lease_renew_interval: Duration::from_millis(5_000),
            lease_duration: Duration::from_millis(15_000),
            acknowledge_retries: 5,
            publish_retries: 5,
            lock_ttl: Duration::from_millis(15_000),
            lock_backoff: Duration::from_millis(100),
            snapshot_strategy: SnapshotStrategy::default(),
            max_conflict_retries: 0,
            redis_url: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup. Unset or blank variables
    /// fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let revision_limit = parse(&get, "CAIRN_SNAPSHOT_REVISION_LIMIT", 100u64)?;
        let duration_limit = Duration::from_millis(parse(&get, "CAIRN_SNAPSHOT_DURATION_LIMIT_MS", 500u64)?);
        let snapshot_strategy = match get("CAIRN_SNAPSHOT_STRATEGY") {
            None => SnapshotStrategy::Lowest {
                revision_limit,
                duration_limit,
            },
            Some(name) => SnapshotStrategy::from_name(&name, revision_limit, duration_limit).ok_or_else(|| {
                ConfigError::Invalid {
                    var: "CAIRN_SNAPSHOT_STRATEGY",
                    reason: format!("unknown strategy '{name}' (expected never, always, revision, duration or lowest)"),
                }
            })?,
        };

        let config = Self {
            concurrency: parse(&get, "CAIRN_CONCURRENT_COMMANDS", defaults.concurrency)?,
            lease_renew_interval: millis(&get, "CAIRN_LEASE_RENEW_INTERVAL_MS", defaults.lease_renew_interval)?,
            lease_duration: millis(&get, "CAIRN_LEASE_DURATION_MS", defaults.lease_duration)?,
            acknowledge_retries: parse(&get, "CAIRN_ACKNOWLEDGE_RETRIES", defaults.acknowledge_retries)?,
            publish_retries: parse(&get, "CAIRN_PUBLISH_RETRIES", defaults.publish_retries)?,
            lock_ttl: millis(&get, "CAIRN_LOCK_TTL_MS", defaults.lock_ttl)?,
            lock_backoff: millis(&get, "CAIRN_LOCK_BACKOFF_MS", defaults.lock_backoff)?,
            snapshot_strategy,
            max_conflict_retries: parse(&get, "CAIRN_MAX_CONFLICT_RETRIES", defaults.max_conflict_retries)?,
            redis_url: get("CAIRN_REDIS_URL"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "CAIRN_CONCURRENT_COMMANDS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.lease_renew_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "CAIRN_LEASE_RENEW_INTERVAL_MS",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.lease_renew_interval >= self.lock_ttl {
            return Err(ConfigError::Invalid {
                var: "CAIRN_LEASE_RENEW_INTERVAL_MS",
                reason: format!("must be shorter than the lock TTL ({} ms)", self.lock_ttl.as_millis()),
            });
        }
        if self.lease_renew_interval >= self.lease_duration {
            return Err(ConfigError::Invalid {
                var: "CAIRN_LEASE_RENEW_INTERVAL_MS",
                reason: format!("must be shorter than the lease duration ({} ms)", self.lease_duration.as_millis()),
            });
        }
        Ok(())
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        let defaults = ProcessorConfig::default();
        ProcessorConfig {
            lease_renew_interval: self.lease_renew_interval,
            lock_ttl: self.lock_ttl,
            lock_backoff: self.lock_backoff,
            max_conflict_retries: self.max_conflict_retries,
            publish_retry: RetryPolicy {
                max_attempts: self.publish_retries,
                ..defaults.publish_retry
            },
            acknowledge_retry: RetryPolicy {
                max_attempts: self.acknowledge_retries,
                ..defaults.acknowledge_retry
            },
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: format!("'{raw}': {e}"),
        }),
    }
}

fn millis(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse(get, var, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServerConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = from(&[]).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(
            config.snapshot_strategy,
            SnapshotStrategy::Lowest {
                revision_limit: 100,
                duration_limit: Duration::from_millis(500)
            }
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from(&[
            ("CAIRN_CONCURRENT_COMMANDS", "8"),
            ("CAIRN_LEASE_RENEW_INTERVAL_MS", "1000"),
            ("CAIRN_SNAPSHOT_STRATEGY", "revision"),
            ("CAIRN_SNAPSHOT_REVISION_LIMIT", "5"),
            ("CAIRN_MAX_CONFLICT_RETRIES", "3"),
            ("CAIRN_REDIS_URL", "redis://localhost:6379"),
        ])
        .unwrap();

        assert_eq!(config.concurrency, 8);
        assert_eq!(config.lease_renew_interval, Duration::from_secs(1));
        assert_eq!(config.snapshot_strategy, SnapshotStrategy::Revision { limit: 5 });
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));

        let processor = config.processor_config();
        assert_eq!(processor.max_conflict_retries, 3);
        assert_eq!(processor.publish_retry.max_attempts, 5);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = from(&[("CAIRN_CONCURRENT_COMMANDS", "  "), ("CAIRN_REDIS_URL", "")]).unwrap();
        assert_eq!(config.concurrency, 100);
        assert_eq!(config.redis_url, None);
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let err = from(&[("CAIRN_CONCURRENT_COMMANDS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CAIRN_CONCURRENT_COMMANDS", .. }));
    }

    #[test]
    fn renew_interval_must_be_shorter_than_lock_ttl() {
        let err = from(&[("CAIRN_LEASE_RENEW_INTERVAL_MS", "20000")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CAIRN_LEASE_RENEW_INTERVAL_MS", .. }));
    }

    #[test]
    fn garbage_is_reported_with_the_variable_name() {
        let err = from(&[("CAIRN_LOCK_TTL_MS", "soon")]).unwrap_err();
        assert_eq!(err.to_string().split(':').next(), Some("invalid value for CAIRN_LOCK_TTL_MS"));

        let err = from(&[("CAIRN_SNAPSHOT_STRATEGY", "sometimes")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CAIRN_SNAPSHOT_STRATEGY", .. }));
    }
}
