//! Process configuration read from environment variables.
//!
//! | variable | default |
//! |----------|---------|
//! | `DATABASE_URL` | unset (in-memory store) |
//! | `DATABASE_MAX_CONNECTIONS` | `10` |
//! | `BIND_ADDR` | `0.0.0.0:8080` |
//! | `JOB_SCHEDULER_ENABLED` | `true` |
//! | `JOB_CRITICAL_INTERVAL_MS` | `5000` |
//! | `JOB_STANDARD_INTERVAL_MS` | `30000` |
//! | `JOB_TIMEOUT_MS` | `300000` |
//! | `JOB_WAITING_BACKOFF_MS` | `300000` |
//! | `JOB_TIMEOUT_BACKOFF_MS` | `60000` |
//! | `JOB_CANCEL_HANDLERS_ON_SHUTDOWN` | `false` |
//! | `JOB_DEFAULT_MAX_ATTEMPTS` | `5` |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::executor::ExecutorConfig;
use crate::jobs::scheduler::SchedulerConfig;
use crate::jobs::types::DEFAULT_MAX_ATTEMPTS;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Postgres connection string; `None` runs against the in-memory store
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub scheduler_enabled: bool,
    /// `max_attempts` stored on jobs enqueued without one
    pub default_max_attempts: u32,
    pub scheduler: SchedulerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            scheduler_enabled: true,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let executor = ExecutorConfig {
            job_timeout: millis(&get, "JOB_TIMEOUT_MS", defaults.scheduler.executor.job_timeout)?,
            waiting_backoff: millis(
                &get,
                "JOB_WAITING_BACKOFF_MS",
                defaults.scheduler.executor.waiting_backoff,
            )?,
            timeout_backoff: millis(
                &get,
                "JOB_TIMEOUT_BACKOFF_MS",
                defaults.scheduler.executor.timeout_backoff,
            )?,
        };

        let scheduler = SchedulerConfig {
            critical_interval: millis(
                &get,
                "JOB_CRITICAL_INTERVAL_MS",
                defaults.scheduler.critical_interval,
            )?,
            standard_interval: millis(
                &get,
                "JOB_STANDARD_INTERVAL_MS",
                defaults.scheduler.standard_interval,
            )?,
            executor,
            cancel_handlers_on_shutdown: flag(
                &get,
                "JOB_CANCEL_HANDLERS_ON_SHUTDOWN",
                defaults.scheduler.cancel_handlers_on_shutdown,
            )?,
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            database_max_connections: parsed(
                &get,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            bind_addr: parsed(&get, "BIND_ADDR", defaults.bind_addr)?,
            scheduler_enabled: flag(&get, "JOB_SCHEDULER_ENABLED", defaults.scheduler_enabled)?,
            default_max_attempts: parsed(
                &get,
                "JOB_DEFAULT_MAX_ATTEMPTS",
                defaults.default_max_attempts,
            )?,
            scheduler,
        })
    }
}

fn parsed<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn millis<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    let ms: u64 = parsed(get, var, default_ms)?;
    if ms == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

fn flag<G>(get: &G, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.scheduler.critical_interval, Duration::from_secs(5));
        assert_eq!(cfg.scheduler.standard_interval, Duration::from_secs(30));
        assert_eq!(cfg.scheduler.executor.job_timeout, Duration::from_secs(300));
        assert_eq!(cfg.scheduler.executor.timeout_backoff, Duration::from_secs(60));
        assert_eq!(cfg.default_max_attempts, 5);
    }

    #[test]
    fn reads_overrides() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://localhost/clinicflow"),
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("JOB_SCHEDULER_ENABLED", "false"),
            ("JOB_CRITICAL_INTERVAL_MS", "1000"),
            ("JOB_TIMEOUT_MS", " 2500 "),
            ("JOB_DEFAULT_MAX_ATTEMPTS", "3"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
        ])
        .unwrap();

        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/clinicflow"));
        assert_eq!(cfg.bind_addr.port(), 9000);
        assert!(!cfg.scheduler_enabled);
        assert_eq!(cfg.scheduler.critical_interval, Duration::from_millis(1000));
        assert_eq!(cfg.scheduler.executor.job_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.default_max_attempts, 3);
        assert_eq!(cfg.database_max_connections, 4);
    }

    #[test]
    fn empty_values_fall_back_to_defaults() {
        let cfg = config(&[("DATABASE_URL", ""), ("JOB_TIMEOUT_MS", "  ")]).unwrap();
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.scheduler.executor.job_timeout, Duration::from_secs(300));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = config(&[("JOB_STANDARD_INTERVAL_MS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "JOB_STANDARD_INTERVAL_MS", .. }));

        let err = config(&[("JOB_CRITICAL_INTERVAL_MS", "0")]).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));

        assert!(config(&[("JOB_SCHEDULER_ENABLED", "maybe")]).is_err());
        assert!(config(&[("BIND_ADDR", "nowhere")]).is_err());
    }
}
