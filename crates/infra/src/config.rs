//! Configuration loaded from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `DATABASE_URL` | unset: in-memory backend |
//! | `DATABASE_MAX_CONNECTIONS` | `10` |
//! | `HTTP_ADDR` | `0.0.0.0:8080` |
//! | `OUTBOX_ENABLED` | `true` |
//! | `OUTBOX_WORKERS` | `2` |
//! | `OUTBOX_BATCH_SIZE` | `100` |
//! | `OUTBOX_WAIT_TIME_MS` | `1000` |
//! | `OUTBOX_IN_PROGRESS_TTL_MS` | `30000` |
//! | `OUTBOX_BOOK_SEND_URL` | unset: no `book` handler |
//! | `OUTBOX_AUTHOR_SEND_URL` | unset: no `author` handler |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::outbox::DispatcherConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Postgres URL; `None` selects the in-memory backend.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub http_addr: SocketAddr,
    pub outbox: OutboxConfig,
}

/// Dispatcher knobs and delivery endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    pub enabled: bool,
    pub workers: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub book_send_url: Option<String>,
    pub author_send_url: Option<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            batch_size: 100,
            poll_interval: Duration::from_millis(1000),
            lease_ttl: Duration::from_millis(30_000),
            book_send_url: None,
            author_send_url: None,
        }
    }
}

impl OutboxConfig {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_workers(self.workers)
            .with_batch_size(self.batch_size)
            .with_poll_interval(self.poll_interval)
            .with_lease_ttl(self.lease_ttl)
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = OutboxConfig::default();

        let outbox = OutboxConfig {
            enabled: parse_bool("OUTBOX_ENABLED", get("OUTBOX_ENABLED"), defaults.enabled)?,
            workers: parse_positive("OUTBOX_WORKERS", get("OUTBOX_WORKERS"), defaults.workers)?,
            batch_size: parse_positive(
                "OUTBOX_BATCH_SIZE",
                get("OUTBOX_BATCH_SIZE"),
                defaults.batch_size,
            )?,
            poll_interval: parse_millis(
                "OUTBOX_WAIT_TIME_MS",
                get("OUTBOX_WAIT_TIME_MS"),
                defaults.poll_interval,
            )?,
            lease_ttl: parse_positive_millis(
                "OUTBOX_IN_PROGRESS_TTL_MS",
                get("OUTBOX_IN_PROGRESS_TTL_MS"),
                defaults.lease_ttl,
            )?,
            book_send_url: get("OUTBOX_BOOK_SEND_URL"),
            author_send_url: get("OUTBOX_AUTHOR_SEND_URL"),
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            database_max_connections: parse_positive(
                "DATABASE_MAX_CONNECTIONS",
                get("DATABASE_MAX_CONNECTIONS"),
                10u32,
            )?,
            http_addr: parse_value("HTTP_ADDR", get("HTTP_ADDR"), SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            outbox,
        })
    }
}

fn parse_value<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(name, &raw, e.to_string())),
    }
}

fn parse_positive<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value = parse_value(name, raw.clone(), default)?;
    if value <= T::default() {
        return Err(ConfigError::invalid(
            name,
            raw.as_deref().unwrap_or_default(),
            "must be at least 1",
        ));
    }
    Ok(value)
}

fn parse_millis(
    name: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match raw {
        None => Ok(default),
        Some(raw) => parse_value::<u64>(name, Some(raw), 0).map(Duration::from_millis),
    }
}

/// A zero lease would make every in-flight message due again on the next cycle.
fn parse_positive_millis(
    name: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match raw {
        None => Ok(default),
        Some(raw) => parse_positive::<u64>(name, Some(raw), 0).map(Duration::from_millis),
    }
}

fn parse_bool(name: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(name, &raw, "expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.database_url, None);
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.outbox, OutboxConfig::default());
        assert_eq!(config.outbox.dispatcher_config().batch_size, 100);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/library"),
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("OUTBOX_ENABLED", "false"),
            ("OUTBOX_WORKERS", "8"),
            ("OUTBOX_WAIT_TIME_MS", "250"),
            ("OUTBOX_IN_PROGRESS_TTL_MS", "5000"),
            ("OUTBOX_BOOK_SEND_URL", "http://indexer/books"),
        ])
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/library"));
        assert_eq!(config.http_addr.port(), 9000);
        assert!(!config.outbox.enabled);
        assert_eq!(config.outbox.workers, 8);
        assert_eq!(config.outbox.poll_interval, Duration::from_millis(250));
        assert_eq!(config.outbox.lease_ttl, Duration::from_secs(5));
        assert_eq!(config.outbox.book_send_url.as_deref(), Some("http://indexer/books"));
        assert_eq!(config.outbox.author_send_url, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = load(&[("OUTBOX_WORKERS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "OUTBOX_WORKERS", .. }));

        let err = load(&[("OUTBOX_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "OUTBOX_BATCH_SIZE", .. }));

        let err = load(&[("OUTBOX_ENABLED", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("OUTBOX_ENABLED"));
    }

    #[test]
    fn zero_lease_ttl_is_rejected() {
        let err = load(&[("OUTBOX_IN_PROGRESS_TTL_MS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "OUTBOX_IN_PROGRESS_TTL_MS", .. }));

        let config = load(&[("OUTBOX_IN_PROGRESS_TTL_MS", "1")]).unwrap();
        assert_eq!(config.outbox.lease_ttl, Duration::from_millis(1));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = load(&[("DATABASE_URL", "  "), ("OUTBOX_WORKERS", "")]).unwrap();
        assert_eq!(config.database_url, None);
        assert_eq!(config.outbox.workers, 2);
    }
}
