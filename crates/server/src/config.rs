//! Server configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `ORDERFLOW_DATABASE_URL` - `PostgreSQL` connection string (falls back to `DATABASE_URL`)
//!
//! ## Optional
//! - `ORDERFLOW_HOST` - Bind address (default: 127.0.0.1)
//! - `ORDERFLOW_PORT` - Listen port (default: 8080)
//! - `ORDERFLOW_DB_MAX_CONNECTIONS` - Pool size (default: 10)
//! - `ORDERFLOW_STREAM_TOPIC` - Topic the consumer reads (default: orders)
//! - `ORDERFLOW_CONSUMER_GROUP` - Consumer group identity (default: order-consumers)
//! - `ORDERFLOW_POLL_INTERVAL_MS` - Fallback poll interval while idle (default: 1000)
//! - `ORDERFLOW_MESSAGE_TIMEOUT_SECS` - Per-message processing timeout, 0 disables (default: 30)
//! - `ORDERFLOW_LOG_FORMAT` - `text` or `json` (default: text)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server application configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: SecretString,
    /// Maximum number of pooled database connections
    pub db_max_connections: u32,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Ingestion stream settings
    pub stream: StreamConfig,
    /// Log output format
    pub log_format: LogFormat,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment name
    pub sentry_environment: Option<String>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("database_url", &"[REDACTED]")
            .field("db_max_connections", &self.db_max_connections)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("stream", &self.stream)
            .field("log_format", &self.log_format)
            .field("sentry_dsn", &self.sentry_dsn.as_ref().map(|_| "[REDACTED]"))
            .field("sentry_environment", &self.sentry_environment)
            .finish()
    }
}

/// Ingestion stream configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Topic the consumer reads order messages from
    pub topic: String,
    /// Consumer group whose committed offset governs redelivery
    pub consumer_group: String,
    /// How long an idle fetch waits before re-checking the stream
    pub poll_interval: Duration,
    /// Upper bound on processing a single message
    pub message_timeout: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            topic: "orders".to_owned(),
            consumer_group: "order-consumers".to_owned(),
            poll_interval: Duration::from_millis(1000),
            message_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let database_url = env
            .get("ORDERFLOW_DATABASE_URL")
            .or_else(|| env.get("DATABASE_URL"))
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("ORDERFLOW_DATABASE_URL".to_string()))?;

        let host = env.parse_or("ORDERFLOW_HOST", "127.0.0.1")?;
        let port = env.parse_or("ORDERFLOW_PORT", "8080")?;
        let db_max_connections = env.parse_or("ORDERFLOW_DB_MAX_CONNECTIONS", "10")?;

        let defaults = StreamConfig::default();
        let poll_interval_ms: u64 = env.parse_or("ORDERFLOW_POLL_INTERVAL_MS", "1000")?;
        let message_timeout_secs: u64 = env.parse_or("ORDERFLOW_MESSAGE_TIMEOUT_SECS", "30")?;
        let stream = StreamConfig {
            topic: env.get("ORDERFLOW_STREAM_TOPIC").unwrap_or(defaults.topic),
            consumer_group: env
                .get("ORDERFLOW_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
            message_timeout: (message_timeout_secs > 0)
                .then(|| Duration::from_secs(message_timeout_secs)),
        };

        let log_format = match env.get("ORDERFLOW_LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidEnvVar(
                    "ORDERFLOW_LOG_FORMAT".to_string(),
                    format!("expected `text` or `json`, got `{other}`"),
                ));
            }
        };

        Ok(Self {
            database_url,
            db_max_connections,
            host,
            port,
            stream,
            log_format,
            sentry_dsn: env.get("SENTRY_DSN"),
            sentry_environment: env.get("SENTRY_ENVIRONMENT"),
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Get a variable, treating empty values as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.is_empty())
    }

    /// Parse a variable, falling back to a default value.
    fn parse_or<T>(&self, key: &str, default: &str) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .as_deref()
            .unwrap_or(default)
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_missing_database_url() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "ORDERFLOW_DATABASE_URL"));
    }

    #[test]
    fn test_database_url_fallback() {
        let config = load(&[("DATABASE_URL", "postgres://fallback/db")]).unwrap();
        assert_eq!(config.database_url.expose_secret(), "postgres://fallback/db");
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("ORDERFLOW_DATABASE_URL", "postgres://localhost/orders")]).unwrap();
        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:8080");
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.stream, StreamConfig::default());
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.sentry_dsn.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("ORDERFLOW_DATABASE_URL", "postgres://localhost/orders"),
            ("ORDERFLOW_HOST", "0.0.0.0"),
            ("ORDERFLOW_PORT", "9000"),
            ("ORDERFLOW_STREAM_TOPIC", "orders-v2"),
            ("ORDERFLOW_CONSUMER_GROUP", "billing"),
            ("ORDERFLOW_POLL_INTERVAL_MS", "250"),
            ("ORDERFLOW_MESSAGE_TIMEOUT_SECS", "0"),
            ("ORDERFLOW_LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:9000");
        assert_eq!(config.stream.topic, "orders-v2");
        assert_eq!(config.stream.consumer_group, "billing");
        assert_eq!(config.stream.poll_interval, Duration::from_millis(250));
        assert_eq!(config.stream.message_timeout, None);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_port() {
        let err = load(&[
            ("ORDERFLOW_DATABASE_URL", "postgres://localhost/orders"),
            ("ORDERFLOW_PORT", "not-a-port"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar(ref key, _) if key == "ORDERFLOW_PORT"));
    }

    #[test]
    fn test_invalid_log_format() {
        let err = load(&[
            ("ORDERFLOW_DATABASE_URL", "postgres://localhost/orders"),
            ("ORDERFLOW_LOG_FORMAT", "xml"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar(_, _)));
    }

    #[test]
    fn test_debug_redacts_database_url() {
        let config = load(&[("ORDERFLOW_DATABASE_URL", "postgres://user:hunter2@db/orders")]).unwrap();
        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
    }
}
