//! Configuration for the loader service.
//!
//! Values are layered: built-in defaults, optional config files, `LOADER__*`
//! environment variables, and finally the flat variables (`DB_HOST`,
//! `DIRECTORY_TO_WATCH`, ...) that existing deployments already export.

use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the loader service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Watched directory configuration
    #[serde(default)]
    pub watcher: WatcherConfig,
    /// Batching and retry configuration
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port, 0 disables the exporter
    #[serde(default)]
    pub metrics_port: u16,
    /// How long to wait for in-flight files after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// PostgreSQL connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default = "default_db_password")]
    pub password: String,
    /// Target database, created at startup if absent
    #[serde(default = "default_db_name")]
    pub name: String,
    /// Database used to issue `CREATE DATABASE`
    #[serde(default = "default_maintenance_database")]
    pub maintenance_database: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// How long a writer waits for a free connection before the attempt fails
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// Watched directory configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Directory receiving drop files (watched non-recursively)
    #[serde(default = "default_watch_directory")]
    pub directory: PathBuf,
    /// Capacity of the notification queue between watcher and dispatcher
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Dispatch files already present at startup
    #[serde(default)]
    pub scan_existing: bool,
}

/// Batching and retry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Maximum records per committed batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Total write attempts per batch (first try included)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Fixed delay between write attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Decoded records buffered between the file reader and the writer
    #[serde(default = "default_parse_buffer")]
    pub parse_buffer: usize,
}

// Default value functions
fn default_service_name() -> String {
    "loader-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_db_password() -> String {
    "postgres".to_string()
}

fn default_db_name() -> String {
    "vehicles_db".to_string()
}

fn default_maintenance_database() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_watch_directory() -> PathBuf {
    PathBuf::from("/data")
}

fn default_queue_capacity() -> usize {
    256
}

fn default_batch_size() -> usize {
    1000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_parse_buffer() -> usize {
    1024
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: 0,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            password: default_db_password(),
            name: default_db_name(),
            maintenance_database: default_maintenance_database(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            directory: default_watch_directory(),
            queue_capacity: default_queue_capacity(),
            scan_existing: false,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            parse_buffer: default_parse_buffer(),
        }
    }
}

/// Flat variable names kept for compatibility, mapped onto nested keys.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("DB_HOST", "database.host"),
    ("DB_PORT", "database.port"),
    ("DB_USER", "database.user"),
    ("DB_PASSWORD", "database.password"),
    ("DB_NAME", "database.name"),
    ("DIRECTORY_TO_WATCH", "watcher.directory"),
    ("BATCH_SIZE", "ingest.batch_size"),
];

impl Config {
    /// Load configuration from config files and the environment
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/loader").required(false))
            .add_source(config::File::with_name("/etc/loader/loader").required(false))
            // LOADER__DATABASE__HOST -> database.host
            .add_source(
                config::Environment::with_prefix("LOADER")
                    .separator("__")
                    .try_parsing(true),
            );

        for (var, key) in LEGACY_ENV {
            builder = builder.set_override_option(*key, std::env::var(var).ok())?;
        }

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.watcher.directory.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "watcher.directory".to_string(),
            ));
        }
        if self.database.host.is_empty() {
            return Err(ConfigValidationError::MissingField("database.host".to_string()));
        }
        if self.database.name.is_empty() {
            return Err(ConfigValidationError::MissingField("database.name".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.max_connections".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.min_connections".to_string(),
                message: "must not exceed max_connections".to_string(),
            });
        }
        if self.watcher.queue_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "watcher.queue_capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.ingest.batch_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.batch_size".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.ingest.retry_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.retry_attempts".to_string(),
                message: "at least one attempt is required".to_string(),
            });
        }
        if self.ingest.parse_buffer == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.parse_buffer".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Grace period for in-flight files at shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_grace_secs)
    }
}

impl DatabaseConfig {
    /// Pool acquire timeout as Duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Idle connection timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl IngestConfig {
    /// Retry policy applied to every batch write
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_delay_ms),
        )
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.ingest.batch_size, 1000);
        assert_eq!(config.ingest.retry_attempts, 3);
        assert_eq!(config.ingest.retry_delay_ms, 2000);
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.name, "vehicles_db");
        assert_eq!(config.watcher.directory, PathBuf::from("/data"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = IngestConfig::default().retry_policy();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = Config::default();
        config.ingest.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_retry_attempts_rejected() {
        let mut config = Config::default();
        config.ingest.retry_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_database_name() {
        let mut config = Config::default();
        config.database.name = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_pool_bounds() {
        let mut config = Config::default();
        config.database.min_connections = 10;
        config.database.max_connections = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                "[ingest]\nbatch_size = 10\n[watcher]\ndirectory = \"/tmp/drops\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.ingest.batch_size, 10);
        assert_eq!(config.ingest.retry_attempts, 3);
        assert_eq!(config.watcher.directory, PathBuf::from("/tmp/drops"));
        assert_eq!(config.database.host, "localhost");
    }
}
