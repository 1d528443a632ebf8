//! Configuration management for the motion imagery ingest service.
//!
//! Configuration is layered from optional TOML files and `INGEST_`-prefixed
//! environment variables, then validated before the stream starts.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// UDP stream configuration
    pub stream: StreamConfig,

    /// Segment rollover configuration
    #[serde(default)]
    pub rollover: RolloverConfig,

    /// Geometry reduction configuration
    #[serde(default)]
    pub geometry: GeometryConfig,

    /// Parent update retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Parent/child reconciliation configuration
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// UDP stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Local address to receive datagrams on (e.g., "0.0.0.0:50000")
    pub bind_address: String,

    /// Title given to the parent record
    #[serde(default = "default_title")]
    pub title: String,

    /// Maximum datagram size to receive
    #[serde(default = "default_receive_buffer_bytes")]
    pub receive_buffer_bytes: usize,

    /// Maximum number of bind attempts (0 = infinite)
    #[serde(default = "default_bind_retry_attempts")]
    pub bind_retry_attempts: u32,

    /// Base delay between bind attempts in milliseconds
    #[serde(default = "default_bind_retry_base_delay_ms")]
    pub bind_retry_base_delay_ms: u64,

    /// Maximum delay between bind attempts in milliseconds
    #[serde(default = "default_bind_retry_max_delay_ms")]
    pub bind_retry_max_delay_ms: u64,
}

/// Segment rollover configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RolloverConfig {
    /// Close a segment once it holds this many bytes
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: usize,

    /// Close a segment once it spans this many seconds
    #[serde(default = "default_max_segment_duration_secs")]
    pub max_segment_duration_secs: u64,

    /// Close a segment (and end the stream) after this long without data
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// How often the idle timer checks the packet buffer
    #[serde(default = "default_idle_check_interval_ms")]
    pub idle_check_interval_ms: u64,

    /// Number of concurrent rollover workers
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

/// Geometry reduction configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GeometryConfig {
    /// Maximum points kept in frame-center line strings
    #[serde(default = "default_subsample_count")]
    pub subsample_count: usize,

    /// Simplification tolerance in degrees (unset = remove redundant points only)
    #[serde(default)]
    pub distance_tolerance: Option<f64>,
}

/// Parent update retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first parent update attempt in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Wait after the first failed attempt in milliseconds
    #[serde(default = "default_initial_wait_ms")]
    pub initial_wait_ms: u64,

    /// Total time to keep retrying in seconds
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

/// Parent/child reconciliation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Children fetched per query page
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Consecutive query failures tolerated before a pass is abandoned
    #[serde(default = "default_max_query_errors")]
    pub max_query_errors: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

// Default value functions
fn default_title() -> String {
    "UDP Stream".to_string()
}
fn default_receive_buffer_bytes() -> usize {
    65_536
}
fn default_bind_retry_attempts() -> u32 {
    5
}
fn default_bind_retry_base_delay_ms() -> u64 {
    500
}
fn default_bind_retry_max_delay_ms() -> u64 {
    10_000
}
fn default_max_segment_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_max_segment_duration_secs() -> u64 {
    60
}
fn default_idle_timeout_ms() -> u64 {
    5_000
}
fn default_idle_check_interval_ms() -> u64 {
    500
}
fn default_worker_pool_size() -> usize {
    10
}
fn default_subsample_count() -> usize {
    1_000
}
fn default_initial_delay_ms() -> u64 {
    2_000
}
fn default_initial_wait_ms() -> u64 {
    1_000
}
fn default_max_wait_secs() -> u64 {
    300
}
fn default_batch_size() -> usize {
    50
}
fn default_max_query_errors() -> u32 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for RolloverConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: default_max_segment_bytes(),
            max_segment_duration_secs: default_max_segment_duration_secs(),
            idle_timeout_ms: default_idle_timeout_ms(),
            idle_check_interval_ms: default_idle_check_interval_ms(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            subsample_count: default_subsample_count(),
            distance_tolerance: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            initial_wait_ms: default_initial_wait_ms(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_query_errors: default_max_query_errors(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with INGEST_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g., INGEST_STREAM__BIND_ADDRESS
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.stream.bind_address.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "stream.bind_address".to_string(),
            ));
        }
        if self.stream.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigValidationError::InvalidValue {
                field: "stream.bind_address".to_string(),
                message: "Must be a socket address such as 0.0.0.0:50000".to_string(),
            });
        }

        if self.rollover.max_segment_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "rollover.max_segment_bytes".to_string(),
                message: "Segment size must be greater than 0".to_string(),
            });
        }
        if self.rollover.idle_timeout_ms == 0 || self.rollover.idle_check_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "rollover.idle_timeout_ms/idle_check_interval_ms".to_string(),
                message: "Idle timing must be greater than 0".to_string(),
            });
        }
        if self.rollover.worker_pool_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "rollover.worker_pool_size".to_string(),
                message: "Pool needs at least one worker".to_string(),
            });
        }

        if self.geometry.subsample_count < crate::reduce::MIN_SUBSAMPLE_COUNT {
            return Err(ConfigValidationError::InvalidValue {
                field: "geometry.subsample_count".to_string(),
                message: format!(
                    "Subsample count must be at least {}",
                    crate::reduce::MIN_SUBSAMPLE_COUNT
                ),
            });
        }
        if matches!(self.geometry.distance_tolerance, Some(t) if t < 0.0 || !t.is_finite()) {
            return Err(ConfigValidationError::InvalidValue {
                field: "geometry.distance_tolerance".to_string(),
                message: "Tolerance must be a non-negative number".to_string(),
            });
        }

        if self.retry.initial_wait_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "retry.initial_wait_ms".to_string(),
                message: "Initial wait must be greater than 0".to_string(),
            });
        }

        if self.reconcile.batch_size == 0 || self.reconcile.max_query_errors == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "reconcile.batch_size/max_query_errors".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl StreamConfig {
    /// Get base bind retry delay as Duration.
    pub fn bind_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.bind_retry_base_delay_ms)
    }

    /// Get maximum bind retry delay as Duration.
    pub fn bind_retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.bind_retry_max_delay_ms)
    }
}

impl RolloverConfig {
    pub fn max_segment_duration(&self) -> Duration {
        Duration::from_secs(self.max_segment_duration_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn initial_wait(&self) -> Duration {
        Duration::from_millis(self.initial_wait_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
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
pub(crate) mod tests {
    use super::*;

    pub(crate) fn create_test_config() -> IngestConfig {
        IngestConfig {
            stream: StreamConfig {
                bind_address: "127.0.0.1:0".to_string(),
                title: "Test Stream".to_string(),
                receive_buffer_bytes: 65_536,
                bind_retry_attempts: 1,
                bind_retry_base_delay_ms: 10,
                bind_retry_max_delay_ms: 100,
            },
            rollover: RolloverConfig::default(),
            geometry: GeometryConfig::default(),
            retry: RetryConfig {
                initial_delay_ms: 0,
                initial_wait_ms: 10,
                max_wait_secs: 1,
            },
            reconcile: ReconcileConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let rollover = RolloverConfig::default();
        assert_eq!(rollover.max_segment_bytes, 64 * 1024 * 1024);
        assert_eq!(rollover.idle_timeout(), Duration::from_secs(5));
        assert_eq!(rollover.worker_pool_size, 10);

        let retry = RetryConfig::default();
        assert_eq!(retry.initial_delay(), Duration::from_secs(2));
        assert_eq!(retry.initial_wait(), Duration::from_secs(1));
        assert_eq!(retry.max_wait(), Duration::from_secs(300));

        assert_eq!(ReconcileConfig::default().batch_size, 50);
        assert_eq!(GeometryConfig::default().subsample_count, 1000);
    }

    #[test]
    fn test_missing_bind_address() {
        let mut config = create_test_config();
        config.stream.bind_address = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_bind_address() {
        let mut config = create_test_config();
        config.stream.bind_address = "udp://0.0.0.0".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_subsample_count_minimum() {
        let mut config = create_test_config();
        config.geometry.subsample_count = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_negative_tolerance() {
        let mut config = create_test_config();
        config.geometry.distance_tolerance = Some(-0.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_empty_pool() {
        let mut config = create_test_config();
        config.rollover.worker_pool_size = 0;
        assert!(config.validate().is_err());
    }
}
