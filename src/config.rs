//! Configuration types for forgepool.
//!
//! This module contains the per-pool sizing and timeout settings, the
//! per-domain defaults, the registry-wide configuration and the logging
//! setup used by applications embedding the pools.

use crate::error::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Sizing and timeout configuration for a single pool.
///
/// Immutable once the pool has been started.
///
/// # Examples
///
/// ```rust
/// use forgepool::config::PoolConfig;
///
/// // Use default configuration
/// let config = PoolConfig::default();
///
/// // Custom configuration
/// let config = PoolConfig::with_workers(1, 4)
///     .with_task_timeout(5_000)
///     .with_idle_timeout(10_000);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PoolConfigFile")]
pub struct PoolConfig {
    /// Workers kept alive at all times (while not shutting down)
    pub min_workers: usize,

    /// Upper bound on live workers
    pub max_workers: usize,

    /// How long a worker may sit idle before it is reclaimed (in milliseconds).
    /// Also the period of the idle sweep.
    pub idle_timeout_ms: u64,

    /// Default per-task timeout (in milliseconds)
    pub task_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::sized(num_cpus::get().max(1))
    }
}

/// Upper bound for `idle_timeout_ms` and `task_timeout_ms` (30 days).
pub const MAX_TIMEOUT_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Serialized form of [`PoolConfig`]: omitted fields are derived from the
/// ones present, so `{"max_workers": 2}` gets `min_workers = 1`.
#[derive(Deserialize)]
struct PoolConfigFile {
    min_workers: Option<usize>,
    max_workers: Option<usize>,
    idle_timeout_ms: Option<u64>,
    task_timeout_ms: Option<u64>,
}

impl From<PoolConfigFile> for PoolConfig {
    fn from(file: PoolConfigFile) -> Self {
        let max_workers = file
            .max_workers
            .unwrap_or_else(|| num_cpus::get().max(file.min_workers.unwrap_or(1)));
        let sized = PoolConfig::sized(max_workers);

        Self {
            min_workers: file.min_workers.unwrap_or(sized.min_workers),
            max_workers,
            idle_timeout_ms: file.idle_timeout_ms.unwrap_or(sized.idle_timeout_ms),
            task_timeout_ms: file.task_timeout_ms.unwrap_or(sized.task_timeout_ms),
        }
    }
}

impl PoolConfig {
    /// Configuration with `max_workers` set and `min_workers` at half of it.
    pub fn sized(max_workers: usize) -> Self {
        Self {
            min_workers: (max_workers / 2).max(1),
            max_workers,
            idle_timeout_ms: 30_000, // 30 seconds
            task_timeout_ms: 60_000, // 1 minute
        }
    }

    /// Create a configuration with explicit bounds.
    pub fn with_workers(min_workers: usize, max_workers: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            ..Default::default()
        }
    }

    /// Set the default task timeout.
    pub fn with_task_timeout(mut self, timeout_ms: u64) -> Self {
        self.task_timeout_ms = timeout_ms;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout_ms: u64) -> Self {
        self.idle_timeout_ms = timeout_ms;
        self
    }

    /// Idle timeout as a [`Duration`]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout_ms.millis()
    }

    /// Default task timeout as a [`Duration`]
    pub fn task_timeout(&self) -> Duration {
        self.task_timeout_ms.millis()
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.min_workers == 0 {
            errors.push("Minimum workers must be greater than 0".to_string());
        }

        if self.max_workers == 0 {
            errors.push("Maximum workers must be greater than 0".to_string());
        }

        if self.max_workers > 1000 {
            errors.push("Maximum workers should not exceed 1000".to_string());
        }

        if self.min_workers > self.max_workers {
            errors.push("Minimum workers must not exceed maximum workers".to_string());
        }

        if self.idle_timeout_ms == 0 {
            errors.push("Idle timeout must be greater than 0".to_string());
        }

        if self.idle_timeout_ms > MAX_TIMEOUT_MS {
            errors.push("Idle timeout must not exceed 30 days".to_string());
        }

        if self.task_timeout_ms == 0 {
            errors.push("Task timeout must be greater than 0".to_string());
        }

        if self.task_timeout_ms > MAX_TIMEOUT_MS {
            errors.push("Task timeout must not exceed 30 days".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// The task domains an application usually runs one pool for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolDomain {
    /// Image transformations (CPU-bound)
    Image,
    /// PDF assembly and conversion (CPU-bound)
    Pdf,
    /// QR code rendering (short CPU-bound)
    #[serde(rename = "qrcode")]
    QrCode,
    /// Media downloads (network-bound, long-running)
    Video,
    /// Anything else, e.g. hashing
    General,
}

impl PoolDomain {
    /// All known domains
    pub const ALL: [PoolDomain; 5] = [
        PoolDomain::Image,
        PoolDomain::Pdf,
        PoolDomain::QrCode,
        PoolDomain::Video,
        PoolDomain::General,
    ];

    /// The registry name of this domain
    pub fn name(&self) -> &'static str {
        match self {
            PoolDomain::Image => "image",
            PoolDomain::Pdf => "pdf",
            PoolDomain::QrCode => "qrcode",
            PoolDomain::Video => "video",
            PoolDomain::General => "general",
        }
    }

    /// Default pool configuration for this domain.
    pub fn default_config(&self) -> PoolConfig {
        let cpus = num_cpus::get().max(1);
        match self {
            PoolDomain::Image | PoolDomain::General => PoolConfig::sized(cpus),
            PoolDomain::Pdf => PoolConfig::sized((cpus / 2).max(1)).with_task_timeout(120_000),
            PoolDomain::QrCode => PoolConfig::sized((cpus / 2).max(1)).with_task_timeout(10_000),
            // Network-bound: few workers, very long tasks
            PoolDomain::Video => PoolConfig::sized((cpus / 4).max(2)).with_task_timeout(600_000),
        }
    }
}

impl fmt::Display for PoolDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for a whole [`PoolRegistry`](crate::core::registry::PoolRegistry).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Pool configurations by pool name
    pub pools: BTreeMap<String, PoolConfig>,

    /// Deadline handed to every pool on signal-driven shutdown (in milliseconds)
    pub shutdown_timeout_ms: u64,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            pools: BTreeMap::new(),
            shutdown_timeout_ms: 10_000, // 10 seconds
            logging: LoggingConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// One pool per [`PoolDomain`] with the domain defaults.
    pub fn standard() -> Self {
        let pools = PoolDomain::ALL
            .iter()
            .map(|domain| (domain.name().to_string(), domain.default_config()))
            .collect();

        Self {
            pools,
            ..Default::default()
        }
    }

    /// Parse a registry configuration from JSON.
    ///
    /// Missing fields fall back to their defaults; the result is validated.
    pub fn from_json(json: &str) -> PoolResult<Self> {
        let config: RegistryConfig = serde_json::from_str(json)?;
        config
            .validate()
            .map_err(|errors| PoolError::config(errors.join("; ")))?;
        Ok(config)
    }

    /// Set the configuration of a pool.
    pub fn with_pool(mut self, name: impl Into<String>, config: PoolConfig) -> Self {
        self.pools.insert(name.into(), config);
        self
    }

    /// Shutdown deadline as a [`Duration`]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout_ms.millis()
    }

    /// Validate every pool configuration, prefixing errors with the pool name.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (name, pool) in &self.pools {
            if let Err(pool_errors) = pool.validate() {
                errors.extend(pool_errors.into_iter().map(|e| format!("{}: {}", name, e)));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable colored output
    pub colored: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            colored: true,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

impl LoggingConfig {
    /// Install a global fmt subscriber for this configuration.
    ///
    /// Fails if a global subscriber has already been set.
    pub fn init(&self) -> PoolResult<()> {
        let builder = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::from(self.level))
            .with_ansi(self.colored)
            .with_target(self.include_targets);

        let result = if self.include_timestamps {
            builder.try_init()
        } else {
            builder.without_time().try_init()
        };

        result.map_err(|e| PoolError::config(format!("Failed to install subscriber: {}", e)))
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert!(config.max_workers >= 1);
        assert!(config.min_workers >= 1);
        assert!(config.min_workers <= config.max_workers);
        assert_eq!(config.idle_timeout_ms, 30_000);
        assert_eq!(config.task_timeout_ms, 60_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sized_min_is_half_of_max() {
        assert_eq!(PoolConfig::sized(8).min_workers, 4);
        assert_eq!(PoolConfig::sized(3).min_workers, 1);
        assert_eq!(PoolConfig::sized(1).min_workers, 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = PoolConfig::with_workers(2, 4);
        assert!(config.validate().is_ok());

        config.min_workers = 5;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("must not exceed")));

        config.min_workers = 0;
        config.task_timeout_ms = 0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_pool_config_builders() {
        let config = PoolConfig::with_workers(1, 4)
            .with_task_timeout(500)
            .with_idle_timeout(1000);

        assert_eq!(config.min_workers, 1);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.task_timeout(), Duration::from_millis(500));
        assert_eq!(config.idle_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_domain_defaults() {
        let video = PoolDomain::Video.default_config();
        let image = PoolDomain::Image.default_config();

        assert_eq!(video.task_timeout_ms, 600_000);
        assert!(video.task_timeout_ms > image.task_timeout_ms);
        assert!(video.max_workers >= 2);

        for domain in PoolDomain::ALL {
            assert!(domain.default_config().validate().is_ok(), "{}", domain);
        }
    }

    #[test]
    fn test_standard_registry_config() {
        let config = RegistryConfig::standard();
        assert_eq!(config.pools.len(), 5);
        assert!(config.pools.contains_key("qrcode"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_registry_config_from_json() {
        let config = RegistryConfig::from_json(
            r#"{
                "pools": {
                    "image": { "min_workers": 1, "max_workers": 2 },
                    "video": { "min_workers": 1, "max_workers": 2, "task_timeout_ms": 900000 }
                },
                "logging": { "level": "debug" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.pools["image"].max_workers, 2);
        assert_eq!(config.pools["image"].idle_timeout_ms, 30_000);
        assert_eq!(config.pools["video"].task_timeout_ms, 900_000);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_registry_config_rejects_invalid_pool() {
        let result = RegistryConfig::from_json(
            r#"{ "pools": { "pdf": { "min_workers": 3, "max_workers": 1 } } }"#,
        );

        match result {
            Err(PoolError::ConfigError { message }) => assert!(message.starts_with("pdf:")),
            other => panic!("Expected ConfigError, got: {:?}", other),
        }
    }

    #[test]
    fn test_duration_ext() {
        assert_eq!(1500u64.millis(), Duration::from_millis(1500));
    }

    #[test]
    fn test_timeouts_are_capped() {
        let config = PoolConfig::with_workers(1, 1).with_idle_timeout(u64::MAX);
        let errors = config.validate().unwrap_err();
        assert_eq!(errors, vec!["Idle timeout must not exceed 30 days".to_string()]);

        let config = PoolConfig::with_workers(1, 1).with_task_timeout(MAX_TIMEOUT_MS + 1);
        assert!(config.validate().is_err());

        let config = PoolConfig::with_workers(1, 1)
            .with_idle_timeout(MAX_TIMEOUT_MS)
            .with_task_timeout(MAX_TIMEOUT_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_pool_config_derives_min_from_max() {
        let config: PoolConfig = serde_json::from_str(r#"{"max_workers": 2}"#).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.min_workers, 1);
        assert_eq!(config.task_timeout_ms, 60_000);
        assert!(config.validate().is_ok());

        let config: PoolConfig = serde_json::from_str(r#"{"max_workers": 1}"#).unwrap();
        assert_eq!(config.min_workers, 1);

        let config: PoolConfig = serde_json::from_str(r#"{"min_workers": 3}"#).unwrap();
        assert!(config.max_workers >= 3);
        assert!(config.validate().is_ok());

        let config: PoolConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PoolConfig::default());
    }

    #[test]
    fn test_registry_config_with_max_only_pool() {
        let config =
            RegistryConfig::from_json(r#"{ "pools": { "video": { "max_workers": 2 } } }"#).unwrap();
        assert_eq!(config.pools["video"].min_workers, 1);
        assert_eq!(config.pools["video"].max_workers, 2);
    }
}
