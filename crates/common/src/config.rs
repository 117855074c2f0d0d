use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

// Default constants
pub const DEFAULT_POOL_NAME: &str = "strata-worker";
pub const DEFAULT_MAX_THREADS: usize = 8;

pub const DEFAULT_MEMORY_CAP_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_SEGMENT_ROWS: usize = 1024;
pub const DEFAULT_WORKING_SET_SEGMENTS: usize = 1;

pub const DEFAULT_CACHE_ENABLED: bool = true;
pub const DEFAULT_CACHE_MAX_SIZE_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_CACHE_MAX_AGE_SECONDS: u64 = 300;
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 256;
pub const DEFAULT_MAX_POISONED_IDS: u64 = 10_000;

pub const DEFAULT_BATCH_ROWS: usize = 1024;
pub const DEFAULT_MAX_IN_FLIGHT_BATCHES: usize = 2;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 50;
pub const DEFAULT_MAX_DELAY_MS: u64 = 2000;

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Deserialize, Clone, Copy, Validate)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

#[derive(Debug, Deserialize, Default, Clone, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub pool: PoolSettings,
    #[serde(default)]
    #[validate(nested)]
    pub buffer: BufferSettings,
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheSettings,
    #[serde(default)]
    #[validate(nested)]
    pub query: QuerySettings,
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct PoolSettings {
    #[serde(default = "default_pool_name")]
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "default_max_threads")]
    #[validate(range(min = 1))]
    pub max_threads: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            max_threads: default_max_threads(),
        }
    }
}

fn default_pool_name() -> String {
    DEFAULT_POOL_NAME.to_string()
}

fn default_max_threads() -> usize {
    DEFAULT_MAX_THREADS
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct BufferSettings {
    #[serde(default = "default_memory_cap_bytes")]
    pub memory_cap_bytes: usize,

    /// Parent directory for spill files; the OS temp dir when unset.
    #[serde(default)]
    pub disk_spill_directory: Option<String>,

    #[serde(default = "default_segment_rows")]
    #[validate(range(min = 1))]
    pub segment_rows: usize,

    /// Most recent segments per buffer that are never spilled.
    #[serde(default = "default_working_set_segments")]
    pub working_set_segments: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            memory_cap_bytes: default_memory_cap_bytes(),
            disk_spill_directory: None,
            segment_rows: default_segment_rows(),
            working_set_segments: default_working_set_segments(),
        }
    }
}

fn default_memory_cap_bytes() -> usize {
    DEFAULT_MEMORY_CAP_BYTES
}

fn default_segment_rows() -> usize {
    DEFAULT_SEGMENT_ROWS
}

fn default_working_set_segments() -> usize {
    DEFAULT_WORKING_SET_SEGMENTS
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Mru,
    Fifo,
    Lfu,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheScope {
    /// Results are visible only to the session that produced them.
    #[default]
    Connection,
    /// Results are shared by every session on the same schema version.
    Schema,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Buffer,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SizeEstimation {
    #[default]
    Approximate,
    Exact,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct CacheSettings {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    #[serde(default = "default_cache_max_size_bytes")]
    #[validate(range(min = 1))]
    pub max_size_bytes: usize,

    /// Zero disables age-based expiry.
    #[serde(default = "default_cache_max_age_seconds")]
    pub max_age_seconds: u64,

    #[serde(default = "default_cache_max_entries")]
    #[validate(range(min = 1))]
    pub max_entries: usize,

    #[serde(default)]
    pub eviction_policy: EvictionPolicy,

    #[serde(default)]
    pub scope: CacheScope,

    #[serde(default)]
    pub backend: CacheBackend,

    #[serde(default)]
    pub size_estimation: SizeEstimation,

    #[serde(default = "default_max_poisoned_ids")]
    pub max_poisoned_ids: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_size_bytes: default_cache_max_size_bytes(),
            max_age_seconds: default_cache_max_age_seconds(),
            max_entries: default_cache_max_entries(),
            eviction_policy: EvictionPolicy::default(),
            scope: CacheScope::default(),
            backend: CacheBackend::default(),
            size_estimation: SizeEstimation::default(),
            max_poisoned_ids: default_max_poisoned_ids(),
        }
    }
}

impl CacheSettings {
    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_seconds > 0).then(|| Duration::from_secs(self.max_age_seconds))
    }
}

fn default_cache_enabled() -> bool {
    DEFAULT_CACHE_ENABLED
}

fn default_cache_max_size_bytes() -> usize {
    DEFAULT_CACHE_MAX_SIZE_BYTES
}

fn default_cache_max_age_seconds() -> u64 {
    DEFAULT_CACHE_MAX_AGE_SECONDS
}

fn default_cache_max_entries() -> usize {
    DEFAULT_CACHE_MAX_ENTRIES
}

fn default_max_poisoned_ids() -> u64 {
    DEFAULT_MAX_POISONED_IDS
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct QuerySettings {
    #[serde(default = "default_batch_rows")]
    #[validate(range(min = 1))]
    pub batch_rows: usize,

    #[serde(default = "default_max_in_flight_batches")]
    #[validate(range(min = 1))]
    pub max_in_flight_batches: usize,

    /// Wall-clock deadline per query; no deadline when unset.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            batch_rows: default_batch_rows(),
            max_in_flight_batches: default_max_in_flight_batches(),
            timeout_seconds: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QuerySettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_batch_rows() -> usize {
    DEFAULT_BATCH_ROWS
}

fn default_max_in_flight_batches() -> usize {
    DEFAULT_MAX_IN_FLIGHT_BATCHES
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

// Config implementation
impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        // Map STRATA__BUFFER__MEMORY_CAP_BYTES to buffer.memory_cap_bytes, etc.
        let builder = builder.add_source(
            config::Environment::with_prefix("STRATA")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;

        Ok(app_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_app_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let config = AppConfig {
            pool: PoolSettings {
                max_threads: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_reads_sections() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "pool:\n  max_threads: 3\nbuffer:\n  memory_cap_bytes: 4096\n  segment_rows: 16\ncache:\n  eviction_policy: lfu\n  backend: buffer\n  max_age_seconds: 0\nquery:\n  timeout_seconds: 30"
        )
        .unwrap();

        let config = AppConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.pool.max_threads, 3);
        assert_eq!(config.pool.name, DEFAULT_POOL_NAME);
        assert_eq!(config.buffer.memory_cap_bytes, 4096);
        assert_eq!(config.buffer.segment_rows, 16);
        assert_eq!(config.cache.eviction_policy, EvictionPolicy::Lfu);
        assert_eq!(config.cache.backend, CacheBackend::Buffer);
        assert_eq!(config.cache.max_age(), None);
        assert_eq!(config.query.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.retry.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AppConfig::from_file("does/not/exist.yaml").unwrap();
        assert_eq!(config.query.batch_rows, DEFAULT_BATCH_ROWS);
        assert!(config.cache.enabled);
        assert_eq!(config.telemetry.log_filter, DEFAULT_LOG_FILTER);
    }
}
