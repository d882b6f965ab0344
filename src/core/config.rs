//! Configuration management for the persistent-memory engine
//!
//! This module handles all configuration settings with performance-optimized defaults.

use crate::constants;
use crate::core::error::{Error, Result};
use crate::mmio::Policy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backing store configuration
    pub storage: StorageConfig,

    /// Mapped-region engine tuning
    pub engine: EngineConfig,

    /// Pool allocator sizing
    pub allocator: AllocatorConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory that receives the process-private pool files
    pub pmem_path: PathBuf,

    /// msync flushed ranges at every persistence barrier
    pub sync_on_flush: bool,
}

/// Mapped-region engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Mapping size used when an empty file is opened
    pub default_map_size: u64,

    /// Minimum growth step; larger mappings double
    pub growth_base: u64,

    /// Largest size any region may grow to; fixes the radix root level
    pub max_region_size: u64,

    /// Logging policy of a freshly opened region
    pub default_policy: Policy,

    /// Re-select the policy from the read/write mix at every commit
    pub hybrid_logging: bool,

    /// Write share (percent) above which redo logging is selected
    pub write_ratio_threshold: u64,

    /// Period of the background checkpoint task (zero disables it)
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub checkpoint_period: Duration,
}

/// Pool allocator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Objects per refill/spill batch for nodes, records and log buffers
    pub skip_unit: usize,

    /// Objects per batch for mapping descriptors
    pub region_skip_unit: usize,

    /// Full batches a thread keeps in its collector before spilling one
    pub retained_batches: usize,

    /// Bytes reserved for log buffers in every granule class
    pub log_pool_bytes: u64,

    /// Radix node catalogue size
    pub node_count: usize,

    /// Log record catalogue size
    pub record_count: usize,

    /// Mapping descriptor catalogue size
    pub region_count: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format (pretty, compact, json)
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pmem_path: PathBuf::from(constants::DEFAULT_PMEM_PATH),
            sync_on_flush: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_map_size: constants::DEFAULT_MAP_SIZE,
            growth_base: constants::GROWTH_BASE,
            max_region_size: constants::MAX_REGION_SIZE,
            default_policy: Policy::Undo,
            hybrid_logging: true,
            write_ratio_threshold: constants::WRITE_RATIO_THRESHOLD,
            checkpoint_period: Duration::from_micros(constants::CHECKPOINT_PERIOD_US),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            skip_unit: constants::SKIP_UNIT,
            region_skip_unit: constants::REGION_SKIP_UNIT,
            retained_batches: constants::RETAINED_BATCHES,
            log_pool_bytes: constants::LOG_POOL_BYTES,
            node_count: constants::NODE_COUNT,
            record_count: constants::RECORD_COUNT,
            region_count: constants::REGION_COUNT,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and config file
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        // Try to load from config file first
        if let Ok(file_config) = Self::from_file(constants::CONFIG_FILE) {
            config = file_config;
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        // PMEM_PATH is honoured for compatibility with existing deployments
        if let Ok(path) = env::var("PMIO_PMEM_PATH").or_else(|_| env::var("PMEM_PATH")) {
            self.storage.pmem_path = PathBuf::from(path);
        }

        if let Ok(sync) = env::var("PMIO_SYNC_ON_FLUSH") {
            self.storage.sync_on_flush = sync.parse()
                .map_err(|e| Error::config(format!("Invalid sync_on_flush: {}", e)))?;
        }

        if let Ok(policy) = env::var("PMIO_POLICY") {
            self.engine.default_policy = policy.parse()?;
        }

        if let Ok(hybrid) = env::var("PMIO_HYBRID_LOGGING") {
            self.engine.hybrid_logging = hybrid.parse()
                .map_err(|e| Error::config(format!("Invalid hybrid_logging: {}", e)))?;
        }

        if let Ok(period) = env::var("PMIO_CHECKPOINT_PERIOD") {
            self.engine.checkpoint_period = parse_duration(&period).map_err(Error::config)?;
        }

        if let Ok(unit) = env::var("PMIO_SKIP_UNIT") {
            self.allocator.skip_unit = unit.parse()
                .map_err(|e| Error::config(format!("Invalid skip_unit: {}", e)))?;
        }

        if let Ok(bytes) = env::var("PMIO_LOG_POOL_BYTES") {
            self.allocator.log_pool_bytes = bytes.parse()
                .map_err(|e| Error::config(format!("Invalid log_pool_bytes: {}", e)))?;
        }

        if let Ok(level) = env::var("PMIO_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("PMIO_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.default_map_size == 0 || engine.default_map_size % (1 << constants::PAGE_SHIFT) != 0 {
            return Err(Error::config("default_map_size must be a non-zero multiple of 4 KiB"));
        }
        if engine.growth_base < engine.default_map_size {
            return Err(Error::config("growth_base must be at least default_map_size"));
        }
        if engine.max_region_size < engine.growth_base
            || engine.max_region_size > 1 << constants::GLOBAL_SHIFT
        {
            return Err(Error::config("max_region_size must lie between growth_base and 256 TiB"));
        }
        if engine.write_ratio_threshold > 100 {
            return Err(Error::config("write_ratio_threshold is a percentage (0-100)"));
        }

        let alloc = &self.allocator;
        if alloc.skip_unit == 0 || alloc.region_skip_unit == 0 {
            return Err(Error::config("batch sizes must be non-zero"));
        }
        if alloc.retained_batches == 0 {
            return Err(Error::config("retained_batches must be at least 1"));
        }
        if alloc.node_count < alloc.skip_unit || alloc.record_count < alloc.skip_unit {
            return Err(Error::config("node_count and record_count must hold at least one batch"));
        }
        if alloc.region_count < alloc.region_skip_unit {
            return Err(Error::config("region_count must hold at least one batch"));
        }
        let largest = 1u64 << constants::LEAF_SHIFT;
        if alloc.log_pool_bytes / largest < alloc.skip_unit as u64 {
            return Err(Error::config(
                "log_pool_bytes must hold at least one batch of the largest granule",
            ));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {},
            _ => return Err(Error::config("Invalid log level")),
        }
        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {},
            _ => return Err(Error::config("Invalid log format")),
        }

        Ok(())
    }
}

// For TOML parsing
use serde::de::{self, Deserializer, Visitor};
use serde::Serializer;
use std::fmt;

// Custom deserializer for Duration from string
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration string like '100us', '5ms' or '2s'")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            parse_duration(value).map_err(E::custom)
        }
    }

    deserializer.deserialize_str(DurationVisitor)
}

fn serialize_duration<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}us", value.as_micros()))
}

/// Parse durations such as `100us`, `5ms`, `2s`, `1m` or `1h`
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("Invalid duration: {}", s))?;
    match unit {
        "us" => Ok(Duration::from_micros(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("Unknown duration unit in {}", s)),
    }
}

#[cfg(test)]
impl Config {
    /// Small pools under `dir` with checkpointing left to the caller.
    pub(crate) fn for_tests(dir: &std::path::Path) -> Self {
        Config {
            storage: StorageConfig {
                pmem_path: dir.to_path_buf(),
                sync_on_flush: false,
            },
            engine: EngineConfig {
                default_map_size: 64 << 10,
                growth_base: 1 << 20,
                max_region_size: 64 << 20,
                default_policy: Policy::Undo,
                hybrid_logging: false,
                write_ratio_threshold: constants::WRITE_RATIO_THRESHOLD,
                checkpoint_period: Duration::ZERO,
            },
            allocator: AllocatorConfig {
                skip_unit: 16,
                region_skip_unit: 4,
                retained_batches: 2,
                log_pool_bytes: 32 << 20,
                node_count: 1024,
                record_count: 4096,
                region_count: 16,
            },
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validates() {
        // Goal: the compact test configuration passes validation
        let dir = tempfile::tempdir().unwrap();
        Config::for_tests(dir.path()).validate().unwrap();
    }

    #[test]
    fn defaults_validate() {
        // Goal: the shipped defaults form a valid configuration
        Config::default().validate().unwrap();
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("100us").unwrap(), Duration::from_micros(100));
        assert_eq!(parse_duration("5ms").unwrap(), Duration::from_millis(5));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn toml_partial_overrides_keep_defaults() {
        // Goal: sections and fields missing from the file fall back to defaults
        let cfg: Config = toml::from_str(
            r#"
            [engine]
            default_policy = "redo"
            checkpoint_period = "5ms"

            [allocator]
            skip_unit = 16
            "#,
        )
        .unwrap();
        assert_eq!(cfg.engine.default_policy, Policy::Redo);
        assert_eq!(cfg.engine.checkpoint_period, Duration::from_millis(5));
        assert_eq!(cfg.allocator.skip_unit, 16);
        assert_eq!(cfg.allocator.region_skip_unit, constants::REGION_SKIP_UNIT);
        assert_eq!(cfg.engine.growth_base, constants::GROWTH_BASE);
    }

    #[test]
    fn serialized_config_reloads() {
        let cfg = Config::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.engine.checkpoint_period, cfg.engine.checkpoint_period);
        assert_eq!(back.storage.pmem_path, cfg.storage.pmem_path);
    }

    #[test]
    fn validate_rejects_undersized_pools() {
        let mut cfg = Config::default();
        cfg.allocator.node_count = cfg.allocator.skip_unit - 1;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = Config::default();
        cfg.allocator.log_pool_bytes = 1 << 20;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().is_err());
    }
}
