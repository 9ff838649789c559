//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value outside its allowed range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Environment variable that overrides the output base path
pub const NAS_PATH_ENV: &str = "NAS_PATH";

/// Shortest CPU sampling window accepted
pub const MIN_CPU_SAMPLE_INTERVAL_MS: u64 = 1000;

/// Shortest pause between resource checks while dispatch is denied
pub const MIN_BLOCKED_BACKOFF_MS: u64 = 100;

/// Host resource thresholds gating job dispatch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Dispatch only while CPU load is strictly below this percentage
    #[serde(default = "default_cpu_max_percent")]
    pub cpu_max_percent: f32,
    /// Dispatch only while memory usage is strictly below this percentage
    #[serde(default = "default_mem_max_percent")]
    pub mem_max_percent: f32,
    /// Dispatch only while free disk space is strictly above this percentage
    #[serde(default = "default_disk_min_free_percent")]
    pub disk_min_free_percent: f32,
    /// Path whose filesystem is checked for free space
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,
    /// Window over which CPU load is averaged, in milliseconds
    #[serde(default = "default_cpu_sample_interval_ms")]
    pub cpu_sample_interval_ms: u64,
}

fn default_cpu_max_percent() -> f32 {
    75.0
}

fn default_mem_max_percent() -> f32 {
    75.0
}

fn default_disk_min_free_percent() -> f32 {
    10.0
}

fn default_disk_path() -> PathBuf {
    PathBuf::from("/")
}

fn default_cpu_sample_interval_ms() -> u64 {
    1000
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_max_percent: default_cpu_max_percent(),
            mem_max_percent: default_mem_max_percent(),
            disk_min_free_percent: default_disk_min_free_percent(),
            disk_path: default_disk_path(),
            cpu_sample_interval_ms: default_cpu_sample_interval_ms(),
        }
    }
}

impl ResourceConfig {
    pub fn cpu_sample_interval(&self) -> Duration {
        Duration::from_millis(self.cpu_sample_interval_ms)
    }
}

/// Control loop timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// How long a dequeue waits for work before the queue counts as drained
    /// (0 = wait indefinitely)
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
    /// Pause between resource checks while dispatch is denied
    #[serde(default = "default_blocked_backoff_ms")]
    pub blocked_backoff_ms: u64,
    /// Consecutive resource query failures tolerated before the loop aborts
    #[serde(default = "default_resource_error_limit")]
    pub resource_error_limit: u32,
}

fn default_dequeue_timeout_ms() -> u64 {
    5000
}

fn default_blocked_backoff_ms() -> u64 {
    2000
}

fn default_resource_error_limit() -> u32 {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            blocked_backoff_ms: default_blocked_backoff_ms(),
            resource_error_limit: default_resource_error_limit(),
        }
    }
}

impl SchedulerConfig {
    pub fn dequeue_timeout(&self) -> Option<Duration> {
        match self.dequeue_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn blocked_backoff(&self) -> Duration {
        Duration::from_millis(self.blocked_backoff_ms)
    }
}

/// Retry behaviour for failed encodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RetryConfig {
    /// Extra attempts granted to a job whose encode failed (0 = no retry)
    #[serde(default)]
    pub max_retries: u32,
}

/// Encoder invocation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// ffmpeg video codec
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Encoder preset
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Constant rate factor
    #[serde(default = "default_crf")]
    pub crf: u8,
    /// Output container extension
    #[serde(default = "default_container")]
    pub container: String,
}

fn default_video_codec() -> String {
    "libx265".to_string()
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_crf() -> u8 {
    24
}

fn default_container() -> String {
    "mkv".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            video_codec: default_video_codec(),
            preset: default_preset(),
            crf: default_crf(),
            container: default_container(),
        }
    }
}

/// Output location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Directory transcoded files are written to
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("/Volumes/Plex/Transcode")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
        }
    }
}

/// Event log settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Directory for the per-run log file
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Write a log file in addition to stderr
    #[serde(default = "default_log_to_file")]
    pub log_to_file: bool,
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_to_file() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_to_file: default_log_to_file(),
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and fills missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - SCHED_CPU_MAX_PERCENT -> resources.cpu_max_percent
    /// - SCHED_MEM_MAX_PERCENT -> resources.mem_max_percent
    /// - SCHED_DISK_MIN_FREE_PERCENT -> resources.disk_min_free_percent
    /// - SCHED_DISK_PATH -> resources.disk_path
    /// - SCHED_DEQUEUE_TIMEOUT_MS -> scheduler.dequeue_timeout_ms
    /// - SCHED_BLOCKED_BACKOFF_MS -> scheduler.blocked_backoff_ms
    /// - SCHED_MAX_RETRIES -> retry.max_retries
    /// - NAS_PATH -> output.base_path
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<f32>("SCHED_CPU_MAX_PERCENT") {
            self.resources.cpu_max_percent = v;
        }

        if let Some(v) = env_parse::<f32>("SCHED_MEM_MAX_PERCENT") {
            self.resources.mem_max_percent = v;
        }

        if let Some(v) = env_parse::<f32>("SCHED_DISK_MIN_FREE_PERCENT") {
            self.resources.disk_min_free_percent = v;
        }

        if let Some(v) = env_path("SCHED_DISK_PATH") {
            self.resources.disk_path = v;
        }

        if let Some(v) = env_parse::<u64>("SCHED_DEQUEUE_TIMEOUT_MS") {
            self.scheduler.dequeue_timeout_ms = v;
        }

        if let Some(v) = env_parse::<u64>("SCHED_BLOCKED_BACKOFF_MS") {
            self.scheduler.blocked_backoff_ms = v;
        }

        if let Some(v) = env_parse::<u32>("SCHED_MAX_RETRIES") {
            self.retry.max_retries = v;
        }

        if let Some(v) = env_path(NAS_PATH_ENV) {
            self.output.base_path = v;
        }
    }

    /// Check that every value is usable by the scheduler
    ///
    /// - Percentages must lie within 0-100
    /// - CPU sampling must cover at least MIN_CPU_SAMPLE_INTERVAL_MS
    /// - Blocked backoff must be at least MIN_BLOCKED_BACKOFF_MS
    /// - At least one resource query failure must be allowed to count
    pub fn validate(&self) -> Result<(), ConfigError> {
        let percentages = [
            ("resources.cpu_max_percent", self.resources.cpu_max_percent),
            ("resources.mem_max_percent", self.resources.mem_max_percent),
            (
                "resources.disk_min_free_percent",
                self.resources.disk_min_free_percent,
            ),
        ];
        for (name, value) in percentages {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 0 and 100, got {}",
                    name, value
                )));
            }
        }

        if self.resources.cpu_sample_interval_ms < MIN_CPU_SAMPLE_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "resources.cpu_sample_interval_ms must be at least {}, got {}",
                MIN_CPU_SAMPLE_INTERVAL_MS, self.resources.cpu_sample_interval_ms
            )));
        }

        if self.scheduler.blocked_backoff_ms < MIN_BLOCKED_BACKOFF_MS {
            return Err(ConfigError::Invalid(format!(
                "scheduler.blocked_backoff_ms must be at least {}, got {}",
                MIN_BLOCKED_BACKOFF_MS, self.scheduler.blocked_backoff_ms
            )));
        }

        if self.scheduler.resource_error_limit == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.resource_error_limit must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults with environment overrides applied and validated
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}
