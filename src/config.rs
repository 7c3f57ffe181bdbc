//! Pipeline configuration
//!
//! Values come from (in increasing priority) built-in defaults, an optional
//! TOML file, environment variables and finally command-line flags.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of concurrent validations
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Default per-request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of retries after the first failed attempt
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default dedup capacity before the tracked set is reset
pub const DEFAULT_MAX_TRACKED: usize = 100_000;

/// Default pre-screen chunk size
pub const DEFAULT_CHUNK_SIZE: usize = 30;

const DEFAULT_CONNECTIVITY_URL: &str = "https://www.google.com";
const DEFAULT_SPEED_TEST_URL: &str = "https://www.google.com";
const DEFAULT_ANONYMITY_CHECK_URL: &str = "https://api.ipify.org?format=json";
const DEFAULT_SPEED_THRESHOLD_MS: u64 = 5000;
const DEFAULT_SCREEN_URL: &str = "http://httpbin.org/ip";
const DEFAULT_GEO_TIMEOUT_SECS: u64 = 5;
const DEFAULT_STORAGE_DIR: &str = "storage";

const MAX_WORKERS_LIMIT: u64 = 50;
const TIMEOUT_LIMIT_SECS: u64 = 300;
const MAX_RETRIES_LIMIT: u64 = 10;

/// Durations as whole seconds in config files
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Durations as milliseconds in config files
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Full validation protocol settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Concurrent validations in the worker pool
    pub max_workers: usize,
    /// Timeout for each stage request
    #[serde(rename = "timeout_secs", with = "secs")]
    pub timeout: Duration,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    pub connectivity_url: String,
    pub speed_test_url: String,
    /// Must reflect the caller's IP, as JSON (`ip`/`origin`) or plain text
    pub anonymity_check_url: String,
    /// Speed stage passes below this latency
    #[serde(rename = "speed_threshold_ms", with = "millis")]
    pub speed_threshold: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            connectivity_url: DEFAULT_CONNECTIVITY_URL.to_string(),
            speed_test_url: DEFAULT_SPEED_TEST_URL.to_string(),
            anonymity_check_url: DEFAULT_ANONYMITY_CHECK_URL.to_string(),
            speed_threshold: Duration::from_millis(DEFAULT_SPEED_THRESHOLD_MS),
        }
    }
}

impl ValidatorConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Bulk pre-screen settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    /// Candidates probed concurrently per chunk
    pub chunk_size: usize,
    pub test_url: String,
    #[serde(rename = "timeout_secs", with = "secs")]
    pub timeout: Duration,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            test_url: DEFAULT_SCREEN_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl ScreenConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_test_url(mut self, url: impl Into<String>) -> Self {
        self.test_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeoProvider {
    #[default]
    IpApi,
    Mmdb,
    /// No enrichment; sources' own country data is kept
    None,
}

/// Geolocation enrichment settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    pub provider: GeoProvider,
    pub ip_api_url: String,
    /// Hard cap on a single lookup
    #[serde(rename = "timeout_secs", with = "secs")]
    pub timeout: Duration,
    /// MaxMind City database, required by the `mmdb` provider
    pub mmdb_path: Option<PathBuf>,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            provider: GeoProvider::IpApi,
            ip_api_url: crate::proxy::geo::DEFAULT_IP_API_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_GEO_TIMEOUT_SECS),
            mmdb_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root for snapshots and session exports
    pub base_dir: PathBuf,
    /// e.g. `sqlite://storage/pipeline.db`
    pub sqlite_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            base_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            sqlite_url: None,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run pre-screen and validation; when false candidates are only tracked
    pub run_tests: bool,
    /// Dedup capacity; the tracked set is cleared when it reaches this size
    pub max_tracked: usize,
    pub validator: ValidatorConfig,
    pub screen: ScreenConfig,
    pub geo: GeoConfig,
    pub storage: StorageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            run_tests: true,
            max_tracked: DEFAULT_MAX_TRACKED,
            validator: ValidatorConfig::default(),
            screen: ScreenConfig::default(),
            geo: GeoConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("RUN_TESTS") {
            self.run_tests = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(env_error("RUN_TESTS", &value)),
            };
        }
        if let Some(value) = lookup("TEST_WORKERS") {
            self.validator.max_workers = parse_env("TEST_WORKERS", &value)?;
        }
        if let Some(value) = lookup("TEST_TIMEOUT") {
            self.validator.timeout = Duration::from_secs(parse_env("TEST_TIMEOUT", &value)?);
        }
        if let Some(value) = lookup("MAX_TRACKED_PROXIES") {
            self.max_tracked = parse_env("MAX_TRACKED_PROXIES", &value)?;
        }
        if let Some(value) = lookup("STORAGE_DIR") {
            self.storage.base_dir = PathBuf::from(value);
        }
        Ok(self)
    }

    pub fn with_run_tests(mut self, run_tests: bool) -> Self {
        self.run_tests = run_tests;
        self
    }

    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked;
        self
    }

    pub fn with_validator(mut self, validator: ValidatorConfig) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_screen(mut self, screen: ScreenConfig) -> Self {
        self.screen = screen;
        self
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.base_dir = dir.into();
        self
    }

    /// Check every value is usable before anything starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "validator.max_workers",
            self.validator.max_workers as u64,
            1,
            MAX_WORKERS_LIMIT,
        )?;
        check_range(
            "validator.timeout_secs",
            self.validator.timeout.as_secs(),
            1,
            TIMEOUT_LIMIT_SECS,
        )?;
        check_range(
            "validator.max_retries",
            self.validator.max_retries as u64,
            0,
            MAX_RETRIES_LIMIT,
        )?;
        check_range("max_tracked", self.max_tracked as u64, 1, u64::MAX)?;
        check_range("screen.chunk_size", self.screen.chunk_size as u64, 1, u64::MAX)?;
        check_range(
            "screen.timeout_secs",
            self.screen.timeout.as_secs(),
            1,
            TIMEOUT_LIMIT_SECS,
        )?;

        check_url("validator.connectivity_url", &self.validator.connectivity_url)?;
        check_url("validator.speed_test_url", &self.validator.speed_test_url)?;
        check_url("validator.anonymity_check_url", &self.validator.anonymity_check_url)?;
        check_url("screen.test_url", &self.screen.test_url)?;

        match self.geo.provider {
            GeoProvider::IpApi => check_url("geo.ip_api_url", &self.geo.ip_api_url)?,
            GeoProvider::Mmdb if self.geo.mmdb_path.is_none() => {
                return Err(ConfigError::Missing(
                    "geo.mmdb_path is required by the mmdb provider".to_string(),
                ));
            }
            GeoProvider::Mmdb | GeoProvider::None => {}
        }

        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite_url.is_none() {
            return Err(ConfigError::Missing(
                "storage.sqlite_url is required by the sqlite backend".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_error(name: &'static str, value: &str) -> ConfigError {
    ConfigError::Env {
        name,
        value: value.to_string(),
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| env_error(name, value))
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

fn check_url(field: &'static str, url: &str) -> Result<(), ConfigError> {
    reqwest::Url::parse(url).map(|_| ()).map_err(|_| ConfigError::InvalidUrl {
        field,
        url: url.to_string(),
    })
}
