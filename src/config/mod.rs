//! Configuration for the sweep cache

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backtest::cache::stats::DEFAULT_CACHE_RESPONSE_TIME_MS;
use crate::backtest::cache::{CacheOptions, EvictionPolicy};
use crate::utils::error::{Error, Result};

const APP_DIR: &str = "sweepcache";

/// Longest eviction age accepted, 100 years. Far inside chrono's range.
const MAX_EVICTION_AGE_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub results: ResultStoreConfig,
    pub filters: FilterConfig,
    pub logging: LoggingConfig,
}

/// Cache directory and computation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Holds the `temporary/` and `permanent/` tiers
    pub root_dir: PathBuf,
    /// Upper bound on waiting for an in-flight computation
    pub wait_timeout_secs: u64,
    /// Reported as cache response time until real latencies are measured
    pub assumed_response_time_ms: f64,
    pub eviction: EvictionConfig,
}

/// Temporary-tier budget. Without a `[cache.eviction]` table the defaults
/// apply; inside the table an omitted key disables that limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionConfig {
    pub max_age_secs: Option<u64>,
    pub max_total_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultStoreConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Lifetime of a cached filter-options response; 0 disables caching
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

fn data_dir() -> PathBuf {
    let mut p = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push(APP_DIR);
    p
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_dir: data_dir().join("cache"),
            wait_timeout_secs: 300,
            assumed_response_time_ms: DEFAULT_CACHE_RESPONSE_TIME_MS,
            eviction: EvictionConfig::default(),
        }
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: Some(7 * 24 * 60 * 60), // 7 days
            max_total_bytes: Some(512 * 1024 * 1024),
        }
    }
}

impl Default for ResultStoreConfig {
    fn default() -> Self {
        Self { db_path: data_dir().join("results.db") }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 30 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl CacheConfig {
    pub fn options(&self) -> CacheOptions {
        CacheOptions { wait_timeout: Duration::from_secs(self.wait_timeout_secs) }
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            max_age: self
                .eviction
                .max_age_secs
                .map(|secs| chrono::Duration::seconds(secs.min(MAX_EVICTION_AGE_SECS) as i64)),
            max_total_bytes: self.eviction.max_total_bytes,
        }
    }
}

impl FilterConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

impl Config {
    /// Serialize default config to TOML string
    pub fn default_toml() -> Result<String> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a specific file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("Failed to read config file {:?}: {}", path.as_ref(), e))
        })?;
        let mut cfg: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
        cfg.merge_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save the configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }
        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config file {:?}: {}", path, e)))?;
        Ok(())
    }

    /// Load from `./sweepcache.toml`, then the user config dir, else defaults.
    pub fn load() -> Result<Self> {
        let local = Path::new("sweepcache.toml");
        if local.exists() {
            return Self::from_file(local);
        }

        if let Some(mut path) = dirs::config_dir() {
            path.push(APP_DIR);
            path.push("config.toml");
            if path.exists() {
                return Self::from_file(path);
            }
        }

        let mut config = Self::default();
        config.merge_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for the paths most often redirected
    pub fn merge_env(&mut self) {
        if let Ok(dir) = env::var("SWEEPCACHE_CACHE_DIR") {
            self.cache.root_dir = PathBuf::from(dir);
        }
        if let Ok(db) = env::var("SWEEPCACHE_DB_PATH") {
            self.results.db_path = PathBuf::from(db);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.wait_timeout_secs == 0 {
            return Err(Error::Config("cache.wait_timeout_secs must be > 0".to_string()));
        }
        let assumed = self.cache.assumed_response_time_ms;
        if !assumed.is_finite() || assumed < 0.0 {
            return Err(Error::Config(format!(
                "cache.assumed_response_time_ms must be a non-negative number, got {}",
                assumed
            )));
        }
        if let Some(age) = self.cache.eviction.max_age_secs.filter(|a| *a > MAX_EVICTION_AGE_SECS) {
            return Err(Error::Config(format!(
                "cache.eviction.max_age_secs must be at most {}, got {}",
                MAX_EVICTION_AGE_SECS, age
            )));
        }
        if self.cache.root_dir.as_os_str().is_empty() {
            return Err(Error::Config("cache.root_dir must be set".to_string()));
        }
        if self.results.db_path.as_os_str().is_empty() {
            return Err(Error::Config("results.db_path must be set".to_string()));
        }
        Ok(())
    }
}
