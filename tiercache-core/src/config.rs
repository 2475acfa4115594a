use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::disk::DiskUsage;
use crate::error::{Error, Result};
use crate::models::CacheMethod;

/// Application configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub cache: CacheTierConfig,
    pub retention: RetentionConfig,
    pub realtime: RealtimeConfig,
    pub upstream: UpstreamConfig,
    pub transfers: TransferConfig,
    pub trakt: TraktConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("paths", &self.paths)
            .field("cache", &self.cache)
            .field("retention", &self.retention)
            .field("realtime", &self.realtime)
            .field("upstream", &self.upstream)
            .field("transfers", &self.transfers)
            .field("trakt", &"<redacted>")
            .field("scheduler", &self.scheduler)
            .field("logging", &self.logging)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root directory on the bulk tier.
    pub array_source: PathBuf,
    /// Root directory on the cache tier.
    pub cache_destination: PathBuf,
    /// Directory holding the persisted tracker files.
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            array_source: PathBuf::new(),
            cache_destination: PathBuf::new(),
            state_dir: PathBuf::from("/config"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTierConfig {
    /// Size ceiling: "N%", "NTB", "NGB", "NMB", or bare number (GiB).
    /// Empty or "0" disables the limit.
    pub cache_limit: String,
    pub cache_method: CacheMethod,
    pub eviction_enabled: bool,
    /// Usage level (percent of limit) that triggers eviction.
    pub eviction_threshold_percent: u8,
    /// Usage level (percent of limit) eviction drives down to.
    pub eviction_target_percent: u8,
    /// Only entries scoring below this are evictable.
    pub eviction_min_priority: u8,
    /// Minimum age in hours before a file is eviction eligible.
    pub eviction_protected_hours: f64,
}

impl Default for CacheTierConfig {
    fn default() -> Self {
        Self {
            cache_limit: String::new(),
            cache_method: CacheMethod::default(),
            eviction_enabled: true,
            eviction_threshold_percent: 90,
            eviction_target_percent: 75,
            eviction_min_priority: 60,
            eviction_protected_hours: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub min_retention_hours: u32,
    /// Hard upper bound; 0 = unlimited.
    pub max_cache_hours: u32,
    /// Watchlist files expire this many days after being watchlisted;
    /// 0 keeps them while they remain on a watchlist.
    pub watchlist_retention_days: u32,
    pub ondeck_protected: bool,
    /// Restore watched files once their post-watch grace expires.
    pub watched_move: bool,
    pub watched_cache_expiry_hours: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            min_retention_hours: 6,
            max_cache_hours: 0,
            watchlist_retention_days: 7,
            ondeck_protected: true,
            watched_move: false,
            watched_cache_expiry_hours: 48,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub enabled: bool,
    pub check_interval_seconds: u32,
    pub cache_on_play_start: bool,
    /// Progress fraction at which a session counts as watched, 0.0–1.0.
    pub watched_threshold_percent: f64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: 30,
            cache_on_play_start: true,
            watched_threshold_percent: 0.85,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    pub token: String,
    /// Library section IDs to process; empty = all.
    pub library_sections: Vec<i64>,
    pub exit_if_active_session: bool,
    /// Next episodes of a show to cache ahead of the on-deck one.
    pub episodes_ahead: u32,
    /// Only include shows watched within this many days.
    pub days_to_monitor: u32,
    pub skip_ondeck_users: Vec<String>,
    pub watchlist_enabled: bool,
    pub watchlist_episodes_per_show: u32,
    pub skip_watchlist_users: Vec<String>,
    pub request_timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            library_sections: Vec::new(),
            exit_if_active_session: false,
            episodes_ahead: 5,
            days_to_monitor: 99,
            skip_ondeck_users: Vec::new(),
            watchlist_enabled: true,
            watchlist_episodes_per_show: 1,
            skip_watchlist_users: Vec::new(),
            request_timeout_seconds: 30,
        }
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("library_sections", &self.library_sections)
            .field("exit_if_active_session", &self.exit_if_active_session)
            .field("episodes_ahead", &self.episodes_ahead)
            .field("days_to_monitor", &self.days_to_monitor)
            .field("watchlist_enabled", &self.watchlist_enabled)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub max_concurrent_to_cache: usize,
    pub max_concurrent_to_array: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_to_cache: 2,
            max_concurrent_to_array: 2,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraktConfig {
    pub enabled: bool,
    pub client_id: String,
    pub trending_movies_count: usize,
}

impl Default for TraktConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            client_id: String::new(),
            trending_movies_count: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minutes between cache cycles in daemon mode.
    pub cycle_interval_minutes: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "pretty".
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus `TIERCACHE__*` env vars.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()));
        }
        let settings = builder
            .add_source(Environment::with_prefix("TIERCACHE").separator("__"))
            .build()?;
        settings.try_deserialize()
    }

    /// Validate the configuration. Errors here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.paths.array_source.as_os_str().is_empty() {
            return Err(Error::Config("paths.array_source is not set".to_string()));
        }
        if self.paths.cache_destination.as_os_str().is_empty() {
            return Err(Error::Config(
                "paths.cache_destination is not set".to_string(),
            ));
        }
        if self.upstream.url.is_empty() {
            return Err(Error::Config("upstream.url is not set".to_string()));
        }
        if self.upstream.token.is_empty() {
            return Err(Error::Config("upstream.token is not set".to_string()));
        }
        if self.cache.eviction_threshold_percent > 100 || self.cache.eviction_target_percent > 100 {
            return Err(Error::Config(
                "eviction percentages must be within 0-100".to_string(),
            ));
        }
        if self.cache.eviction_target_percent >= self.cache.eviction_threshold_percent {
            return Err(Error::Config(
                "cache.eviction_target_percent must be below eviction_threshold_percent"
                    .to_string(),
            ));
        }
        if self.cache.eviction_min_priority > 100 {
            return Err(Error::Config(
                "cache.eviction_min_priority must be within 0-100".to_string(),
            ));
        }
        if self.transfers.max_concurrent_to_cache == 0 || self.transfers.max_concurrent_to_array == 0
        {
            return Err(Error::Config(
                "transfer pool sizes must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.realtime.watched_threshold_percent) {
            return Err(Error::Config(
                "realtime.watched_threshold_percent must be within 0.0-1.0".to_string(),
            ));
        }
        if self.realtime.enabled && self.realtime.check_interval_seconds == 0 {
            return Err(Error::Config(
                "realtime.check_interval_seconds must be at least 1".to_string(),
            ));
        }
        if self.upstream.days_to_monitor == 0 {
            return Err(Error::Config(
                "upstream.days_to_monitor must be at least 1".to_string(),
            ));
        }
        if self.trakt.enabled && self.trakt.client_id.is_empty() {
            return Err(Error::Config(
                "trakt.client_id is required when trakt.enabled".to_string(),
            ));
        }
        CacheLimit::from_str(&self.cache.cache_limit)?;
        Ok(())
    }

    /// Resolve the configured cache limit to bytes; 0 = unlimited.
    pub fn limit_bytes(&self, disk: &dyn DiskUsage) -> Result<u64> {
        let limit = CacheLimit::from_str(&self.cache.cache_limit)?;
        limit.resolve(disk, &self.paths.cache_destination)
    }
}

/// Parsed cache size ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLimit {
    Unlimited,
    Bytes(u64),
    /// Percentage of the cache filesystem's total capacity.
    Percent(u8),
}

impl CacheLimit {
    /// Resolve to an absolute byte count; `Unlimited` resolves to 0.
    pub fn resolve(self, disk: &dyn DiskUsage, cache_path: &Path) -> Result<u64> {
        match self {
            Self::Unlimited => Ok(0),
            Self::Bytes(n) => Ok(n),
            Self::Percent(p) => {
                let total = disk.total_bytes(cache_path)?;
                Ok(total / 100 * u64::from(p))
            }
        }
    }
}

impl FromStr for CacheLimit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_uppercase();
        if s.is_empty() || s == "0" {
            return Ok(Self::Unlimited);
        }

        if let Some(percent) = s.strip_suffix('%') {
            let p: u8 = percent
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("Invalid cache_limit: {s}")))?;
            if p > 100 {
                return Err(Error::Config(format!("Invalid cache_limit: {s}")));
            }
            return Ok(Self::Percent(p));
        }

        const UNITS: [(&str, u64); 4] = [
            ("TB", 1 << 40),
            ("GB", 1 << 30),
            ("MB", 1 << 20),
            ("KB", 1 << 10),
        ];
        for (suffix, mult) in UNITS {
            if let Some(value) = s.strip_suffix(suffix) {
                let n: f64 = value
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("Invalid cache_limit: {s}")))?;
                if !n.is_finite() || n < 0.0 {
                    return Err(Error::Config(format!("Invalid cache_limit: {s}")));
                }
                return Ok(Self::Bytes((n * mult as f64) as u64));
            }
        }

        // Bare number means GiB.
        let n: f64 = s
            .parse()
            .map_err(|_| Error::Config(format!("Invalid cache_limit: {s}")))?;
        if !n.is_finite() || n < 0.0 {
            return Err(Error::Config(format!("Invalid cache_limit: {s}")));
        }
        Ok(Self::Bytes((n * (1u64 << 30) as f64) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FixedDisk;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.paths.array_source = PathBuf::from("/bulk");
        config.paths.cache_destination = PathBuf::from("/cache");
        config.upstream.url = "http://plex.local:32400".to_string();
        config.upstream.token = "tok".to_string();
        config
    }

    #[test]
    fn parse_limit_forms() {
        assert_eq!(
            CacheLimit::from_str("1TB").expect("parse"),
            CacheLimit::Bytes(1 << 40)
        );
        assert_eq!(
            CacheLimit::from_str("10gb").expect("parse"),
            CacheLimit::Bytes(10 << 30)
        );
        assert_eq!(
            CacheLimit::from_str("512MB").expect("parse"),
            CacheLimit::Bytes(512 << 20)
        );
        assert_eq!(
            CacheLimit::from_str("70%").expect("parse"),
            CacheLimit::Percent(70)
        );
        // Bare number is GiB.
        assert_eq!(
            CacheLimit::from_str("2").expect("parse"),
            CacheLimit::Bytes(2 << 30)
        );
        assert_eq!(CacheLimit::from_str("").expect("parse"), CacheLimit::Unlimited);
        assert_eq!(CacheLimit::from_str("0").expect("parse"), CacheLimit::Unlimited);
        assert!(CacheLimit::from_str("12XB").is_err());
        assert!(CacheLimit::from_str("150%").is_err());
    }

    #[test]
    fn percent_limit_resolves_against_disk_total() {
        let disk = FixedDisk {
            total: 1000,
            free: 500,
        };
        let limit = CacheLimit::Percent(70);
        assert_eq!(
            limit.resolve(&disk, Path::new("/cache")).expect("resolve"),
            700
        );
    }

    #[test]
    fn validate_accepts_defaults_with_paths() {
        valid_config().validate().expect("valid");
    }

    #[test]
    fn validate_rejects_missing_paths_and_bad_ranges() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.cache.eviction_target_percent = 95;
        config.cache.eviction_threshold_percent = 90;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.realtime.watched_threshold_percent = 1.5;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.transfers.max_concurrent_to_cache = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.cache.cache_limit = "nonsense".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_redacts_token() {
        let mut config = valid_config();
        config.upstream.token = "super-secret".to_string();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
