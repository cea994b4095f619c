//! Cache settings
//!
//! Settings are read from the `cache_settings` section of the organizer's JSON
//! configuration file. Every field has a default, so a partial section (or
//! none at all) is valid. Two environment variables override the file:
//!
//! - `ORGANIZER_CACHE_FILE`: replaces `cache_file`
//! - `ORGANIZER_DISABLE_CACHE`: `1` or `true` turns the cache off

use crate::key::KeyStrategyKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;
/// Lower bound for the background save interval
const MIN_SAVE_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for [`CacheManager`](crate::CacheManager)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Master switch
    pub enable_cache: bool,
    /// Location of the persisted document; `.json` selects the text format
    pub cache_file: PathBuf,
    /// Size limit of the persisted document; zero or less disables eviction
    pub max_cache_size_mb: f64,
    /// Entries older than this are dropped at load; zero or less keeps all
    pub cache_expiration_days: f64,
    /// Persist from a background thread instead of inside `put`
    pub background_saving: bool,
    /// Seconds between periodic background saves
    pub save_interval: f64,
    /// How keys are derived from files
    pub key_strategy: KeyStrategyKind,
    /// Seconds `shutdown` waits for the background thread
    pub shutdown_timeout: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache_file: PathBuf::from("./cache/audio_analysis_cache.bin"),
            max_cache_size_mb: 100.0,
            cache_expiration_days: 30.0,
            background_saving: true,
            save_interval: 60.0,
            key_strategy: KeyStrategyKind::Metadata,
            shutdown_timeout: 5.0,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    cache_settings: Option<CacheSettings>,
}

/// Environment values that can override file settings
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    /// Value of `ORGANIZER_CACHE_FILE`
    pub cache_file: Option<PathBuf>,
    /// Value of `ORGANIZER_DISABLE_CACHE`
    pub disable_cache: Option<String>,
}

impl EnvOverrides {
    /// Read overrides from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            cache_file: std::env::var("ORGANIZER_CACHE_FILE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            disable_cache: std::env::var("ORGANIZER_DISABLE_CACHE").ok(),
        }
    }
}

impl CacheSettings {
    /// Load settings from the organizer's JSON config file
    ///
    /// Reads the `cache_settings` section; a file without one yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// settings fail [`CacheSettings::validate`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        let file: ConfigFile = serde_json::from_str(&content).map_err(|e| {
            Error::configuration(format!("Invalid config file {}: {e}", path.display()))
        })?;
        let settings = file.cache_settings.unwrap_or_default();
        settings.validate()?;
        Ok(settings)
    }

    /// Apply environment overrides
    #[must_use]
    pub fn with_overrides(mut self, overrides: EnvOverrides) -> Self {
        if let Some(file) = overrides.cache_file {
            self.cache_file = file;
        }
        if let Some(flag) = overrides.disable_cache
            && (flag == "1" || flag.eq_ignore_ascii_case("true"))
        {
            self.enable_cache = false;
        }
        self
    }

    /// Check numeric fields for values the manager cannot use
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for NaN limits or a non-positive save
    /// interval or shutdown timeout.
    pub fn validate(&self) -> Result<()> {
        if self.max_cache_size_mb.is_nan() {
            return Err(Error::configuration("max_cache_size_mb must be a number"));
        }
        if self.cache_expiration_days.is_nan() {
            return Err(Error::configuration(
                "cache_expiration_days must be a number",
            ));
        }
        if !(self.save_interval > 0.0 && self.save_interval.is_finite()) {
            return Err(Error::configuration(format!(
                "save_interval must be a positive number of seconds, got {}",
                self.save_interval
            )));
        }
        if !(self.shutdown_timeout > 0.0 && self.shutdown_timeout.is_finite()) {
            return Err(Error::configuration(format!(
                "shutdown_timeout must be a positive number of seconds, got {}",
                self.shutdown_timeout
            )));
        }
        Ok(())
    }

    /// Eviction threshold in bytes, `None` when eviction is disabled
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn max_size_bytes(&self) -> Option<u64> {
        (self.max_cache_size_mb > 0.0).then(|| (self.max_cache_size_mb * BYTES_PER_MB) as u64)
    }

    /// Maximum entry age, `None` when expiration is disabled
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn expiration(&self) -> Option<chrono::Duration> {
        if self.cache_expiration_days > 0.0 {
            let millis = (self.cache_expiration_days * SECONDS_PER_DAY * 1000.0) as i64;
            Some(chrono::Duration::milliseconds(millis))
        } else {
            None
        }
    }

    /// Interval between periodic background saves
    #[must_use]
    pub fn save_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.save_interval)
            .unwrap_or(MIN_SAVE_INTERVAL)
            .max(MIN_SAVE_INTERVAL)
    }

    /// Bounded wait for the background thread during shutdown
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.shutdown_timeout).unwrap_or(Duration::from_secs(5))
    }
}
