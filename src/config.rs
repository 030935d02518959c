//! Configuration file parser for ~/.config/telecast/config.toml.
//!
//! The config file is optional — a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Struct
// ============================================================================

/// Top-level engine configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified;
/// missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base poll interval in minutes for subscriptions that don't set their
    /// own. Doubled per consecutive failure, up to the ceiling below.
    pub poll_interval_minutes: u64,

    /// Ceiling on the backed-off poll interval, in minutes.
    pub poll_backoff_ceiling_minutes: u64,

    /// Maximum feed fetches in flight across all subscriptions.
    pub max_concurrent_polls: usize,

    /// Maximum enclosure downloads in flight across all subscriptions.
    pub max_concurrent_downloads: usize,

    /// Fraction of the download pool one subscription may occupy while other
    /// subscriptions have items waiting. Clamped to (0, 1].
    pub download_fairness_fraction: f64,

    /// Transient-failure retry budget per item before it is marked failed.
    pub download_retry_budget: u32,

    /// Base retry backoff in seconds; doubled per attempt.
    pub download_backoff_base_secs: u64,

    /// Aggregate disk budget for the library in bytes. 0 = unlimited.
    pub storage_budget_bytes: u64,

    /// How often the schedulers wake to look for due work, in seconds.
    pub scheduler_tick_secs: u64,

    /// Library directory. Defaults to `<config dir>/library` when unset.
    pub library_dir: Option<PathBuf>,

    /// Database path. Defaults to `<config dir>/telecast.db` when unset.
    pub database_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_minutes: 60,
            poll_backoff_ceiling_minutes: 24 * 60,
            max_concurrent_polls: 8,
            max_concurrent_downloads: 4,
            download_fairness_fraction: 0.5,
            download_retry_budget: 3,
            download_backoff_base_secs: 30,
            storage_budget_bytes: 0,
            scheduler_tick_secs: 15,
            library_dir: None,
            database_path: None,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse the TOML content first as a raw table to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "poll_interval_minutes",
                "poll_backoff_ceiling_minutes",
                "max_concurrent_polls",
                "max_concurrent_downloads",
                "download_fairness_fraction",
                "download_retry_budget",
                "download_backoff_base_secs",
                "storage_budget_bytes",
                "scheduler_tick_secs",
                "library_dir",
                "database_path",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            downloads = config.max_concurrent_downloads,
            budget = config.storage_budget_bytes,
            "Loaded configuration"
        );
        Ok(config.sanitized())
    }

    /// Clamp nonsense values into operable ranges rather than failing the
    /// whole startup over them.
    pub fn sanitized(mut self) -> Self {
        if self.poll_interval_minutes == 0 {
            self.poll_interval_minutes = 60;
        }
        if self.poll_backoff_ceiling_minutes < self.poll_interval_minutes {
            self.poll_backoff_ceiling_minutes = self.poll_interval_minutes;
        }
        self.max_concurrent_polls = self.max_concurrent_polls.max(1);
        self.max_concurrent_downloads = self.max_concurrent_downloads.max(1);
        if !(self.download_fairness_fraction > 0.0 && self.download_fairness_fraction <= 1.0) {
            self.download_fairness_fraction = 0.5;
        }
        self.scheduler_tick_secs = self.scheduler_tick_secs.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_minutes * 60)
    }

    pub fn poll_backoff_ceiling(&self) -> Duration {
        Duration::from_secs(self.poll_backoff_ceiling_minutes * 60)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    /// Download pool slots one subscription may hold while others wait.
    /// Always at least one so a lone busy subscription is never starved.
    pub fn fairness_cap(&self) -> usize {
        let cap = (self.max_concurrent_downloads as f64 * self.download_fairness_fraction).ceil();
        (cap as usize).max(1)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval_minutes, 60);
        assert_eq!(config.max_concurrent_downloads, 4);
        assert_eq!(config.download_retry_budget, 3);
        assert_eq!(config.storage_budget_bytes, 0);
        assert!(config.library_dir.is_none());
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/telecast_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.poll_interval_minutes, 60);
    }

    #[test]
    fn test_empty_file_returns_default() {
        let dir = std::env::temp_dir().join("telecast_config_test_empty");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_concurrent_polls, 8);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let dir = std::env::temp_dir().join("telecast_config_test_partial");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "max_concurrent_downloads = 2\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_concurrent_downloads, 2);
        assert_eq!(config.poll_interval_minutes, 60); // default

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let dir = std::env::temp_dir().join("telecast_config_test_full");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let content = r#"
poll_interval_minutes = 30
poll_backoff_ceiling_minutes = 480
max_concurrent_polls = 4
max_concurrent_downloads = 6
download_fairness_fraction = 0.34
download_retry_budget = 5
storage_budget_bytes = 10737418240
library_dir = "/srv/telecast/library"
database_path = "/srv/telecast/telecast.db"
"#;
        std::fs::write(&path, content).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.poll_interval_minutes, 30);
        assert_eq!(config.poll_backoff_ceiling_minutes, 480);
        assert_eq!(config.max_concurrent_downloads, 6);
        assert_eq!(config.download_retry_budget, 5);
        assert_eq!(config.storage_budget_bytes, 10_737_418_240);
        assert_eq!(
            config.library_dir.as_deref(),
            Some(Path::new("/srv/telecast/library"))
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = std::env::temp_dir().join("telecast_config_test_invalid");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "this is not [valid toml").unwrap();

        let result = Config::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let dir = std::env::temp_dir().join("telecast_config_test_unknown");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "totally_fake_key = \"ignored\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.poll_interval_minutes, 60);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("telecast_config_test_too_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let result = Config::load(&path);
        assert!(matches!(result, Err(ConfigError::TooLarge(_))));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_sanitize_clamps_bad_values() {
        let config = Config {
            poll_interval_minutes: 0,
            poll_backoff_ceiling_minutes: 1,
            max_concurrent_polls: 0,
            max_concurrent_downloads: 0,
            download_fairness_fraction: 7.5,
            scheduler_tick_secs: 0,
            ..Config::default()
        }
        .sanitized();

        assert_eq!(config.poll_interval_minutes, 60);
        assert!(config.poll_backoff_ceiling_minutes >= config.poll_interval_minutes);
        assert_eq!(config.max_concurrent_polls, 1);
        assert_eq!(config.max_concurrent_downloads, 1);
        assert_eq!(config.download_fairness_fraction, 0.5);
        assert_eq!(config.scheduler_tick_secs, 1);
    }

    #[test]
    fn test_fairness_cap_never_zero() {
        let config = Config {
            max_concurrent_downloads: 1,
            download_fairness_fraction: 0.1,
            ..Config::default()
        };
        assert_eq!(config.fairness_cap(), 1);

        let config = Config {
            max_concurrent_downloads: 4,
            download_fairness_fraction: 0.5,
            ..Config::default()
        };
        assert_eq!(config.fairness_cap(), 2);
    }
}
