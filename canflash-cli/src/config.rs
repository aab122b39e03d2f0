//! Configuration file support for canflashd.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (CANFLASHD_*)
//! 3. Local config file (./canflashd.toml)
//! 4. Global config file (~/.config/canflashd/config.toml)
//!
//! ```toml
//! [bus]
//! reply_timeout_ms = 1000
//! poll_interval_ms = 500
//!
//! [retry]
//! max_attempts = 8
//! initial_delay_ms = 10
//! max_delay_ms = 500
//! ```

use canflash::RetryPolicy;
use canflash::listener::DEFAULT_POLL_INTERVAL;
use canflash::protocol::link::DEFAULT_REPLY_TIMEOUT;
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
const LOCAL_CONFIG_FILE: &str = "canflashd.toml";

/// Bus timing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    /// Time to wait for a read reply.
    pub reply_timeout_ms: Option<u64>,
    /// Idle poll interval of the listener.
    pub poll_interval_ms: Option<u64>,
}

/// Transmit retry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Send attempts before giving up.
    pub max_attempts: Option<u32>,
    /// Delay after the first failed attempt.
    pub initial_delay_ms: Option<u64>,
    /// Upper bound for a single delay.
    pub max_delay_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Bus timing.
    #[serde(default)]
    pub bus: BusConfig,
    /// Transmit retries.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "canflashd").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.bus.reply_timeout_ms.is_some() {
            self.bus.reply_timeout_ms = other.bus.reply_timeout_ms;
        }
        if other.bus.poll_interval_ms.is_some() {
            self.bus.poll_interval_ms = other.bus.poll_interval_ms;
        }

        if other.retry.max_attempts.is_some() {
            self.retry.max_attempts = other.retry.max_attempts;
        }
        if other.retry.initial_delay_ms.is_some() {
            self.retry.initial_delay_ms = other.retry.initial_delay_ms;
        }
        if other.retry.max_delay_ms.is_some() {
            self.retry.max_delay_ms = other.retry.max_delay_ms;
        }
    }

    /// Read reply timeout, with `cli` taking precedence.
    pub fn reply_timeout(&self, cli: Option<u64>) -> Duration {
        cli.or(self.bus.reply_timeout_ms)
            .map_or(DEFAULT_REPLY_TIMEOUT, Duration::from_millis)
    }

    /// Listener poll interval, with `cli` taking precedence.
    pub fn poll_interval(&self, cli: Option<u64>) -> Duration {
        cli.or(self.bus.poll_interval_ms)
            .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis)
    }

    /// Transmit retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.retry.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay: self
                .retry
                .initial_delay_ms
                .map_or(defaults.initial_delay, Duration::from_millis),
            max_delay: self
                .retry
                .max_delay_ms
                .map_or(defaults.max_delay, Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.bus.reply_timeout_ms.is_none());
        assert!(config.bus.poll_interval_ms.is_none());
        assert!(config.retry.max_attempts.is_none());
        assert_eq!(config.reply_timeout(None), Duration::from_millis(1000));
        assert_eq!(config.poll_interval(None), Duration::from_millis(500));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge_overrides() {
        let mut base = Config::default();
        base.bus.reply_timeout_ms = Some(200);

        let mut other = Config::default();
        other.bus.reply_timeout_ms = Some(300);
        other.retry.max_attempts = Some(3);

        base.merge(other);
        assert_eq!(base.bus.reply_timeout_ms, Some(300));
        assert_eq!(base.retry.max_attempts, Some(3));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.bus.poll_interval_ms = Some(250);
        base.retry.max_delay_ms = Some(100);

        base.merge(Config::default());

        assert_eq!(base.bus.poll_interval_ms, Some(250));
        assert_eq!(base.retry.max_delay_ms, Some(100));
    }

    #[test]
    fn test_cli_value_takes_precedence() {
        let mut config = Config::default();
        config.bus.reply_timeout_ms = Some(2000);
        assert_eq!(config.reply_timeout(Some(50)), Duration::from_millis(50));
        assert_eq!(config.reply_timeout(None), Duration::from_millis(2000));
    }

    // ---- TOML deserialization ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[bus]
reply_timeout_ms = 750
poll_interval_ms = 100

[retry]
max_attempts = 4
initial_delay_ms = 5
max_delay_ms = 80
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.reply_timeout(None), Duration::from_millis(750));
        assert_eq!(config.poll_interval(None), Duration::from_millis(100));
        assert_eq!(
            config.retry_policy(),
            RetryPolicy {
                max_attempts: 4,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(80),
            }
        );
    }

    #[test]
    fn test_config_from_partial_toml() {
        let config: Config = toml::from_str("[retry]\nmax_attempts = 2\n").unwrap();
        assert!(config.bus.reply_timeout_ms.is_none());
        assert_eq!(config.retry_policy().max_attempts, 2);
        assert_eq!(
            config.retry_policy().max_delay,
            RetryPolicy::default().max_delay
        );
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.bus.reply_timeout_ms.is_none());
        assert!(config.retry.max_attempts.is_none());
    }

    // ---- load_from_path with tempfile ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canflashd.toml");
        fs::write(&path, "[bus]\nreply_timeout_ms = 42\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.bus.reply_timeout_ms, Some(42));
    }

    #[test]
    fn test_load_from_path_invalid_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[bus\nreply_timeout_ms = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.bus.reply_timeout_ms.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.bus.reply_timeout_ms.is_none());
    }

    // ---- global_config_path ----

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("canflashd"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
