//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,

    /// How long a write waits on a contending writer before failing.
    pub busy_timeout_ms: u64,

    /// Currency applied to imported purchases that lack one.
    pub default_currency: String,

    /// Delivery attempts per queued notification.
    pub notification_max_attempts: i64,

    /// Append delivered notifications here as JSON lines instead of logging them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_log: Option<PathBuf>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .field("default_currency", &self.default_currency)
            .field("notification_max_attempts", &self.notification_max_attempts)
            .field("notification_log", &self.notification_log)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("tm.db"),
            busy_timeout_ms: 5_000,
            default_currency: "USD".to_string(),
            notification_max_attempts: tm_db::DEFAULT_NOTIFICATION_ATTEMPTS,
            notification_log: None,
        }
    }
}

impl Config {
    /// Loads configuration from default locations.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(None)
    }

    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (TM_*)
        figment = figment.merge(Env::prefixed("TM_"));

        figment.extract()
    }

    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Returns the platform-specific config directory for tm.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tm"))
}

/// Returns the platform-specific data directory for tm.
///
/// On Linux: `~/.local/share/tm`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("tm"))
}
