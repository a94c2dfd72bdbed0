use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TagVaultError};

/// Subsystem configuration, loaded from `tagvault.toml`.
///
/// Every field has a sensible default so the subsystem works
/// out-of-the-box without any config file at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory where the tag database and audit database live.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// How long an unconsumed handshake session stays alive, in hours.
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,

    /// How long a vault-access token stays valid, in minutes.
    #[serde(default = "default_token_ttl_minutes")]
    pub token_ttl_minutes: u64,

    /// Upper bound on a single PAKE engine call, in milliseconds.
    #[serde(default = "default_engine_timeout_ms")]
    pub engine_timeout_ms: u64,

    /// Cadence of the background session-expiry sweep, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Key epoch recorded with hashed audit identifiers, so the
    /// hashing key can be rotated without invalidating old rows.
    #[serde(default = "default_audit_key_epoch")]
    pub audit_key_epoch: u32,
}

// ── Serde default helpers ────────────────────────────────────────────

fn default_data_dir() -> String {
    ".tagvault".to_string()
}

fn default_session_ttl_hours() -> u64 {
    24
}

fn default_token_ttl_minutes() -> u64 {
    15
}

fn default_engine_timeout_ms() -> u64 {
    5_000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_audit_key_epoch() -> u32 {
    1
}

// ── Implementation ───────────────────────────────────────────────────

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            session_ttl_hours: default_session_ttl_hours(),
            token_ttl_minutes: default_token_ttl_minutes(),
            engine_timeout_ms: default_engine_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            audit_key_epoch: default_audit_key_epoch(),
        }
    }
}

impl Settings {
    /// Name of the config file we look for in the project root.
    const FILE_NAME: &'static str = "tagvault.toml";

    /// Load settings from `<project_dir>/tagvault.toml`.
    ///
    /// If the file does not exist, sensible defaults are returned.
    /// If the file exists but cannot be parsed, an error is returned.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(Self::FILE_NAME);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&config_path)?;

        let settings: Settings = toml::from_str(&contents).map_err(|e| {
            TagVaultError::ConfigError(format!("Failed to parse {}: {e}", config_path.display()))
        })?;

        Ok(settings)
    }

    /// Full path to the tag database file.
    pub fn db_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.data_dir).join("tagvault.db")
    }

    /// Full path to the audit database file.
    pub fn audit_db_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.data_dir).join("audit.db")
    }

    /// Session time-to-live as a `Duration`.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours * 3600)
    }

    /// Vault-access token time-to-live as a `Duration`.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_minutes * 60)
    }

    /// PAKE engine call timeout as a `Duration`.
    pub fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }

    /// Background sweep cadence as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_when_no_file() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(dir.path()).unwrap();

        assert_eq!(settings.session_ttl_hours, 24);
        assert_eq!(settings.token_ttl_minutes, 15);
        assert_eq!(settings.engine_timeout_ms, 5_000);
        assert_eq!(settings.data_dir, ".tagvault");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("tagvault.toml"),
            "session_ttl_hours = 1\n",
        )
        .unwrap();

        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.session_ttl_hours, 1);
        // Everything else falls back to defaults.
        assert_eq!(settings.token_ttl_minutes, 15);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("tagvault.toml"), "not [valid toml").unwrap();

        assert!(Settings::load(dir.path()).is_err());
    }

    #[test]
    fn paths_are_under_data_dir() {
        let settings = Settings::default();
        let db = settings.db_path(Path::new("/srv/app"));
        assert_eq!(db, PathBuf::from("/srv/app/.tagvault/tagvault.db"));
    }
}
