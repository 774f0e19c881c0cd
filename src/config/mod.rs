//! Configuration storage
//!
//! Everything a session needs about the current user and the backend comes
//! from here and is passed down explicitly.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::Sender;
use crate::sync::IdentityRule;

/// Default cap for a single image download (1 MiB).
const DEFAULT_MAX_DOWNLOAD_BYTES: usize = 1024 * 1024;

/// Default capacity of the session's bounded channels.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Current participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub sender_id: String,
    pub display_name: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            sender_id: uuid::Uuid::new_v4().to_string(),
            display_name: "Anonymous".to_string(),
        }
    }
}

/// Where the store and the change feed live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the HTTP store (messages + attachments).
    pub store_url: Option<String>,
    /// Base URL of the WebSocket change feed.
    pub feed_url: Option<String>,
}

/// Reconciliation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_download_bytes: usize,
    pub channel_capacity: usize,
    pub identity: IdentityRule,
    /// Show sent messages immediately instead of waiting for the feed echo.
    pub optimistic_send: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            identity: IdentityRule::default(),
            optimistic_send: false,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub user: UserConfig,
    pub backend: BackendConfig,
    pub sync: SyncConfig,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "chat-sync", "chat-sync")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk, falling back to defaults when absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Load configuration, writing the defaults on first run so the
    /// generated sender id stays stable across invocations.
    pub fn load_or_init() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            return Self::load_from(&path);
        }
        let config = Self::default();
        config.save_to(&path)?;
        tracing::info!("Wrote default config to {}", path.display());
        Ok(config)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// The current user as a message sender.
    pub fn sender(&self) -> Sender {
        Sender::new(self.user.sender_id.clone(), self.user.display_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("chat-sync-test-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sync.max_download_bytes, 1024 * 1024);
        assert_eq!(config.sync.channel_capacity, 64);
        assert_eq!(config.sync.identity, IdentityRule::SenderAndCreated);
        assert!(!config.sync.optimistic_send);
        assert!(config.backend.store_url.is_none());
        assert!(!config.user.sender_id.is_empty());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [user]
            display_name = "Alice"

            [sync]
            identity = "prefer-store-id"
            "#,
        )
        .unwrap();
        assert_eq!(config.user.display_name, "Alice");
        assert_eq!(config.sync.identity, IdentityRule::PreferStoreId);
        assert_eq!(config.sync.channel_capacity, 64);
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path("config.toml");
        let mut config = Config::default();
        config.user.display_name = "Bob".to_string();
        config.backend.store_url = Some("https://store.example.com".to_string());
        config.sync.optimistic_send = true;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.user.sender_id, config.user.sender_id);
        assert_eq!(loaded.user.display_name, "Bob");
        assert_eq!(loaded.backend.store_url.as_deref(), Some("https://store.example.com"));
        assert!(loaded.sync.optimistic_send);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_file_is_default() {
        let path = temp_path("absent.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(config.backend.feed_url.is_none());
    }
}
