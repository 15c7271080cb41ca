//! Configuration storage

use anyhow::{ensure, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calling::controller::CallSettings;
use crate::calling::media::MediaConstraints;
use crate::calling::peer::PeerConfig;
use crate::calling::GlarePolicy;
use crate::models::Identity;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Socket.IO server (http/https base URL)
    pub server_url: String,
    /// REST API base URL
    pub api_url: String,
    /// Bearer token for the REST API
    pub access_token: Option<String>,
    /// The local user
    pub identity: Identity,
    /// How long a remote typing pulse keeps the indicator on
    pub typing_timeout_ms: u64,
    /// How long a finished call shows as ended
    pub ended_grace_ms: u64,
    /// STUN/TURN servers handed to the peer
    pub ice_servers: Vec<String>,
    /// Send video as well as audio
    pub video: bool,
    /// Simultaneous-offer handling
    pub glare: GlarePolicy,
    /// Cap for the reconnect backoff
    pub reconnect_max_backoff_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000".to_string(),
            api_url: "http://localhost:5000/api/v1".to_string(),
            access_token: None,
            identity: Identity::default(),
            typing_timeout_ms: 3000,
            ended_grace_ms: 1000,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            video: false,
            glare: GlarePolicy::TieBreak,
            reconnect_max_backoff_secs: 64,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "storefront", "storefront-chat")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from a specific file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
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

        // Set restrictive permissions on config file (contains the access token)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.typing_timeout_ms > 0, "typing_timeout_ms must be positive");
        ensure!(
            self.reconnect_max_backoff_secs >= 1,
            "reconnect_max_backoff_secs must be at least 1"
        );
        Ok(())
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_backoff_secs)
    }

    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: true,
            video: self.video,
        }
    }

    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            peer: PeerConfig {
                ice_servers: self.ice_servers.clone(),
            },
            glare: self.glare,
            ended_grace: Duration::from_millis(self.ended_grace_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
server_url = "https://shop.example.com"
glare = "reject"

[identity]
id = "u1"
name = "Ada"
role = "ADMIN"
"#,
        )
        .unwrap();
        assert_eq!(config.server_url, "https://shop.example.com");
        assert_eq!(config.api_url, "http://localhost:5000/api/v1");
        assert_eq!(config.glare, GlarePolicy::Reject);
        assert_eq!(config.identity.role, Role::Admin);
        assert_eq!(config.typing_timeout(), Duration::from_millis(3000));
        assert_eq!(config.call_settings().ended_grace, Duration::from_millis(1000));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let path = std::env::temp_dir()
            .join(format!("storefront-chat-{}", uuid::Uuid::new_v4()))
            .join("config.toml");
        let mut config = Config::default();
        config.access_token = Some("secret".into());
        config.video = true;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.media_constraints().video);

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
        let path = std::env::temp_dir().join(format!("missing-{}.toml", uuid::Uuid::new_v4()));
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let path = std::env::temp_dir().join(format!("bad-{}.toml", uuid::Uuid::new_v4()));
        fs::write(&path, "typing_timeout_ms = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());
        let _ = fs::remove_file(&path);
    }
}
