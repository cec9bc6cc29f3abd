//! Provider configuration.
//!
//! Configuration can be loaded from a TOML file or built in code:
//!
//! ```toml
//! room = "notes"
//! password = "correct horse"
//! app_id = "my-app"
//! filter_bc_conns = true
//! max_conns = 24
//! ```

use crate::crypto::Argon2Params;
use rand::Rng;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

/// Application id used when none is configured.
pub const DEFAULT_APP_ID: &str = "duplex-sync";

/// Configuration for one [`Provider`](crate::Provider).
#[derive(Clone, Deserialize)]
pub struct ProviderConfig {
    /// Room to join (required).
    #[serde(default)]
    pub room: String,
    /// Password for the broadcast-channel key. Without one, same-device
    /// traffic is not encrypted.
    #[serde(default, deserialize_with = "deserialize_password")]
    pub password: Option<Zeroizing<String>>,
    /// Application namespace, prefixed to the room name (default: duplex-sync).
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// Announce presence to same-device peers (default: true).
    #[serde(default = "default_filter_bc_conns")]
    pub filter_bc_conns: bool,
    /// Mesh connection limit hint (default: 20 plus a random 0..15).
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    /// Connect as soon as the provider is built (default: true).
    #[serde(default = "default_connect")]
    pub connect: bool,
    /// Seconds before a silent awareness client is dropped (default: 30).
    #[serde(default = "default_awareness_timeout_secs")]
    pub awareness_timeout_secs: u64,
    /// Size Argon2 for this much RAM instead of detecting it.
    #[serde(default)]
    pub argon2_ram_mb: Option<u64>,
}

// Default value functions
fn default_app_id() -> String {
    DEFAULT_APP_ID.to_string()
}

fn default_filter_bc_conns() -> bool {
    true
}

/// 20 plus a random 0..15, so that many peers joining at once do not form
/// a single saturated cluster.
pub fn default_max_conns() -> usize {
    20 + rand::thread_rng().gen_range(0..15)
}

fn default_connect() -> bool {
    true
}

fn default_awareness_timeout_secs() -> u64 {
    30
}

fn deserialize_password<'de, D>(deserializer: D) -> Result<Option<Zeroizing<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(Zeroizing::new))
}

impl ProviderConfig {
    /// Configuration for `room` with every other field defaulted.
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            password: None,
            app_id: default_app_id(),
            filter_bc_conns: default_filter_bc_conns(),
            max_conns: default_max_conns(),
            connect: default_connect(),
            awareness_timeout_secs: default_awareness_timeout_secs(),
            argon2_ram_mb: None,
        }
    }

    /// Set the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Set the application id.
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Enable or disable presence announcements.
    pub fn with_filter_bc_conns(mut self, enabled: bool) -> Self {
        self.filter_bc_conns = enabled;
        self
    }

    /// Set the mesh connection limit hint.
    pub fn with_max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    /// Connect on construction or not.
    pub fn with_connect(mut self, connect: bool) -> Self {
        self.connect = connect;
        self
    }

    /// Set the awareness timeout.
    pub fn with_awareness_timeout(mut self, timeout: Duration) -> Self {
        self.awareness_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Size Argon2 for `ram_mb` instead of detecting RAM.
    pub fn with_argon2_ram_mb(mut self, ram_mb: u64) -> Self {
        self.argon2_ram_mb = Some(ram_mb);
        self
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content, path)
    }

    /// Load configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, Path::new("<inline>"))
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room.trim().is_empty() {
            return Err(ConfigError::MissingRoomName);
        }
        Ok(())
    }

    /// The full room name: `{app_id}-{room}`.
    pub fn room_name(&self) -> String {
        format!("{}-{}", self.app_id, self.room)
    }

    /// The password, if any and non-empty.
    pub fn password(&self) -> Option<&str> {
        self.password
            .as_deref()
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    /// Argon2 parameters for key derivation.
    pub fn argon2_params(&self) -> Argon2Params {
        match self.argon2_ram_mb {
            Some(ram_mb) => Argon2Params::for_ram_mb(ram_mb),
            None => Argon2Params::default(),
        }
    }

    /// Awareness timeout as a duration.
    pub fn awareness_timeout(&self) -> Duration {
        Duration::from_secs(self.awareness_timeout_secs)
    }
}

// Don't leak the password in debug output
impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("room", &self.room)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("app_id", &self.app_id)
            .field("filter_bc_conns", &self.filter_bc_conns)
            .field("max_conns", &self.max_conns)
            .field("connect", &self.connect)
            .field("awareness_timeout_secs", &self.awareness_timeout_secs)
            .field("argon2_ram_mb", &self.argon2_ram_mb)
            .finish()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// No room name was given.
    #[error("room name is required")]
    MissingRoomName,
}
