//! Client configuration loaded from TOML files
//!
//! Each Vista deployment can ship a TOML file that defines:
//! - Where the chat and speech gateways live
//! - Which conversation store backend to use
//! - Session defaults (persona, speech preference)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::conversation::Persona;

/// Root client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Remote gateway settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Conversation store settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Session defaults
    #[serde(default)]
    pub session: SessionConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("gateway.base_url must not be empty".into()));
        }
        if self.gateway.timeout_secs == 0 {
            return Err(ConfigError::Validation("gateway.timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Chat and speech gateway endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL shared by both gateways
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the chat endpoint
    #[serde(default = "default_chat_path")]
    pub chat_path: String,

    /// Path of the speech endpoint
    #[serde(default = "default_speech_path")]
    pub speech_path: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Full chat URL, overriding `base_url` + `chat_path`
    #[serde(default)]
    pub chat_url: Option<String>,

    /// Full speech URL, overriding `base_url` + `speech_path`
    #[serde(default)]
    pub speech_url: Option<String>,
}

fn default_base_url() -> String {
    "http://localhost:8501".to_string()
}

fn default_chat_path() -> String {
    "/chat".to_string()
}

fn default_speech_path() -> String {
    "/tts".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_path: default_chat_path(),
            speech_path: default_speech_path(),
            timeout_secs: default_timeout_secs(),
            chat_url: None,
            speech_url: None,
        }
    }
}

impl GatewayConfig {
    /// Gateway config pointing both endpoints at one base URL
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn chat_url(&self) -> String {
        self.chat_url
            .clone()
            .unwrap_or_else(|| join_url(&self.base_url, &self.chat_path))
    }

    pub fn speech_url(&self) -> String {
        self.speech_url
            .clone()
            .unwrap_or_else(|| join_url(&self.base_url, &self.speech_path))
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Which conversation store backs the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Json,
}

/// Conversation store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend: "sqlite" or "json"
    #[serde(default)]
    pub backend: StorageBackend,

    /// Store location; defaults to a file under the data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the store location relative to the data directory
    pub fn resolve_path(&self, data_dir: &Path) -> PathBuf {
        self.path.clone().unwrap_or_else(|| match self.backend {
            StorageBackend::Sqlite => data_dir.join("vista.db"),
            StorageBackend::Json => data_dir.join("conversations.json"),
        })
    }
}

/// Session defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Persona selected when the session starts
    #[serde(default)]
    pub default_persona: Persona,

    /// Whether spoken playback starts enabled
    #[serde(default = "default_true")]
    pub speech_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_persona: Persona::default(),
            speech_enabled: true,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
