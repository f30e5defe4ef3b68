//! Application configuration

pub mod client;

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use client::{ClientConfig, ConfigError, GatewayConfig, SessionConfig, StorageBackend, StorageConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub client: ClientConfig,
}

impl Config {
    /// Build the configuration from the environment, layering an optional
    /// TOML client file (`VISTA_CONFIG`) under the explicit URL overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut client = match env::var("VISTA_CONFIG") {
            Ok(path) => ClientConfig::from_file(&PathBuf::from(path))?,
            Err(_) => ClientConfig::default(),
        };

        if let Ok(url) = env::var("VISTA_CHAT_URL") {
            client.gateway.chat_url = Some(url);
        }
        if let Ok(url) = env::var("VISTA_SPEECH_URL") {
            client.gateway.speech_url = Some(url);
        }

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            data_dir: env::var("VISTA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            client,
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.client.storage.resolve_path(&self.data_dir)
    }
}
