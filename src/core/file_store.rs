//! JSON file conversation store
//!
//! Writes go to a temporary file in the same directory, are fsynced and then
//! renamed over the target, so a reader sees either the old or the new mapping.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::memory::{decode_payload, ConversationMap, ConversationStore, StoreError};

pub struct JsonFileConversationStore {
    path: PathBuf,
}

impl JsonFileConversationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "conversations.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ConversationStore for JsonFileConversationStore {
    async fn load_all(&self) -> Result<ConversationMap, StoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(decode_payload(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConversationMap::new()),
            // Non-UTF-8 content is corruption, not an I/O failure
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                tracing::warn!(path = %self.path.display(), "Stored conversations are not valid UTF-8, starting empty");
                Ok(ConversationMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_all(&self, conversations: &ConversationMap) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let payload = serde_json::to_vec_pretty(conversations)?;

        let tmp_path = self.temp_path();
        let mut tmp_file = fs::File::create(&tmp_path).await?;
        tmp_file.write_all(&payload).await?;
        tmp_file.sync_all().await?;
        drop(tmp_file);

        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}
