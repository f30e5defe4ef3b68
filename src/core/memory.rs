//! Conversation persistence
//!
//! The whole set of conversations is persisted as one serialized mapping from
//! conversation id to conversation. It is loaded once at startup and replaced
//! wholesale after every session mutation.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::conversation::Conversation;

/// Conversation id -> conversation
pub type ConversationMap = HashMap<String, Conversation>;

/// Key of the single row holding the serialized mapping
const STORE_KEY: &str = "conversations";

/// Errors from the conversation store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable storage for the full set of conversations
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load the persisted mapping.
    ///
    /// Missing or malformed payloads load as an empty mapping; only genuine
    /// I/O failures are errors.
    async fn load_all(&self) -> Result<ConversationMap, StoreError>;

    /// Replace the persisted mapping wholesale. Readers never observe a
    /// partially written mapping.
    async fn save_all(&self, conversations: &ConversationMap) -> Result<(), StoreError>;
}

/// Decode a persisted payload, degrading to empty when it is unreadable.
///
/// Entries whose key disagrees with the conversation id, or that carry no
/// messages, are dropped.
pub(crate) fn decode_payload(raw: &str) -> ConversationMap {
    if raw.trim().is_empty() {
        return ConversationMap::new();
    }

    let decoded: ConversationMap = match serde_json::from_str(raw) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(error = %e, "Stored conversations are corrupt, starting empty");
            return ConversationMap::new();
        }
    };

    decoded
        .into_iter()
        .filter(|(key, conv)| {
            let valid = *key == conv.id && !conv.messages.is_empty();
            if !valid {
                tracing::warn!(conversation_id = %key, "Dropping malformed stored conversation");
            }
            valid
        })
        .collect()
}

/// SQLite-backed conversation store
pub struct SqliteConversationStore {
    pool: SqlitePool,
}

impl SqliteConversationStore {
    /// Open (or create) the store at the given SQLite database path
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        // Create parent directories if they don't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create an in-memory store
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        // A single connection: every connection to :memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_store (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn load_all(&self) -> Result<ConversationMap, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM conversation_store WHERE key = ?")
                .bind(STORE_KEY)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .map(|(payload,)| decode_payload(&payload))
            .unwrap_or_default())
    }

    async fn save_all(&self, conversations: &ConversationMap) -> Result<(), StoreError> {
        let payload = serde_json::to_string(conversations)?;

        // A single upsert statement is atomic
        sqlx::query(
            r#"
            INSERT INTO conversation_store (key, payload) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                updated_at = datetime('now')
            "#,
        )
        .bind(STORE_KEY)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Persona;

    fn sample() -> ConversationMap {
        let mut first = Conversation::new(Persona::Arjun);
        first.add_user("I feel anxious");
        first.add_assistant("Try breathing exercises");
        first.set_title_once();
        let second = Conversation::new(Persona::Priya);

        [first, second]
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_store_loads_empty() {
        let store = SqliteConversationStore::new_in_memory().await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = SqliteConversationStore::new_in_memory().await.unwrap();
        let conversations = sample();

        store.save_all(&conversations).await.unwrap();
        let loaded = store.load_all().await.unwrap();

        assert_eq!(loaded, conversations);
    }

    #[tokio::test]
    async fn test_save_replaces_wholesale() {
        let store = SqliteConversationStore::new_in_memory().await.unwrap();
        store.save_all(&sample()).await.unwrap();

        let only = Conversation::new(Persona::Rohan);
        let replacement: ConversationMap = [(only.id.clone(), only)].into_iter().collect();
        store.save_all(&replacement).await.unwrap();

        assert_eq!(store.load_all().await.unwrap(), replacement);
    }

    #[tokio::test]
    async fn test_corrupt_payload_loads_empty() {
        let store = SqliteConversationStore::new_in_memory().await.unwrap();
        sqlx::query("INSERT INTO conversation_store (key, payload) VALUES (?, ?)")
            .bind(STORE_KEY)
            .bind("{not json")
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_decode_drops_mismatched_entries() {
        let conv = Conversation::new(Persona::Anjali);
        let mut map = ConversationMap::new();
        map.insert("wrong-key".to_string(), conv.clone());
        map.insert(conv.id.clone(), conv.clone());

        let mut empty = Conversation::new(Persona::Arjun);
        empty.messages.clear();
        map.insert(empty.id.clone(), empty);

        let decoded = decode_payload(&serde_json::to_string(&map).unwrap());
        assert_eq!(decoded.len(), 1);
        assert!(decoded.contains_key(&conv.id));
    }
}
