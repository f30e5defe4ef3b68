//! Core session components
//!
//! This module contains the session orchestration: conversation storage,
//! the single active conversation, and speech playback.

mod engine;
mod file_store;
mod memory;
mod playback;
mod session;

pub use engine::{HeadlessEngine, PlaybackEngine, PlaybackError};
pub use file_store::JsonFileConversationStore;
pub use memory::{ConversationMap, ConversationStore, SqliteConversationStore, StoreError};
pub use playback::{PlaybackCoordinator, PlaybackState};
pub use session::{SendOutcome, SessionController, SessionError, SessionSnapshot, FALLBACK_REPLY};
