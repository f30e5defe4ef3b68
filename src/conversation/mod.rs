//! Conversation types and state management

mod persona;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use persona::{catalog as persona_catalog, Persona, PersonaInfo, UnknownPersona};

/// Title every conversation starts with until its first successful exchange
pub const DEFAULT_TITLE: &str = "New Chat";

/// Number of characters of the first user message kept in a derived title
pub const TITLE_MAX_CHARS: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Set on rendered views once synthesized audio is cached for this message.
    /// Stored messages never carry it: audio lives only as long as the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_cache_key: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            audio_cache_key: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Greeting message for a persona
    pub fn greeting(persona: Persona) -> Self {
        Self::assistant(persona.greeting())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub persona: Persona,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a conversation seeded with the persona's greeting
    pub fn new(persona: Persona) -> Self {
        Self::seeded(persona, Message::greeting(persona))
    }

    /// Create a conversation seeded with an existing greeting message
    pub fn seeded(persona: Persona, greeting: Message) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            persona,
            messages: vec![greeting],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_user(&mut self, content: &str) -> &Message {
        self.push(Message::user(content))
    }

    pub fn add_assistant(&mut self, content: &str) -> &Message {
        self.push(Message::assistant(content))
    }

    fn push(&mut self, message: Message) -> &Message {
        self.messages.push(message);
        self.touch();
        &self.messages[self.messages.len() - 1]
    }

    /// Advance `updated_at`, never letting it stand still or go backwards
    fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::milliseconds(1)
        };
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_TITLE
    }

    /// Derive the title from the first user message if it is still the default.
    ///
    /// Returns `true` when the title changed.
    pub fn set_title_once(&mut self) -> bool {
        if !self.has_default_title() {
            return false;
        }
        let Some(first) = self.messages.iter().find(|m| m.role == Role::User) else {
            return false;
        };
        self.title = derive_title(&first.content);
        self.touch();
        true
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            persona: self.persona,
            message_count: self.messages.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Chat-history listing entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub persona: Persona,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// First `TITLE_MAX_CHARS` characters of `text`, with `...` appended when cut
pub fn derive_title(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
