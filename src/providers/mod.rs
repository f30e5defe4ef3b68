//! Remote gateway integrations
//!
//! Both remote services are opaque and fallible. The session core only sees them
//! through the [`ChatGateway`] and [`SpeechGateway`] traits, so tests and alternate
//! transports can be swapped in freely.

mod chat;
mod speech;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::conversation::Persona;

pub use chat::HttpChatGateway;
pub use speech::HttpSpeechGateway;

/// Content type assumed when the speech gateway does not send one
pub const DEFAULT_AUDIO_CONTENT_TYPE: &str = "audio/wav";

/// Chat gateway failures
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Speech gateway failures
#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Speech gateway returned an empty audio payload")]
    EmptyAudio,
}

/// Generates a reply to a user message
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn reply(&self, message: &str, persona: Persona) -> Result<String, GatewayError>;
}

/// Synthesizes speech for assistant text
#[async_trait]
pub trait SpeechGateway: Send + Sync {
    async fn synthesize(&self, text: &str, persona: Persona) -> Result<AudioClip, SpeechError>;
}

/// A synthesized audio payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub data: Bytes,
    pub content_type: String,
}

impl AudioClip {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            content_type: DEFAULT_AUDIO_CONTENT_TYPE.to_string(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
