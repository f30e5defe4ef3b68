//! Playback coordinator
//!
//! Owns the audio cache and the single "currently playing" pointer. Playback
//! moves through an explicit state machine:
//!
//! ```text
//! Idle -> Loading -> Playing <-> Paused
//!   ^        |          |          |
//!   +--------+----------+----------+   (stop, failure, end of clip)
//! ```
//!
//! Speech failures never escape: they are logged and playback stays idle.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::conversation::{Message, Persona};
use crate::providers::{AudioClip, SpeechError, SpeechGateway};

use super::engine::{PlaybackEngine, PlaybackError};

/// Where the coordinator is in its state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Loading {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Playing {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Paused {
        #[serde(rename = "messageId")]
        message_id: String,
    },
}

impl PlaybackState {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            PlaybackState::Idle => None,
            PlaybackState::Loading { message_id }
            | PlaybackState::Playing { message_id }
            | PlaybackState::Paused { message_id } => Some(message_id),
        }
    }

    fn is_loading(&self, id: &str) -> bool {
        matches!(self, PlaybackState::Loading { message_id } if message_id == id)
    }
}

/// Cached audio bound to the engine. Dropping the handle releases the engine
/// resource, whether or not the clip was ever played.
struct AudioHandle {
    message_id: String,
    conversation_id: String,
    clip: AudioClip,
    engine: Arc<dyn PlaybackEngine>,
}

impl AudioHandle {
    fn bind(
        engine: Arc<dyn PlaybackEngine>,
        message_id: &str,
        conversation_id: &str,
        clip: AudioClip,
    ) -> Result<Self, PlaybackError> {
        engine.load(message_id, &clip)?;
        Ok(Self {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            clip,
            engine,
        })
    }
}

impl Drop for AudioHandle {
    fn drop(&mut self) {
        self.engine.release(&self.message_id);
    }
}

/// An in-flight speech request
struct PendingLoad {
    ticket: u64,
    conversation_id: String,
}

struct Inner {
    state: PlaybackState,
    cache: HashMap<String, AudioHandle>,
    pending: Option<PendingLoad>,
    next_ticket: u64,
}

pub struct PlaybackCoordinator {
    engine: Arc<dyn PlaybackEngine>,
    speech: Arc<dyn SpeechGateway>,
    inner: Mutex<Inner>,
}

impl PlaybackCoordinator {
    pub fn new(engine: Arc<dyn PlaybackEngine>, speech: Arc<dyn SpeechGateway>) -> Self {
        Self {
            engine,
            speech,
            inner: Mutex::new(Inner {
                state: PlaybackState::Idle,
                cache: HashMap::new(),
                pending: None,
                next_ticket: 0,
            }),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().state.clone()
    }

    /// Message that is playing or paused, if any
    pub fn currently_playing(&self) -> Option<String> {
        match &self.inner.lock().state {
            PlaybackState::Playing { message_id } | PlaybackState::Paused { message_id } => {
                Some(message_id.clone())
            }
            _ => None,
        }
    }

    pub fn is_cached(&self, message_id: &str) -> bool {
        self.inner.lock().cache.contains_key(message_id)
    }

    pub fn cached_audio(&self, message_id: &str) -> Option<AudioClip> {
        self.inner.lock().cache.get(message_id).map(|h| h.clip.clone())
    }

    pub fn cached_count(&self) -> usize {
        self.inner.lock().cache.len()
    }

    /// Toggle playback of an assistant message.
    ///
    /// Replaying the current message pauses or resumes it without a network
    /// call. Any other message stops the current one first, then plays from the
    /// cache or synthesizes speech. Returns the resulting state.
    pub async fn play(
        &self,
        message: &Message,
        conversation_id: &str,
        persona: Persona,
    ) -> PlaybackState {
        let id = message.id.as_str();

        let ticket = {
            let mut inner = self.inner.lock();

            match inner.state.clone() {
                PlaybackState::Playing { message_id } if message_id == id => {
                    match self.engine.pause(id) {
                        Ok(()) => inner.state = PlaybackState::Paused { message_id },
                        Err(e) => self.fail_locked(&mut inner, id, e),
                    }
                    return inner.state.clone();
                }
                PlaybackState::Paused { message_id } if message_id == id => {
                    match self.engine.play(id) {
                        Ok(()) => inner.state = PlaybackState::Playing { message_id },
                        Err(e) => self.fail_locked(&mut inner, id, e),
                    }
                    return inner.state.clone();
                }
                // Already fetching this message
                PlaybackState::Loading { message_id } if message_id == id => {
                    return inner.state.clone();
                }
                _ => {}
            }

            self.stop_locked(&mut inner);

            if inner.cache.contains_key(id) {
                self.start_locked(&mut inner, id);
                return inner.state.clone();
            }

            inner.next_ticket += 1;
            let ticket = inner.next_ticket;
            inner.pending = Some(PendingLoad {
                ticket,
                conversation_id: conversation_id.to_string(),
            });
            inner.state = PlaybackState::Loading {
                message_id: id.to_string(),
            };
            ticket
        };

        tracing::debug!(message_id = id, %persona, "Synthesizing speech");
        let result = self.speech.synthesize(&message.content, persona).await;

        let mut inner = self.inner.lock();

        let still_wanted = inner.state.is_loading(id)
            && inner.pending.as_ref().map(|p| p.ticket) == Some(ticket);
        if !still_wanted {
            tracing::debug!(message_id = id, "Discarding superseded speech result");
            return inner.state.clone();
        }
        inner.pending = None;

        let clip = match result {
            Ok(clip) if clip.is_empty() => {
                tracing::warn!(message_id = id, error = %SpeechError::EmptyAudio, "Speech unavailable");
                inner.state = PlaybackState::Idle;
                return inner.state.clone();
            }
            Ok(clip) => clip,
            Err(e) => {
                tracing::warn!(message_id = id, error = %e, "Speech unavailable");
                inner.state = PlaybackState::Idle;
                return inner.state.clone();
            }
        };

        match AudioHandle::bind(self.engine.clone(), id, conversation_id, clip) {
            Ok(handle) => {
                inner.cache.insert(id.to_string(), handle);
                self.start_locked(&mut inner, id);
            }
            Err(e) => {
                tracing::warn!(message_id = id, error = %e, "Could not bind audio");
                inner.state = PlaybackState::Idle;
            }
        }
        inner.state.clone()
    }

    /// Stop whatever is playing or loading
    pub fn stop_all(&self) {
        let mut inner = self.inner.lock();
        self.stop_locked(&mut inner);
    }

    /// Report that a clip played to its end
    pub fn playback_ended(&self, message_id: &str) {
        let mut inner = self.inner.lock();
        if inner.state.message_id() == Some(message_id)
            && matches!(inner.state, PlaybackState::Playing { .. })
        {
            self.engine.stop(message_id);
            inner.state = PlaybackState::Idle;
        }
    }

    /// Release every cached clip of a conversation, stopping it if it is the
    /// current target
    pub fn release_conversation(&self, conversation_id: &str) {
        let mut inner = self.inner.lock();

        let current_is_owned = match &inner.state {
            PlaybackState::Idle => false,
            PlaybackState::Loading { .. } => inner
                .pending
                .as_ref()
                .map_or(false, |p| p.conversation_id == conversation_id),
            PlaybackState::Playing { message_id } | PlaybackState::Paused { message_id } => inner
                .cache
                .get(message_id)
                .map_or(false, |h| h.conversation_id == conversation_id),
        };
        if current_is_owned {
            self.stop_locked(&mut inner);
        }

        let before = inner.cache.len();
        inner
            .cache
            .retain(|_, handle| handle.conversation_id != conversation_id);
        let released = before - inner.cache.len();
        if released > 0 {
            tracing::debug!(conversation_id, released, "Released cached audio");
        }
    }

    /// Stop playback and release every cached clip
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        self.stop_locked(&mut inner);
        inner.cache.clear();
    }

    fn stop_locked(&self, inner: &mut Inner) {
        match &inner.state {
            PlaybackState::Playing { message_id } | PlaybackState::Paused { message_id } => {
                self.engine.stop(message_id);
            }
            PlaybackState::Loading { .. } => {
                // The in-flight result is discarded on arrival
                inner.pending = None;
            }
            PlaybackState::Idle => {}
        }
        inner.state = PlaybackState::Idle;
    }

    fn start_locked(&self, inner: &mut Inner, id: &str) {
        match self.engine.play(id) {
            Ok(()) => {
                inner.state = PlaybackState::Playing {
                    message_id: id.to_string(),
                }
            }
            Err(e) => self.fail_locked(inner, id, e),
        }
    }

    /// Engine failure: drop back to idle and release the clip
    fn fail_locked(&self, inner: &mut Inner, id: &str, error: PlaybackError) {
        tracing::warn!(message_id = id, error = %error, "Playback failed");
        inner.state = PlaybackState::Idle;
        inner.cache.remove(id);
    }
}

impl Drop for PlaybackCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
