//! Audio playback engines
//!
//! The coordinator drives an engine through explicit calls instead of reacting to
//! engine callbacks. Any engine (a native sink, a browser bridge, a test double)
//! only has to honor these five operations, keyed by message id.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::providers::AudioClip;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("No audio bound for message {0}")]
    NotLoaded(String),

    #[error("Playback engine rejected {message_id}: {reason}")]
    Rejected { message_id: String, reason: String },
}

/// Engine that owns the actual audio resources
pub trait PlaybackEngine: Send + Sync {
    /// Bind a clip to a message id, acquiring whatever resource playback needs
    fn load(&self, message_id: &str, clip: &AudioClip) -> Result<(), PlaybackError>;

    /// Start or resume playback
    fn play(&self, message_id: &str) -> Result<(), PlaybackError>;

    /// Pause, keeping the position
    fn pause(&self, message_id: &str) -> Result<(), PlaybackError>;

    /// Pause and rewind to the start
    fn stop(&self, message_id: &str);

    /// Free the resource bound to a message id
    fn release(&self, message_id: &str);
}

#[derive(Debug, Clone, Default)]
struct Track {
    bytes: usize,
    playing: bool,
    /// Number of times playback was started from the beginning
    starts: u32,
    at_start: bool,
}

/// Engine that tracks playback without producing sound.
///
/// Used when the presentation layer plays the cached clips itself and reports
/// back through the session, and as the default engine of the HTTP binary.
#[derive(Debug, Default)]
pub struct HeadlessEngine {
    tracks: Mutex<HashMap<String, Track>>,
}

impl HeadlessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, message_id: &str) -> bool {
        self.tracks.lock().contains_key(message_id)
    }

    pub fn is_playing(&self, message_id: &str) -> bool {
        self.tracks
            .lock()
            .get(message_id)
            .map_or(false, |t| t.playing)
    }

    pub fn loaded_count(&self) -> usize {
        self.tracks.lock().len()
    }

    /// How many times a track started from its beginning
    pub fn starts(&self, message_id: &str) -> u32 {
        self.tracks.lock().get(message_id).map_or(0, |t| t.starts)
    }
}

impl PlaybackEngine for HeadlessEngine {
    fn load(&self, message_id: &str, clip: &AudioClip) -> Result<(), PlaybackError> {
        if clip.is_empty() {
            return Err(PlaybackError::Rejected {
                message_id: message_id.to_string(),
                reason: "empty clip".to_string(),
            });
        }
        self.tracks.lock().insert(
            message_id.to_string(),
            Track {
                bytes: clip.len(),
                playing: false,
                starts: 0,
                at_start: true,
            },
        );
        tracing::debug!(message_id, bytes = clip.len(), "Audio bound");
        Ok(())
    }

    fn play(&self, message_id: &str) -> Result<(), PlaybackError> {
        let mut tracks = self.tracks.lock();
        let track = tracks
            .get_mut(message_id)
            .ok_or_else(|| PlaybackError::NotLoaded(message_id.to_string()))?;
        if track.at_start {
            track.starts += 1;
        }
        track.playing = true;
        track.at_start = false;
        Ok(())
    }

    fn pause(&self, message_id: &str) -> Result<(), PlaybackError> {
        let mut tracks = self.tracks.lock();
        let track = tracks
            .get_mut(message_id)
            .ok_or_else(|| PlaybackError::NotLoaded(message_id.to_string()))?;
        track.playing = false;
        Ok(())
    }

    fn stop(&self, message_id: &str) {
        if let Some(track) = self.tracks.lock().get_mut(message_id) {
            track.playing = false;
            track.at_start = true;
        }
    }

    fn release(&self, message_id: &str) {
        if let Some(track) = self.tracks.lock().remove(message_id) {
            tracing::debug!(message_id, bytes = track.bytes, "Audio released");
        }
    }
}
