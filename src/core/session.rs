//! Session controller
//!
//! The SessionController is the core of Vista's client state. It:
//! 1. Keeps exactly one active conversation (or an unsaved draft at startup)
//! 2. Mediates every read and write of the conversation store
//! 3. Allows at most one in-flight chat request per session
//! 4. Applies replies to the conversation that sent them, even if it is no
//!    longer active, and drops them if that conversation was deleted
//! 5. Routes playback intents to the playback coordinator
//!
//! State lives behind a synchronous lock that is never held across an await,
//! so loads, persona switches and playback toggles stay responsive while a
//! chat request is in flight.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::conversation::{Conversation, ConversationSummary, Message, Persona, Role};
use crate::providers::{AudioClip, ChatGateway};

use super::memory::{ConversationMap, ConversationStore, StoreError};
use super::playback::{PlaybackCoordinator, PlaybackState};

/// Assistant message appended when the chat gateway fails
pub const FALLBACK_REPLY: &str = "I apologize, but I encountered an error. Please try again later.";

/// Errors surfaced to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result of a completed send
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    pub conversation_id: String,
    pub user_message: Message,
    /// Assistant reply or fallback; `None` when the conversation was deleted
    /// before the reply arrived
    pub reply: Option<Message>,
    /// Gateway failure text when the reply is the fallback
    pub error: Option<String>,
}

/// Everything the presentation layer needs to render the session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub active_conversation_id: Option<String>,
    pub active_messages: Vec<Message>,
    pub pending_request: bool,
    pub last_error: Option<String>,
    pub selected_persona: Persona,
    pub speech_enabled: bool,
    pub currently_playing_message_id: Option<String>,
    pub playback: PlaybackState,
}

struct SessionState {
    conversations: ConversationMap,
    active_id: Option<String>,
    /// Unsaved conversation shown until the first one is created
    draft: Conversation,
    selected_persona: Persona,
    pending: bool,
    last_error: Option<String>,
    speech_enabled: bool,
    /// Bumped on every mutation of `conversations`
    revision: u64,
}

impl SessionState {
    fn active(&self) -> Option<&Conversation> {
        self.active_id
            .as_ref()
            .and_then(|id| self.conversations.get(id))
    }

    /// The active conversation, or the draft when none exists yet
    fn visible(&self) -> &Conversation {
        self.active().unwrap_or(&self.draft)
    }

    /// Replace the draft with a fresh one for the selected persona, returning
    /// the id its audio was cached under
    fn reset_draft(&mut self) -> String {
        let fresh = Conversation::new(self.selected_persona);
        std::mem::replace(&mut self.draft, fresh).id
    }

    fn insert_active(&mut self, conversation: Conversation) -> String {
        let id = conversation.id.clone();
        self.conversations.insert(id.clone(), conversation);
        self.active_id = Some(id.clone());
        self.revision += 1;
        id
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            revision: self.revision,
            conversations: self.conversations.clone(),
        }
    }
}

/// Point-in-time copy of the conversations, tagged with its revision
struct StoreSnapshot {
    revision: u64,
    conversations: ConversationMap,
}

pub struct SessionController {
    chat: Arc<dyn ChatGateway>,
    store: Arc<dyn ConversationStore>,
    playback: PlaybackCoordinator,
    state: Mutex<SessionState>,
    /// Revision last written to the store; also serializes writes
    persisted: Arc<tokio::sync::Mutex<Option<u64>>>,
}

impl SessionController {
    /// Open a session over the persisted conversations.
    ///
    /// No conversation is active until the first send or explicit creation.
    pub async fn open(
        store: Arc<dyn ConversationStore>,
        chat: Arc<dyn ChatGateway>,
        playback: PlaybackCoordinator,
        config: &SessionConfig,
    ) -> Result<Self, StoreError> {
        let conversations = store.load_all().await?;
        tracing::info!(count = conversations.len(), "Loaded conversations");

        let persona = config.default_persona;
        Ok(Self {
            chat,
            store,
            playback,
            state: Mutex::new(SessionState {
                conversations,
                active_id: None,
                draft: Conversation::new(persona),
                selected_persona: persona,
                pending: false,
                last_error: None,
                speech_enabled: config.speech_enabled,
                revision: 0,
            }),
            persisted: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    /// Create a conversation seeded with the persona's greeting and make it
    /// active. Only local persistence happens; no gateway is called.
    pub async fn create_conversation(&self, persona: Persona) -> String {
        let (id, abandoned, snapshot) = {
            let mut state = self.state.lock();
            state.selected_persona = persona;
            let abandoned = state.reset_draft();
            let id = state.insert_active(Conversation::new(persona));
            (id, abandoned, state.snapshot())
        };
        self.playback.stop_all();
        self.playback.release_conversation(&abandoned);
        tracing::info!(conversation_id = %id, %persona, "Created conversation");

        self.persist(snapshot).await;
        id
    }

    /// Start a fresh conversation with another persona. Existing
    /// conversations keep the persona they were created with.
    pub async fn switch_persona(&self, persona: Persona) -> String {
        self.create_conversation(persona).await
    }

    /// Make a stored conversation active and return its messages
    pub fn load_conversation(&self, id: &str) -> Result<Vec<Message>, SessionError> {
        let (messages, abandoned) = {
            let mut state = self.state.lock();
            let conversation = state
                .conversations
                .get(id)
                .ok_or_else(|| SessionError::NotFound(format!("conversation {}", id)))?;
            let persona = conversation.persona;
            let messages = conversation.messages.clone();

            state.active_id = Some(id.to_string());
            state.selected_persona = persona;
            (messages, state.reset_draft())
        };
        self.playback.stop_all();
        self.playback.release_conversation(&abandoned);
        tracing::debug!(conversation_id = id, "Loaded conversation");
        Ok(messages)
    }

    /// Delete a conversation and its cached audio.
    ///
    /// Deleting the active conversation immediately creates a replacement with
    /// the selected persona; its id is returned.
    pub async fn delete_conversation(&self, id: &str) -> Result<Option<String>, SessionError> {
        let (replacement, snapshot) = {
            let mut state = self.state.lock();
            if state.conversations.remove(id).is_none() {
                return Err(SessionError::NotFound(format!("conversation {}", id)));
            }
            state.revision += 1;

            let replacement = if state.active_id.as_deref() == Some(id) {
                let persona = state.selected_persona;
                Some(state.insert_active(Conversation::new(persona)))
            } else {
                None
            };
            (replacement, state.snapshot())
        };

        self.playback.stop_all();
        self.playback.release_conversation(id);
        tracing::info!(conversation_id = id, replacement = ?replacement, "Deleted conversation");

        self.persist(snapshot).await;
        Ok(replacement)
    }

    /// Send a user message and wait for the assistant's reply.
    ///
    /// The user message is appended before the gateway is called and is never
    /// rolled back. Exactly one assistant message follows it: the reply, or
    /// [`FALLBACK_REPLY`] when the gateway fails. Dropping the returned future
    /// early still appends the fallback.
    pub async fn send_message(
        &self,
        text: &str,
        persona: Persona,
    ) -> Result<SendOutcome, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::InvalidInput("message is empty".to_string()));
        }

        let (conversation_id, user_message, abandoned, snapshot) = {
            let mut state = self.state.lock();
            if state.pending {
                return Err(SessionError::InvalidInput(
                    "a reply is still pending".to_string(),
                ));
            }

            let mut abandoned = None;
            let conversation_id = match state.active().map(|c| c.id.clone()) {
                Some(id) => id,
                None => {
                    // First send of the session: the draft becomes real
                    let conversation = if state.draft.persona == persona {
                        std::mem::replace(&mut state.draft, Conversation::new(persona))
                    } else {
                        abandoned = Some(state.reset_draft());
                        Conversation::new(persona)
                    };
                    state.insert_active(conversation)
                }
            };

            let user_message = match state.conversations.get_mut(&conversation_id) {
                Some(conversation) => conversation.add_user(text).clone(),
                None => {
                    return Err(SessionError::NotFound(format!(
                        "conversation {}",
                        conversation_id
                    )))
                }
            };
            state.pending = true;
            state.last_error = None;
            state.revision += 1;

            (conversation_id, user_message, abandoned, state.snapshot())
        };

        if let Some(draft_id) = abandoned {
            self.playback.release_conversation(&draft_id);
        }

        let guard = InFlight {
            session: self,
            conversation_id: conversation_id.clone(),
            done: false,
        };

        self.persist(snapshot).await;

        tracing::debug!(conversation_id = %conversation_id, %persona, "Requesting reply");
        let result = self.chat.reply(text, persona).await.map_err(|e| {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "Chat gateway failed");
            e.to_string()
        });

        let (reply, error, snapshot) = guard.complete(result);
        self.persist(snapshot).await;

        Ok(SendOutcome {
            conversation_id,
            user_message,
            reply,
            error,
        })
    }

    /// Apply a reply (or failure) to the conversation that requested it
    fn finish_send(
        &self,
        conversation_id: &str,
        result: Result<String, String>,
    ) -> (Option<Message>, Option<String>, StoreSnapshot) {
        let mut state = self.state.lock();
        state.pending = false;

        let error = result.as_ref().err().cloned();
        if let Some(e) = &error {
            state.last_error = Some(e.clone());
        }

        let reply = match state.conversations.get_mut(conversation_id) {
            Some(conversation) => {
                let reply = match &result {
                    Ok(content) => {
                        let reply = conversation.add_assistant(content).clone();
                        if conversation.set_title_once() {
                            tracing::debug!(conversation_id, title = %conversation.title, "Titled conversation");
                        }
                        reply
                    }
                    Err(_) => conversation.add_assistant(FALLBACK_REPLY).clone(),
                };
                state.revision += 1;
                Some(reply)
            }
            None => {
                tracing::debug!(conversation_id, "Conversation deleted before reply arrived, discarding");
                None
            }
        };

        (reply, error, state.snapshot())
    }

    /// Toggle speech playback for a message of the visible conversation.
    ///
    /// Ignored while speech is disabled. Speech failures are not errors: the
    /// returned state simply stays idle.
    pub async fn toggle_playback(&self, message_id: &str) -> Result<PlaybackState, SessionError> {
        let (message, conversation_id, persona) = {
            let state = self.state.lock();
            let conversation = state.visible();
            let message = conversation
                .message(message_id)
                .cloned()
                .ok_or_else(|| SessionError::NotFound(format!("message {}", message_id)))?;
            if message.role != Role::Assistant {
                return Err(SessionError::InvalidInput(
                    "only assistant messages can be played".to_string(),
                ));
            }
            if !state.speech_enabled {
                tracing::debug!(message_id, "Speech disabled, ignoring playback toggle");
                return Ok(self.playback.state());
            }
            (message, conversation.id.clone(), conversation.persona)
        };

        Ok(self.playback.play(&message, &conversation_id, persona).await)
    }

    /// Stop any playback
    pub fn stop_playback(&self) {
        self.playback.stop_all();
    }

    /// The engine or presentation layer reports a clip finished
    pub fn playback_ended(&self, message_id: &str) {
        self.playback.playback_ended(message_id);
    }

    pub fn cached_audio(&self, message_id: &str) -> Option<AudioClip> {
        self.playback.cached_audio(message_id)
    }

    pub fn set_speech_enabled(&self, enabled: bool) {
        self.state.lock().speech_enabled = enabled;
        if !enabled {
            self.playback.stop_all();
        }
        tracing::info!(enabled, "Speech preference changed");
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        let active_messages = state
            .visible()
            .messages
            .iter()
            .map(|m| {
                let mut m = m.clone();
                if self.playback.is_cached(&m.id) {
                    m.audio_cache_key = Some(m.id.clone());
                }
                m
            })
            .collect();

        SessionSnapshot {
            active_conversation_id: state.active().map(|c| c.id.clone()),
            active_messages,
            pending_request: state.pending,
            last_error: state.last_error.clone(),
            selected_persona: state.selected_persona,
            speech_enabled: state.speech_enabled,
            currently_playing_message_id: self.playback.currently_playing(),
            playback: self.playback.state(),
        }
    }

    /// Messages of the active conversation (or the draft greeting)
    pub fn active_messages(&self) -> Vec<Message> {
        self.state.lock().visible().messages.clone()
    }

    pub fn active_conversation_id(&self) -> Option<String> {
        self.state.lock().active_id.clone()
    }

    pub fn selected_persona(&self) -> Persona {
        self.state.lock().selected_persona
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.state.lock().conversations.get(id).cloned()
    }

    /// Conversation summaries, most recently updated first
    pub fn list_conversations(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<_> = self
            .state
            .lock()
            .conversations
            .values()
            .map(Conversation::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// Stop playback, release all audio and write the latest state
    pub async fn shutdown(&self) {
        self.playback.shutdown();
        let snapshot = self.state.lock().snapshot();
        self.persist(snapshot).await;
        tracing::info!("Session shut down");
    }

    /// Write a snapshot unless a newer one has already been written.
    /// Failures are logged; the in-memory state stays authoritative.
    async fn persist(&self, snapshot: StoreSnapshot) {
        write_snapshot(self.store.as_ref(), &self.persisted, snapshot).await;
    }
}

async fn write_snapshot(
    store: &dyn ConversationStore,
    persisted: &tokio::sync::Mutex<Option<u64>>,
    snapshot: StoreSnapshot,
) {
    let mut persisted = persisted.lock().await;
    if persisted.map_or(false, |done| snapshot.revision <= done) {
        return;
    }
    match store.save_all(&snapshot.conversations).await {
        Ok(()) => *persisted = Some(snapshot.revision),
        Err(e) => tracing::error!(error = %e, revision = snapshot.revision, "Failed to persist conversations"),
    }
}

/// Marks a chat request in flight. If the send future is dropped before the
/// reply arrives, the fallback is still appended and the pending flag cleared.
struct InFlight<'a> {
    session: &'a SessionController,
    conversation_id: String,
    done: bool,
}

impl InFlight<'_> {
    fn complete(
        mut self,
        result: Result<String, String>,
    ) -> (Option<Message>, Option<String>, StoreSnapshot) {
        self.done = true;
        self.session.finish_send(&self.conversation_id, result)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(conversation_id = %self.conversation_id, "Chat request cancelled");
            let (_, _, snapshot) = self
                .session
                .finish_send(&self.conversation_id, Err("request cancelled".to_string()));

            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let store = self.session.store.clone();
                    let persisted = self.session.persisted.clone();
                    runtime.spawn(async move {
                        write_snapshot(store.as_ref(), &persisted, snapshot).await;
                    });
                }
                // Outside a runtime the next persist writes it
                Err(_) => tracing::warn!("No runtime to persist cancelled request"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::HeadlessEngine;
    use crate::core::memory::SqliteConversationStore;
    use crate::providers::{GatewayError, SpeechError, SpeechGateway};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    /// Chat gateway double
    struct StubChat {
        reply: Result<String, u16>,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl StubChat {
        fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }

        fn failing(status: u16) -> Self {
            Self {
                reply: Err(status),
                ..Self::replying("")
            }
        }

        fn gated(text: &str, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::replying(text)
            }
        }
    }

    #[async_trait]
    impl ChatGateway for StubChat {
        async fn reply(&self, _message: &str, _persona: Persona) -> Result<String, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(status) => Err(GatewayError::Status {
                    status: *status,
                    message: "Internal Server Error".into(),
                }),
            }
        }
    }

    struct StubSpeech {
        payload: Vec<u8>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpeechGateway for StubSpeech {
        async fn synthesize(&self, _text: &str, _persona: Persona) -> Result<AudioClip, SpeechError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AudioClip::new(self.payload.clone()))
        }
    }

    struct Fixture {
        session: Arc<SessionController>,
        store: Arc<SqliteConversationStore>,
        chat: Arc<StubChat>,
        speech: Arc<StubSpeech>,
    }

    async fn fixture_with(chat: StubChat, audio: &[u8]) -> Fixture {
        let store = Arc::new(SqliteConversationStore::new_in_memory().await.unwrap());
        let chat = Arc::new(chat);
        let speech = Arc::new(StubSpeech {
            payload: audio.to_vec(),
            calls: AtomicUsize::new(0),
        });
        let playback = PlaybackCoordinator::new(Arc::new(HeadlessEngine::new()), speech.clone());
        let session = SessionController::open(
            store.clone(),
            chat.clone(),
            playback,
            &SessionConfig::default(),
        )
        .await
        .unwrap();

        Fixture {
            session: Arc::new(session),
            store,
            chat,
            speech,
        }
    }

    async fn fixture(chat: StubChat) -> Fixture {
        fixture_with(chat, b"RIFF").await
    }

    #[tokio::test]
    async fn test_anxious_scenario() {
        let f = fixture(StubChat::replying("Try breathing exercises")).await;

        let id = f.session.create_conversation(Persona::Arjun).await;
        assert_eq!(f.session.conversation(&id).unwrap().messages.len(), 1);

        let outcome = assert_ok!(f.session.send_message("I feel anxious", Persona::Arjun).await);
        assert_eq!(outcome.conversation_id, id);
        assert!(outcome.error.is_none());

        let conversation = f.session.conversation(&id).unwrap();
        assert_eq!(conversation.messages.len(), 3);
        assert_eq!(conversation.messages[1].content, "I feel anxious");
        assert_eq!(conversation.messages[2].content, "Try breathing exercises");
        assert_eq!(conversation.title, "I feel anxious");
        assert!(!f.session.is_pending());

        // Persisted after the reply
        let stored = f.store.load_all().await.unwrap();
        assert_eq!(stored.get(&id), Some(&conversation));
    }

    #[tokio::test]
    async fn test_gateway_failure_appends_fallback() {
        let f = fixture(StubChat::failing(500)).await;
        let id = f.session.create_conversation(Persona::Arjun).await;

        let outcome = assert_ok!(f.session.send_message("hi", Persona::Arjun).await);

        let conversation = f.session.conversation(&id).unwrap();
        assert_eq!(conversation.messages.len(), 3);
        assert_eq!(conversation.messages[1].content, "hi");
        assert_eq!(conversation.messages[2].content, FALLBACK_REPLY);
        assert!(outcome.error.is_some());
        assert!(f.session.last_error().is_some());
        // Title only changes on a successful reply
        assert!(conversation.has_default_title());
    }

    #[tokio::test]
    async fn test_lazy_creation_on_first_send() {
        let f = fixture(StubChat::replying("hello")).await;

        let draft = f.session.active_messages();
        assert_eq!(draft.len(), 1);
        assert!(f.session.active_conversation_id().is_none());
        assert!(f.store.load_all().await.unwrap().is_empty());

        let outcome = f.session.send_message("hi", Persona::Arjun).await.unwrap();

        let conversation = f.session.conversation(&outcome.conversation_id).unwrap();
        assert_eq!(conversation.messages.len(), 3);
        // The greeting the user saw is the one that was saved
        assert_eq!(conversation.messages[0].id, draft[0].id);
        assert_eq!(f.session.active_conversation_id(), Some(conversation.id));
    }

    #[tokio::test]
    async fn test_rejects_empty_message() {
        let f = fixture(StubChat::replying("unused")).await;
        let id = f.session.create_conversation(Persona::Rohan).await;

        let err = assert_err!(f.session.send_message("   \n\t", Persona::Rohan).await);
        assert!(matches!(err, SessionError::InvalidInput(_)));
        assert_eq!(f.session.conversation(&id).unwrap().messages.len(), 1);
        assert_eq!(f.chat.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejects_send_while_pending() {
        let gate = Arc::new(Notify::new());
        let f = fixture(StubChat::gated("done", gate.clone())).await;
        let id = f.session.create_conversation(Persona::Arjun).await;

        let first = {
            let session = f.session.clone();
            tokio::spawn(async move { session.send_message("first", Persona::Arjun).await })
        };
        while !f.session.is_pending() {
            tokio::task::yield_now().await;
        }

        let before = f.session.conversation(&id).unwrap();
        let err = f.session.send_message("second", Persona::Arjun).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
        assert_eq!(f.session.conversation(&id).unwrap(), before);

        gate.notify_one();
        first.await.unwrap().unwrap();

        assert!(!f.session.is_pending());
        assert_eq!(f.session.conversation(&id).unwrap().messages.len(), 3);
        assert_eq!(f.chat.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reply_lands_in_originating_conversation_after_switch() {
        let gate = Arc::new(Notify::new());
        let f = fixture(StubChat::gated("late reply", gate.clone())).await;
        let original = f.session.create_conversation(Persona::Arjun).await;

        let send = {
            let session = f.session.clone();
            tokio::spawn(async move { session.send_message("hello", Persona::Arjun).await })
        };
        while !f.session.is_pending() {
            tokio::task::yield_now().await;
        }

        let switched = f.session.switch_persona(Persona::Priya).await;
        gate.notify_one();
        send.await.unwrap().unwrap();

        assert_eq!(f.session.active_conversation_id(), Some(switched.clone()));
        assert_eq!(f.session.conversation(&switched).unwrap().messages.len(), 1);

        let original = f.session.conversation(&original).unwrap();
        assert_eq!(original.messages.len(), 3);
        assert_eq!(original.messages[2].content, "late reply");
    }

    #[tokio::test]
    async fn test_reply_for_deleted_conversation_is_discarded() {
        let gate = Arc::new(Notify::new());
        let f = fixture(StubChat::gated("too late", gate.clone())).await;
        let doomed = f.session.create_conversation(Persona::Arjun).await;

        let send = {
            let session = f.session.clone();
            tokio::spawn(async move { session.send_message("hello", Persona::Arjun).await })
        };
        while !f.session.is_pending() {
            tokio::task::yield_now().await;
        }

        let replacement = f.session.delete_conversation(&doomed).await.unwrap();
        gate.notify_one();
        let outcome = send.await.unwrap().unwrap();

        assert!(outcome.reply.is_none());
        assert!(!f.session.is_pending());
        assert!(f.session.conversation(&doomed).is_none());

        let replacement = f.session.conversation(&replacement.unwrap()).unwrap();
        assert_eq!(replacement.messages.len(), 1);
        assert!(!f.store.load_all().await.unwrap().contains_key(&doomed));
    }

    #[tokio::test]
    async fn test_cancelled_send_still_gets_fallback() {
        let gate = Arc::new(Notify::new());
        let f = fixture(StubChat::gated("never", gate)).await;
        let id = f.session.create_conversation(Persona::Arjun).await;

        let send = {
            let session = f.session.clone();
            tokio::spawn(async move { session.send_message("hello", Persona::Arjun).await })
        };
        while !f.session.is_pending() {
            tokio::task::yield_now().await;
        }
        send.abort();
        let _ = send.await;

        assert!(!f.session.is_pending());
        let conversation = f.session.conversation(&id).unwrap();
        assert_eq!(conversation.messages.len(), 3);
        assert_eq!(conversation.messages[2].content, FALLBACK_REPLY);

        // The fallback reaches the store without any further mutation
        let stored = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stored = f.store.load_all().await.unwrap();
                if stored.get(&id).map_or(false, |c| c.messages.len() == 3) {
                    return stored;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stored.get(&id), Some(&conversation));
    }

    #[tokio::test]
    async fn test_delete_inactive_stops_playback() {
        let f = fixture(StubChat::replying("ok")).await;
        let inactive = f.session.create_conversation(Persona::Arjun).await;
        f.session.create_conversation(Persona::Rohan).await;
        let greeting = f.session.active_messages()[0].clone();
        f.session.toggle_playback(&greeting.id).await.unwrap();
        assert_eq!(f.session.snapshot().currently_playing_message_id, Some(greeting.id.clone()));

        assert_eq!(f.session.delete_conversation(&inactive).await.unwrap(), None);

        let snapshot = f.session.snapshot();
        assert!(snapshot.currently_playing_message_id.is_none());
        assert_eq!(snapshot.playback, PlaybackState::Idle);
        // Audio of the surviving conversation stays cached
        assert!(f.session.cached_audio(&greeting.id).is_some());
    }

    #[tokio::test]
    async fn test_abandoned_draft_audio_is_released() {
        let f = fixture(StubChat::replying("ok")).await;
        let greeting = f.session.active_messages()[0].clone();
        f.session.toggle_playback(&greeting.id).await.unwrap();
        assert!(f.session.cached_audio(&greeting.id).is_some());

        f.session.create_conversation(Persona::Arjun).await;

        assert!(f.session.cached_audio(&greeting.id).is_none());
    }

    #[tokio::test]
    async fn test_draft_audio_released_when_first_send_changes_persona() {
        let f = fixture(StubChat::replying("ok")).await;
        let greeting = f.session.active_messages()[0].clone();
        f.session.toggle_playback(&greeting.id).await.unwrap();

        let outcome = f.session.send_message("hi", Persona::Priya).await.unwrap();

        let conversation = f.session.conversation(&outcome.conversation_id).unwrap();
        assert_ne!(conversation.messages[0].id, greeting.id);
        assert!(f.session.cached_audio(&greeting.id).is_none());
    }

    #[tokio::test]
    async fn test_promoted_draft_keeps_audio() {
        let f = fixture(StubChat::replying("ok")).await;
        let greeting = f.session.active_messages()[0].clone();
        f.session.toggle_playback(&greeting.id).await.unwrap();

        f.session.send_message("hi", Persona::Arjun).await.unwrap();

        assert!(f.session.cached_audio(&greeting.id).is_some());
    }

    #[tokio::test]
    async fn test_delete_active_leaves_one_active() {
        let f = fixture(StubChat::replying("ok")).await;
        f.session.create_conversation(Persona::Arjun).await;
        let active = f.session.switch_persona(Persona::Anjali).await;

        let replacement = f.session.delete_conversation(&active).await.unwrap().unwrap();

        assert_eq!(f.session.active_conversation_id(), Some(replacement.clone()));
        let conversation = f.session.conversation(&replacement).unwrap();
        assert_eq!(conversation.persona, Persona::Anjali);
        assert_eq!(f.session.list_conversations().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_inactive_keeps_active() {
        let f = fixture(StubChat::replying("ok")).await;
        let old = f.session.create_conversation(Persona::Arjun).await;
        let active = f.session.create_conversation(Persona::Arjun).await;

        assert_eq!(f.session.delete_conversation(&old).await.unwrap(), None);
        assert_eq!(f.session.active_conversation_id(), Some(active));

        let err = f.session.delete_conversation(&old).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_load_conversation() {
        let f = fixture(StubChat::replying("reply")).await;
        let first = f.session.create_conversation(Persona::Rohan).await;
        f.session.send_message("question", Persona::Rohan).await.unwrap();
        f.session.switch_persona(Persona::Priya).await;

        let stored = f.session.conversation(&first).unwrap();
        let messages = f.session.load_conversation(&first).unwrap();

        assert_eq!(messages, stored.messages);
        assert_eq!(f.session.active_messages(), stored.messages);
        assert_eq!(f.session.conversation(&first).unwrap().updated_at, stored.updated_at);
        assert_eq!(f.session.selected_persona(), Persona::Rohan);

        let err = f.session.load_conversation("missing").unwrap_err();
        assert_eq!(err, SessionError::NotFound("conversation missing".into()));
    }

    #[tokio::test]
    async fn test_list_orders_by_recent_update() {
        let f = fixture(StubChat::replying("reply")).await;
        let older = f.session.create_conversation(Persona::Arjun).await;
        let newer = f.session.create_conversation(Persona::Arjun).await;

        f.session.load_conversation(&older).unwrap();
        f.session.send_message("bump", Persona::Arjun).await.unwrap();

        let ids: Vec<_> = f.session.list_conversations().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![older, newer]);
    }

    #[tokio::test]
    async fn test_reopen_restores_conversations() {
        let f = fixture(StubChat::replying("reply")).await;
        let id = f.session.create_conversation(Persona::Arjun).await;
        f.session.send_message("persist me", Persona::Arjun).await.unwrap();
        let expected = f.session.conversation(&id).unwrap();

        let playback = PlaybackCoordinator::new(Arc::new(HeadlessEngine::new()), f.speech.clone());
        let reopened = SessionController::open(
            f.store.clone(),
            f.chat.clone(),
            playback,
            &SessionConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(reopened.conversation(&id), Some(expected));
        assert!(reopened.active_conversation_id().is_none());
    }

    #[tokio::test]
    async fn test_toggle_playback_routes_to_coordinator() {
        let f = fixture(StubChat::replying("a calm reply")).await;
        f.session.create_conversation(Persona::Arjun).await;
        let outcome = f.session.send_message("hello", Persona::Arjun).await.unwrap();
        let reply = outcome.reply.unwrap();

        let state = f.session.toggle_playback(&reply.id).await.unwrap();
        assert_eq!(state, PlaybackState::Playing { message_id: reply.id.clone() });

        let snapshot = f.session.snapshot();
        assert_eq!(snapshot.currently_playing_message_id, Some(reply.id.clone()));
        let rendered = snapshot.active_messages.iter().find(|m| m.id == reply.id).unwrap();
        assert_eq!(rendered.audio_cache_key, Some(reply.id.clone()));

        let state = f.session.toggle_playback(&reply.id).await.unwrap();
        assert_eq!(state, PlaybackState::Paused { message_id: reply.id.clone() });
        assert_eq!(f.speech.calls.load(Ordering::SeqCst), 1);

        let err = f.session.toggle_playback(&outcome.user_message.id).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
        let err = f.session.toggle_playback("nope").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_audio_is_silent() {
        let f = fixture_with(StubChat::replying("reply"), b"").await;
        let greeting = f.session.active_messages()[0].clone();

        let state = f.session.toggle_playback(&greeting.id).await.unwrap();

        assert_eq!(state, PlaybackState::Idle);
        assert!(f.session.snapshot().currently_playing_message_id.is_none());
    }

    #[tokio::test]
    async fn test_speech_disabled_ignores_toggles() {
        let f = fixture(StubChat::replying("reply")).await;
        let greeting = f.session.active_messages()[0].clone();

        f.session.toggle_playback(&greeting.id).await.unwrap();
        f.session.set_speech_enabled(false);
        assert_eq!(f.session.snapshot().playback, PlaybackState::Idle);

        let state = f.session.toggle_playback(&greeting.id).await.unwrap();
        assert_eq!(state, PlaybackState::Idle);
        assert_eq!(f.speech.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_releases_audio() {
        let f = fixture(StubChat::replying("reply")).await;
        let id = f.session.create_conversation(Persona::Arjun).await;
        let greeting = f.session.active_messages()[0].clone();
        f.session.toggle_playback(&greeting.id).await.unwrap();
        assert!(f.session.cached_audio(&greeting.id).is_some());

        f.session.delete_conversation(&id).await.unwrap();

        assert!(f.session.cached_audio(&greeting.id).is_none());
        assert!(f.session.snapshot().currently_playing_message_id.is_none());
    }

    #[tokio::test]
    async fn test_send_count_invariant() {
        let f = fixture(StubChat::replying("ok")).await;
        let id = f.session.create_conversation(Persona::Priya).await;

        for (i, text) in ["one", "two", "three", "four"].iter().enumerate() {
            f.session.send_message(text, Persona::Priya).await.unwrap();
            let conversation = f.session.conversation(&id).unwrap();
            assert_eq!(conversation.messages.len(), 1 + 2 * (i + 1));
        }
        assert_eq!(f.session.conversation(&id).unwrap().title, "one");
    }
}
