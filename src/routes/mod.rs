//! API routes

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::conversation::{persona_catalog, ConversationSummary, Message, Persona, PersonaInfo};
use crate::core::{PlaybackState, SendOutcome, SessionError, SessionSnapshot};
use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Error body returned by every failing handler
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidInput(_) => Self::bad_request(e.to_string()),
            SessionError::NotFound(_) => Self::not_found(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

fn parse_persona(raw: &str) -> Result<Persona, ApiError> {
    raw.parse::<Persona>()
        .map_err(|e| ApiError::bad_request(e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub persona: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchPersonaRequest {
    pub persona: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    #[serde(default)]
    pub persona: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SpeechPreferenceRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreated {
    pub conversation_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDeleted {
    pub deleted: String,
    pub replacement_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoadedConversation {
    pub messages: Vec<Message>,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn session_snapshot(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.session.snapshot())
}

async fn personas() -> Json<Vec<PersonaInfo>> {
    Json(persona_catalog())
}

async fn list_conversations(State(state): State<AppState>) -> Json<Vec<ConversationSummary>> {
    Json(state.session.list_conversations())
}

async fn create_conversation(
    State(state): State<AppState>,
    body: Option<Json<CreateConversationRequest>>,
) -> Result<(StatusCode, Json<ConversationCreated>), ApiError> {
    let persona = match body.and_then(|Json(b)| b.persona) {
        Some(raw) => parse_persona(&raw)?,
        None => state.session.selected_persona(),
    };
    let conversation_id = state.session.create_conversation(persona).await;
    Ok((StatusCode::CREATED, Json(ConversationCreated { conversation_id })))
}

async fn load_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LoadedConversation>, ApiError> {
    let messages = state.session.load_conversation(&id)?;
    Ok(Json(LoadedConversation { messages }))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDeleted>, ApiError> {
    let replacement_id = state.session.delete_conversation(&id).await?;
    Ok(Json(ConversationDeleted {
        deleted: id,
        replacement_id,
    }))
}

async fn switch_persona(
    State(state): State<AppState>,
    Json(request): Json<SwitchPersonaRequest>,
) -> Result<(StatusCode, Json<ConversationCreated>), ApiError> {
    let persona = parse_persona(&request.persona)?;
    let conversation_id = state.session.switch_persona(persona).await;
    Ok((StatusCode::CREATED, Json(ConversationCreated { conversation_id })))
}

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<SendOutcome>, ApiError> {
    let persona = match request.persona.as_deref() {
        Some(raw) => parse_persona(raw)?,
        None => state.session.selected_persona(),
    };

    // Detached so a client disconnect does not cancel the exchange
    let session = state.session.clone();
    let outcome = tokio::spawn(async move { session.send_message(&request.text, persona).await })
        .await
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })??;

    Ok(Json(outcome))
}

async fn toggle_playback(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PlaybackState>, ApiError> {
    Ok(Json(state.session.toggle_playback(&id).await?))
}

async fn stop_playback(State(state): State<AppState>) -> StatusCode {
    state.session.stop_playback();
    StatusCode::NO_CONTENT
}

async fn playback_ended(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.session.playback_ended(&id);
    StatusCode::NO_CONTENT
}

async fn message_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let clip = state
        .session
        .cached_audio(&id)
        .ok_or_else(|| ApiError::not_found(format!("no audio cached for message {}", id)))?;

    Ok(([(header::CONTENT_TYPE, clip.content_type)], clip.data).into_response())
}

async fn set_speech_preference(
    State(state): State<AppState>,
    Json(request): Json<SpeechPreferenceRequest>,
) -> StatusCode {
    state.session.set_speech_enabled(request.enabled);
    StatusCode::NO_CONTENT
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/session", get(session_snapshot))
        .route("/v1/personas", get(personas))
        .route(
            "/v1/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/v1/conversations/:id", delete(delete_conversation))
        .route("/v1/conversations/:id/load", post(load_conversation))
        .route("/v1/persona", post(switch_persona))
        .route("/v1/messages", post(send_message))
        .route("/v1/messages/:id/playback", post(toggle_playback))
        .route("/v1/messages/:id/playback/ended", post(playback_ended))
        .route("/v1/messages/:id/audio", get(message_audio))
        .route("/v1/playback/stop", post(stop_playback))
        .route("/v1/preferences/speech", put(set_speech_preference))
}
