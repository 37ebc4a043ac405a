//! REST endpoints for calls, chat and presence.

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{Path, State},
    Json,
};
use parley_core::{CallError, CallId, CallSession};
use parley_protocol::{CallDecision, CallKind, ChatMessage, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub recipient_id: UserId,
    #[serde(default = "default_call_type")]
    pub call_type: String,
}

fn default_call_type() -> String {
    CallKind::Audio.as_str().to_string()
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub call_id: String,
    pub response: String,
}

#[derive(Debug, Deserialize)]
pub struct EndRequest {
    pub call_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub receiver_id: UserId,
    pub content: String,
    #[serde(default)]
    pub sender_username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub delivered: bool,
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub user_id: UserId,
    pub online: bool,
}

fn outcome<T>(operation: &'static str, result: &Result<T, CallError>) {
    let label = match result {
        Ok(_) => "ok",
        Err(CallError::Offline(_)) => "offline",
        Err(CallError::NotFound(_)) => "not_found",
        Err(CallError::InvalidState { .. }) => "invalid_state",
        Err(_) => "rejected",
    };
    metrics::record_call(operation, label);
}

/// `POST /call/initiate`
pub async fn initiate_call(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(request): Json<InitiateRequest>,
) -> Result<Json<CallSession>, ApiError> {
    let kind: CallKind = request
        .call_type
        .parse()
        .map_err(|_| CallError::InvalidKind(request.call_type.clone()))?;

    let result = state.hub.initiate(user.user_id, request.recipient_id, kind);
    outcome("initiate", &result);
    Ok(Json(result?))
}

/// `POST /call/respond`
pub async fn respond_call(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(request): Json<RespondRequest>,
) -> Result<Json<CallSession>, ApiError> {
    let decision: CallDecision = request
        .response
        .parse()
        .map_err(|_| CallError::InvalidDecision(request.response.clone()))?;

    let result = state
        .hub
        .respond(&CallId::from(request.call_id), user.user_id, decision);
    outcome("respond", &result);
    Ok(Json(result?))
}

/// `POST /call/end`
pub async fn end_call(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(request): Json<EndRequest>,
) -> Result<Json<CallSession>, ApiError> {
    let result = state.hub.end(&CallId::from(request.call_id), user.user_id);
    outcome("end", &result);
    Ok(Json(result?))
}

/// `GET /call/active`
pub async fn active_calls(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
) -> Json<Vec<CallSession>> {
    Json(state.hub.active_calls(user.user_id))
}

/// `GET /call/session/:call_id`, visible to participants only.
pub async fn get_call(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Path(call_id): Path<String>,
) -> Result<Json<CallSession>, ApiError> {
    let id = CallId::from(call_id);
    let session = state
        .hub
        .call(&id)
        .ok_or_else(|| CallError::NotFound(id.clone()))?;
    if !session.involves(user.user_id) {
        return Err(CallError::NotParticipant(id).into());
    }
    Ok(Json(session))
}

/// `POST /chat/send`
pub async fn send_chat(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::BadRequest("Message content is empty".into()));
    }

    let (message, delivered) = state.hub.send_chat(
        user.user_id,
        request.receiver_id,
        request.content,
        request.sender_username,
    );
    debug!(message = message.id, delivered = delivered, "Chat sent over HTTP");
    Ok(Json(ChatResponse { message, delivered }))
}

/// `GET /users/:user_id/presence`
pub async fn presence(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        user_id,
        online: state.hub.is_online(user_id),
    })
}
