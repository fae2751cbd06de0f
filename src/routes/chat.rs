//! Chat REST API — request/response mirror of the chat RPC methods.
//!
//! Useful for clients that want reliable delivery without holding a socket:
//! the message is accepted synchronously, the turn runs in the background,
//! and history catches the result. No streaming events are produced here.
//!
//! - `GET  /api/sessions/{id}/messages[?after=<msg_id>]`
//! - `POST /api/sessions/{id}/messages`  `{content}`
//! - `POST /api/sessions/{id}/cancel`
//! - `POST /api/permissions/{id}`        `{session_id, allowed}`
//! - `POST /api/questions/{id}`          `{session_id, answer}`

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::sessions::{HistoryMessage, Role};
use crate::state::AppState;
use crate::ws::pump::drain_to_history;

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Session not found"})),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    /// Return only messages strictly after this message id.
    pub after: Option<String>,
}

/// `GET /api/sessions/{id}/messages` — session history, optionally resumed.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    if state.sessions.get(&session_id).await.is_none() {
        return not_found();
    }
    let messages = match query.after {
        Some(after) => state.sessions.history_after(&session_id, &after).await,
        None => state.sessions.history(&session_id).await,
    };
    Json(json!({"session_id": session_id, "messages": messages})).into_response()
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

/// `POST /api/sessions/{id}/messages` — accept a message and run the turn in
/// the background. History is updated with the same aggregation rules as the
/// streaming path.
pub async fn send_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Response {
    if state.sessions.get(&session_id).await.is_none() {
        return not_found();
    }

    let user_msg = HistoryMessage::new(Role::User, req.content.clone());
    let message_id = user_msg.id.clone();
    if let Err(e) = state.sessions.append_message(&session_id, user_msg).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response();
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let task_state = state.clone();
    let task_session = session_id.clone();
    tokio::spawn(async move {
        let agent = task_state.pool.get_or_create(&task_session).await;
        match agent.send_message(&req.content).await {
            Ok(events) => drain_to_history(&task_state.sessions, &task_session, events).await,
            Err(e) => warn!(session_id = %task_session, "Failed to start turn: {e}"),
        }
        task_state.pool.release(&task_session).await;
    });

    Json(json!({
        "request_id": request_id,
        "message_id": message_id,
        "session_id": session_id,
        "status": "accepted",
    }))
    .into_response()
}

/// `POST /api/sessions/{id}/cancel` — interrupt the running turn.
pub async fn cancel(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    if state.sessions.get(&session_id).await.is_none() {
        return not_found();
    }
    let agent = state.pool.get_or_create(&session_id).await;
    let result = agent.interrupt().await;
    state.pool.release(&session_id).await;
    match result {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct PermissionRequest {
    pub session_id: String,
    pub allowed: bool,
}

/// `POST /api/permissions/{id}` — answer a pending permission request.
pub async fn permission_response(
    State(state): State<AppState>,
    Path(permission_id): Path<String>,
    Json(req): Json<PermissionRequest>,
) -> Response {
    let agent = state.pool.get_or_create(&req.session_id).await;
    let result = agent.respond_to_permission(&permission_id, req.allowed).await;
    state.pool.release(&req.session_id).await;
    match result {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct QuestionRequest {
    pub session_id: String,
    pub answer: String,
}

/// `POST /api/questions/{id}` — answer a pending user question.
pub async fn question_response(
    State(state): State<AppState>,
    Path(question_id): Path<String>,
    Json(req): Json<QuestionRequest>,
) -> Response {
    let agent = state.pool.get_or_create(&req.session_id).await;
    let result = agent.respond_to_question(&question_id, &req.answer).await;
    state.pool.release(&req.session_id).await;
    match result {
        Ok(()) => Json(json!({"success": true})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}
