//! REST endpoints for session management.
//!
//! - `GET    /api/sessions`       — list live sessions
//! - `DELETE /api/sessions/{id}`  — terminate a session and forget it

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use crate::AppState;

/// `GET /api/sessions` — summaries of every live session.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.registry.list() }))
}

/// `DELETE /api/sessions/{id}` — same as a `close` frame.
pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.registry.close(&id).await {
        Ok(true) => {
            info!("Session {id} closed via REST");
            Ok(Json(json!({ "ok": true, "session_id": id })))
        }
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("session {id} not found") })),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}
