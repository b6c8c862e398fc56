//! Session toggle and status endpoints
//!
//! - `POST /sessions/:user_id/toggle` → `{"action": "created" | "removed"}`
//! - `GET  /sessions/:user_id` → status object, or `null` when no live session

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::registry::{SessionStatus, ToggleAction};
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleResponse {
    pub action: ToggleAction,
}

fn validate_user_id(user_id: &str) -> ApiResult<()> {
    if user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id must not be empty".to_string()));
    }
    Ok(())
}

/// POST /sessions/:user_id/toggle
pub async fn toggle_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<ToggleResponse>> {
    validate_user_id(&user_id)?;

    let action = state.registry.toggle(&user_id).await?;
    info!(user_id = %user_id, action = ?action, "Session toggled");

    Ok(Json(ToggleResponse { action }))
}

/// GET /sessions/:user_id
pub async fn session_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Option<SessionStatus>>> {
    validate_user_id(&user_id)?;

    let status = state.registry.status(&user_id).await?;
    Ok(Json(status))
}

/// Build session routes
pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions/:user_id", get(session_status))
        .route("/sessions/:user_id/toggle", post(toggle_session))
}
