//! JSON-RPC reply endpoint.

use crate::state::AppState;
use crate::web::error::ApiError;
use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
pub struct MessagesParams {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// `POST /messages?sessionId=` — forward a JSON-RPC request to the session's
/// worker. The response is always a JSON-RPC envelope; only a missing
/// session id is an HTTP-level error.
pub async fn messages_handler(
    State(state): State<AppState>,
    Query(params): Query<MessagesParams>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let session_id = params
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("sessionId query parameter is required"))?;

    state.sessions.ensure(&session_id);
    let response = state.router.route(&session_id, body).await;
    Ok(Json(response))
}
