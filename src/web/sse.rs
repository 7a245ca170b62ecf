//! Event-stream endpoint: session bootstrap over SSE.
//!
//! The stream opens with a comment frame (flushing headers immediately),
//! then emits one `metadata` event and one `capabilities` event, then stays
//! open with keepalive comments. Bootstrap introspection runs under a soft
//! timeout; a sick default worker degrades to fallback payloads instead of
//! failing the stream. Dropping the connection cancels everything.

use crate::session::generate_session_id;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tracing::info;

/// Cadence of keepalive comment frames.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
pub struct SseParams {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

enum Phase {
    Open,
    Metadata,
    Capabilities,
    Idle,
}

pub async fn sse_handler(
    State(state): State<AppState>,
    Query(params): Query<SseParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = params
        .session_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(generate_session_id);
    state.sessions.ensure(&session_id);
    info!(session_id, "event stream opened");

    let stream = futures::stream::unfold(
        (Phase::Open, state, session_id),
        |(phase, state, session_id)| async move {
            match phase {
                Phase::Open => Some((
                    Ok(Event::default().comment("stream open")),
                    (Phase::Metadata, state, session_id),
                )),
                Phase::Metadata => {
                    let event = metadata_event(&state, &session_id).await;
                    Some((Ok(event), (Phase::Capabilities, state, session_id)))
                }
                Phase::Capabilities => {
                    let event = capabilities_event(&state).await;
                    Some((Ok(event), (Phase::Idle, state, session_id)))
                }
                // Keepalives take over; the stream ends only when the client
                // disconnects and the whole generator is dropped.
                Phase::Idle => {
                    futures::future::pending::<()>().await;
                    None
                }
            }
        },
    );

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

/// Session bootstrap payload: reply endpoint, authentication state, tool
/// list, and (for unauthenticated sessions) the authorization URL.
async fn metadata_event(state: &AppState, session_id: &str) -> Event {
    let tools = match tokio::time::timeout(
        state.config.bootstrap_timeout,
        state.router.bootstrap_tools(),
    )
    .await
    {
        Ok(tools) => tools,
        Err(_) => json!([]),
    };

    let authenticated = state.sessions.user_of(session_id).is_some();
    let mut payload = json!({
        "type": "metadata",
        "endpoint": format!(
            "{}/messages?sessionId={}",
            state.config.public_base_url(),
            session_id
        ),
        "session_id": session_id,
        "authenticated": authenticated,
        "tools": tools,
    });
    if !authenticated {
        payload["oauth_url"] = json!(state.broker.authorize_url(session_id));
    }

    Event::default().event("metadata").data(payload.to_string())
}

async fn capabilities_event(state: &AppState) -> Event {
    let capabilities = match tokio::time::timeout(
        state.config.bootstrap_timeout,
        state.router.bootstrap_capabilities(),
    )
    .await
    {
        Ok(capabilities) => capabilities,
        Err(_) => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": { "listChanged": false } },
        }),
    };

    let payload = json!({
        "type": "capabilities",
        "capabilities": capabilities,
    });
    Event::default()
        .event("capabilities")
        .data(payload.to_string())
}
