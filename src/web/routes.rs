//! Router construction and the introspection endpoints.

use crate::state::AppState;
use crate::web::{messages, oauth, rate_limit, sse};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::{Router, middleware};
use chrono::Utc;
use serde_json::{Value, json};
use std::time::Duration;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{Span, debug, warn};

/// Creates the gateway router.
///
/// The event stream lives outside the timeout layer (it is long-lived by
/// design); everything else gets a request timeout slightly above the
/// forward timeout so worker stalls surface as JSON-RPC errors, not as
/// severed connections.
pub fn create_router(state: AppState) -> Router {
    let request_timeout = state.config.forward_timeout + Duration::from_secs(5);

    let bounded = Router::new()
        .route("/messages", post(messages::messages_handler))
        .route("/tools", get(tools))
        .route("/oauth/start", get(oauth::oauth_start))
        .route("/oauth/callback", get(oauth::oauth_callback))
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/sse", get(sse::sse_handler))
        .merge(bounded)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::enforce,
        ))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<Body>| {
                    tracing::debug_span!("request", path = request.uri().path())
                })
                .on_request(())
                .on_body_chunk(())
                .on_eos(())
                .on_response(
                    |response: &Response<Body>, latency: Duration, _span: &Span| {
                        debug!(
                            latency = format!("{latency:.2?}"),
                            status = response.status().as_u16(),
                            "response"
                        );
                    },
                )
                .on_failure(
                    |error: ServerErrorsFailureClass, latency: Duration, _span: &Span| {
                        warn!(
                            error = ?error,
                            latency = format!("{latency:.2?}"),
                            "request failed"
                        );
                    },
                ),
        )
        .with_state(state)
}

/// `GET /tools` — current tool list, degrading to the fallback set.
async fn tools(State(state): State<AppState>) -> Json<Value> {
    let tools = match tokio::time::timeout(
        state.config.bootstrap_timeout,
        state.router.bootstrap_tools(),
    )
    .await
    {
        Ok(tools) => tools,
        Err(_) => json!([]),
    };
    Json(json!({ "tools": tools }))
}

/// `GET /health` — gateway health snapshot.
async fn health(State(state): State<AppState>) -> Json<Value> {
    let instances = state.supervisor.counters();
    let sessions = state.sessions.counters();
    let memory = memory_snapshot();
    let within_memory_cap = memory["rssBytes"]
        .as_u64()
        .map(|rss| rss <= state.config.memory_cap_mb * 1024 * 1024)
        .unwrap_or(true);
    let healthy = instances.default_instance_status == "running" && within_memory_cap;

    Json(json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "timestamp": Utc::now().to_rfc3339(),
        "version": format!("{} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_COMMIT_SHORT")),
        "uptime": state.started_at.elapsed().as_secs(),
        "memory": memory,
        "instances": instances,
        "sessions": sessions,
    }))
}

/// Best-effort process memory numbers. Absent on platforms without procfs.
fn memory_snapshot() -> Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            let mut fields = statm.split_whitespace();
            let vsz_pages: Option<u64> = fields.next().and_then(|v| v.parse().ok());
            let rss_pages: Option<u64> = fields.next().and_then(|v| v.parse().ok());
            let page_size = 4096u64;
            if let (Some(vsz), Some(rss)) = (vsz_pages, rss_pages) {
                return json!({
                    "rssBytes": rss * page_size,
                    "vszBytes": vsz * page_size,
                });
            }
        }
    }
    json!({ "rssBytes": Value::Null, "vszBytes": Value::Null })
}
