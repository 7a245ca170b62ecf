//! Per-caller request rate limiting.
//!
//! The limiter key is the session id when the request names one, otherwise
//! the originating IP. Keying by session first keeps one NATed address from
//! exhausting a named session's budget, and vice versa.

use crate::state::AppState;
use crate::web::error::ApiError;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::warn;

/// Keyed token-bucket limiter shared by all request paths.
pub struct RequestRateLimiter {
    limiter: RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>,
}

impl RequestRateLimiter {
    pub fn new(max_requests: u32, window: Duration, burst: u32) -> Self {
        let quota = Quota::with_period(window / max_requests.max(1))
            .expect("rate period is nonzero")
            .allow_burst(NonZeroU32::new(burst.max(1)).expect("burst is nonzero"));
        Self {
            limiter: RateLimiter::keyed(quota),
        }
    }

    /// Whether a request under this key may proceed now.
    pub fn check(&self, key: &str) -> bool {
        self.limiter.check_key(&key.to_owned()).is_ok()
    }

    /// Drop bucket state for keys that have gone quiet. Runs on the
    /// periodic sweep cadence to bound memory.
    pub fn sweep(&self) {
        self.limiter.retain_recent();
    }
}

/// Axum middleware enforcing the keyed limit.
pub async fn enforce(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let key = session_key(request.uri().query()).unwrap_or_else(|| addr.ip().to_string());
    if state.limiter.check(&key) {
        next.run(request).await
    } else {
        warn!(key, path = request.uri().path(), "request rate limited");
        ApiError::rate_limited().into_response()
    }
}

/// Extract a non-empty `sessionId` from the raw query string.
fn session_key(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "sessionId")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}
