//! Shared test scaffolding: in-process gateway assembly, a mock identity
//! provider, and SSE frame parsing.
#![allow(dead_code)]

use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use unigate::auth::broker::OauthBroker;
use unigate::auth::sealed::SealKey;
use unigate::auth::store::{Credentials, TokenStore};
use unigate::config::Config;
use unigate::idp::IdpClient;
use unigate::router::RequestRouter;
use unigate::services::Service;
use unigate::services::supervisor::SupervisorService;
use unigate::session::SessionRegistry;
use unigate::state::AppState;
use unigate::web::create_router;
use unigate::web::rate_limit::RequestRateLimiter;
use unigate::worker::supervisor::{Supervisor, SupervisorConfig};

/// Worker port ranges are carved out per gateway so parallel tests do not
/// collide. Each gateway gets a window of 50 ports.
static NEXT_BASE_PORT: AtomicU16 = AtomicU16::new(23100);

/// A gateway assembled in-process, serving on an ephemeral port, with its
/// periodic supervisor loops running.
pub struct TestGateway {
    pub base_url: String,
    pub state: AppState,
    pub http: reqwest::Client,
    _data_dir: TempDir,
}

impl TestGateway {
    pub fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    /// Seed long-lived credentials for a user, as a completed OAuth flow
    /// would have.
    pub async fn seed_credentials(&self, user_id: &str) {
        let store = TokenStore::new(
            self.state.config.data_dir.clone(),
            SealKey::load_or_generate(None, &self.state.config.data_dir.join("seal.key"))
                .expect("seal key"),
            Duration::from_secs(300),
        );
        store
            .save(
                user_id,
                &Credentials {
                    user_id: user_id.to_owned(),
                    access_token: "at-seeded".to_owned(),
                    refresh_token: "rt-seeded".to_owned(),
                    expires_at: chrono::Utc::now() + chrono::Duration::hours(2),
                },
            )
            .await
            .expect("seed credentials");
    }
}

/// Default test configuration as JSON, before tweaks.
fn config_json(data_dir: &std::path::Path, idp_base: &str) -> Value {
    let base_port = NEXT_BASE_PORT.fetch_add(50, Ordering::SeqCst);
    json!({
        "port": base_port + 49,
        "idp_app_id": "cli_test",
        "idp_app_secret": "test-secret",
        "idp_redirect_uri": "http://localhost:3000/oauth/callback",
        "idp_base_url": idp_base,
        "worker_binary": env!("CARGO_BIN_EXE_mock-worker"),
        "worker_base_port": base_port,
        "worker_default_port": base_port + 48,
        "worker_port_window": 40,
        "max_instances": 20,
        "idle_timeout": "60s",
        "session_ttl": "1h",
        "rate_limit_max_requests": 600,
        "rate_limit_window": "60s",
        "rate_limit_burst": 200,
        "snapshot_interval": "60s",
        "data_dir": data_dir,
        "token_cache_ttl": "5m",
        "readiness_timeout": "10s",
        "readiness_poll": "100ms",
        "liveness_interval": "300ms",
        "reap_interval": "300ms",
        "stop_grace": "1s",
        "forward_timeout": "5s",
        "bootstrap_timeout": "2s",
        "shutdown_timeout": "5s",
    })
}

/// Assemble and serve a gateway. `tweak` may adjust the JSON configuration
/// before it is parsed.
pub async fn spawn_gateway(idp_base: &str, tweak: impl FnOnce(&mut Value)) -> TestGateway {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let mut raw = config_json(data_dir.path(), idp_base);
    tweak(&mut raw);
    let config: Config = serde_json::from_value(raw).expect("test config parses");
    config.validate().expect("test config validates");
    let config = Arc::new(config);

    let seal = SealKey::load_or_generate(None, &config.data_dir.join("seal.key")).expect("seal");
    let store = Arc::new(TokenStore::new(
        config.data_dir.clone(),
        seal,
        config.token_cache_ttl,
    ));
    let idp = Arc::new(
        IdpClient::new(
            config.idp_base_url.clone(),
            config.idp_app_id.clone(),
            config.idp_app_secret.clone(),
            config.idp_redirect_uri.clone(),
        )
        .expect("idp client"),
    );
    let broker = Arc::new(OauthBroker::new(idp, store));
    let sessions = Arc::new(SessionRegistry::new(config.max_sessions, config.session_ttl));
    let supervisor =
        Supervisor::new(SupervisorConfig::from_config(&config)).expect("supervisor");
    supervisor.initialize().await.expect("default worker starts");
    let router = Arc::new(
        RequestRouter::new(
            supervisor.clone(),
            sessions.clone(),
            broker.clone(),
            config.forward_timeout,
        )
        .expect("router"),
    );
    let limiter = Arc::new(RequestRateLimiter::new(
        config.rate_limit_max_requests,
        config.rate_limit_window,
        config.rate_limit_burst,
    ));

    let state = AppState {
        config,
        sessions,
        supervisor,
        broker,
        router,
        limiter,
        started_at: Instant::now(),
    };

    // Periodic supervisor loops (reaper, liveness sweep, housekeeping).
    let mut service = SupervisorService::new(state.clone());
    tokio::spawn(async move {
        let _ = service.run().await;
    });

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("gateway serve");
    });

    TestGateway {
        base_url: format!("http://{addr}"),
        state,
        http: reqwest::Client::new(),
        _data_dir: data_dir,
    }
}

/// Serve a stub identity provider and return its base URL.
///
/// The token endpoint accepts any code, the refresh endpoint rotates the
/// access token, and user-info always resolves to `union_id` "on-testuser".
pub async fn spawn_mock_idp() -> String {
    use axum::routing::{get, post};

    let app = axum::Router::new()
        .route(
            "/authen/v1/access_token",
            post(|| async {
                axum::Json(json!({
                    "code": 0,
                    "msg": "success",
                    "data": {
                        "access_token": "at-test",
                        "refresh_token": "rt-test",
                        "expires_in": 7200,
                        "token_type": "Bearer",
                        "scope": "contact:user.base:read",
                    },
                }))
            }),
        )
        .route(
            "/authen/v1/refresh_access_token",
            post(|| async {
                axum::Json(json!({
                    "code": 0,
                    "msg": "success",
                    "data": {
                        "access_token": "at-refreshed",
                        "expires_in": 7200,
                        "token_type": "Bearer",
                    },
                }))
            }),
        )
        .route(
            "/authen/v1/user_info",
            get(|| async {
                axum::Json(json!({
                    "code": 0,
                    "msg": "success",
                    "data": {
                        "union_id": "on-testuser",
                        "user_id": "u-testuser",
                        "name": "Test User",
                    },
                }))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock idp");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock idp serve");
    });
    format!("http://{addr}")
}

/// Read `want` SSE events (frames with a data field) from a streaming
/// response, asserting the deadline.
pub async fn read_sse_events(
    response: &mut reqwest::Response,
    want: usize,
    deadline: Duration,
) -> Vec<(String, Value)> {
    let mut buffer = String::new();
    let mut events: Vec<(String, Value)> = Vec::new();

    let outcome = tokio::time::timeout(deadline, async {
        while events.len() < want {
            let Some(chunk) = response.chunk().await.expect("stream read") else {
                break;
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(split) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..split + 2).collect();
                let mut event_name = String::new();
                let mut data = String::new();
                for line in frame.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        event_name = value.trim().to_owned();
                    } else if let Some(value) = line.strip_prefix("data:") {
                        if !data.is_empty() {
                            data.push('\n');
                        }
                        data.push_str(value.trim());
                    }
                }
                if !data.is_empty() {
                    let payload: Value = serde_json::from_str(&data).expect("event data is JSON");
                    events.push((event_name, payload));
                }
            }
        }
    })
    .await;

    assert!(outcome.is_ok(), "timed out waiting for {want} SSE events");
    events
}

/// Poll an async condition until it holds or the deadline passes.
pub async fn eventually<F, Fut>(timeout: Duration, what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "condition not met within {timeout:?}: {what}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
