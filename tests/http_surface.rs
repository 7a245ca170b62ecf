//! HTTP surface contract: parameter validation, introspection endpoints,
//! health snapshot shape, and rate limiting.

mod helpers;

use helpers::{spawn_gateway, spawn_mock_idp};
use serde_json::{Value, json};

#[tokio::test]
async fn messages_requires_session_id() {
    let idp = spawn_mock_idp().await;
    let gateway = spawn_gateway(&idp, |_| {}).await;

    let response = gateway
        .http
        .post(gateway.url("/messages"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .expect("messages");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn tools_endpoint_lists_worker_tools() {
    let idp = spawn_mock_idp().await;
    let gateway = spawn_gateway(&idp, |_| {}).await;

    let body: Value = gateway
        .http
        .get(gateway.url("/tools"))
        .send()
        .await
        .expect("tools")
        .json()
        .await
        .expect("tools json");
    let tools = body["tools"].as_array().expect("tools array");
    assert!(!tools.is_empty());
}

#[tokio::test]
async fn health_reports_counters_and_version() {
    let idp = spawn_mock_idp().await;
    let gateway = spawn_gateway(&idp, |_| {}).await;

    let health: Value = gateway
        .http
        .get(gateway.url("/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("health json");

    assert_eq!(health["status"], "healthy");
    assert!(health["timestamp"].is_string());
    assert!(health["version"].is_string());
    assert!(health["uptime"].is_number());
    assert!(health["memory"].is_object());

    let instances = &health["instances"];
    assert_eq!(instances["defaultInstanceStatus"], "running");
    assert_eq!(instances["totalInstances"], 1);
    assert_eq!(instances["userInstances"], 0);
    assert_eq!(instances["runningInstances"], 1);

    let sessions = &health["sessions"];
    assert!(sessions["totalSessions"].is_number());
    assert!(sessions["authenticatedSessions"].is_number());
    assert!(sessions["recentSessions"].is_number());
}

#[tokio::test]
async fn bursting_session_is_rate_limited() {
    let idp = spawn_mock_idp().await;
    let gateway = spawn_gateway(&idp, |cfg| {
        cfg["rate_limit_max_requests"] = json!(60);
        cfg["rate_limit_burst"] = json!(3);
    })
    .await;

    let mut limited = false;
    for _ in 0..10 {
        let response = gateway
            .http
            .get(gateway.url("/tools?sessionId=rl-test-session"))
            .send()
            .await
            .expect("tools");
        if response.status() == 429 {
            limited = true;
            break;
        }
    }
    assert!(limited, "burst was never rate limited");

    // A different session still has budget.
    let response = gateway
        .http
        .get(gateway.url("/tools?sessionId=rl-other-session"))
        .send()
        .await
        .expect("tools");
    assert_eq!(response.status(), 200);

    // The health endpoint is never rate limited.
    let response = gateway
        .http
        .get(gateway.url("/health"))
        .send()
        .await
        .expect("health");
    assert_eq!(response.status(), 200);
}
