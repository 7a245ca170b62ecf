//! Authorization-code flow: happy path, replay rejection, parameter
//! validation, and credential persistence.

mod helpers;

use helpers::{spawn_gateway, spawn_mock_idp};
use serde_json::Value;

/// Follow /oauth/start without following the redirect, returning the state
/// parameter the gateway generated.
async fn start_and_extract_state(gateway: &helpers::TestGateway, session_id: &str) -> String {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client");

    let response = client
        .get(gateway.url(&format!("/oauth/start?sessionId={session_id}")))
        .send()
        .await
        .expect("oauth start");
    assert_eq!(response.status(), 307);

    let location = response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .expect("redirect location")
        .to_owned();
    let url = url::Url::parse(&location).expect("authorization url parses");
    url.query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .expect("state parameter present")
}

#[tokio::test]
async fn oauth_happy_path_binds_session_and_persists_tokens() {
    let idp = spawn_mock_idp().await;
    let gateway = spawn_gateway(&idp, |_| {}).await;

    let session_id = "aaaabbbbccccddddeeeeffff00001111";
    let state = start_and_extract_state(&gateway, session_id).await;
    assert!(state.ends_with(&format!("_{session_id}")));

    let before = chrono::Utc::now();
    let response = gateway
        .http
        .get(gateway.url(&format!("/oauth/callback?code=test-code&state={state}")))
        .send()
        .await
        .expect("callback");
    assert_eq!(response.status(), 200);
    let body = response.text().await.expect("body");
    assert!(body.contains("successful"));

    // The session is now bound to the provider's stable identity.
    assert_eq!(
        gateway.state.sessions.user_of(session_id),
        Some("on-testuser".to_owned())
    );

    // Credentials landed on disk with an absolute expiry ≈ now + expires_in.
    let tokens_path = gateway
        .state
        .config
        .data_dir
        .join("user-on-testuser/tokens.json");
    let raw = std::fs::read_to_string(&tokens_path).expect("tokens.json exists");
    let record: Value = serde_json::from_str(&raw).expect("tokens.json is JSON");
    assert_eq!(record["user_id"], "on-testuser");
    let expires_at: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(record["expires_at"].clone()).expect("absolute expiry");
    let lifetime = (expires_at - before).num_seconds();
    assert!((7100..=7300).contains(&lifetime), "lifetime was {lifetime}s");

    // Refresh tokens are sealed at rest.
    assert!(raw.contains("sealed:"));
    assert!(!raw.contains("rt-test"));
}

#[tokio::test]
async fn replayed_state_is_rejected() {
    let idp = spawn_mock_idp().await;
    let gateway = spawn_gateway(&idp, |_| {}).await;

    let session_id = "bbbbccccddddeeeeffff000011112222";
    let state = start_and_extract_state(&gateway, session_id).await;

    let first = gateway
        .http
        .get(gateway.url(&format!("/oauth/callback?code=c1&state={state}")))
        .send()
        .await
        .expect("first callback");
    assert_eq!(first.status(), 200);

    let replay = gateway
        .http
        .get(gateway.url(&format!("/oauth/callback?code=c1&state={state}")))
        .send()
        .await
        .expect("replayed callback");
    assert_eq!(replay.status(), 400);
    let body = replay.text().await.expect("body");
    assert!(body.contains("invalid or expired state"));
}

#[tokio::test]
async fn start_requires_session_id() {
    let idp = spawn_mock_idp().await;
    let gateway = spawn_gateway(&idp, |_| {}).await;

    let response = gateway
        .http
        .get(gateway.url("/oauth/start"))
        .send()
        .await
        .expect("oauth start");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn provider_denial_renders_error_page() {
    let idp = spawn_mock_idp().await;
    let gateway = spawn_gateway(&idp, |_| {}).await;

    let response = gateway
        .http
        .get(gateway.url("/oauth/callback?error=access_denied"))
        .send()
        .await
        .expect("callback");
    assert_eq!(response.status(), 400);
    let body = response.text().await.expect("body");
    assert!(body.contains("identity provider"));
    // No internals leak into the page.
    assert!(!body.contains("access_denied"));
}

#[tokio::test]
async fn forged_state_for_foreign_session_is_rejected() {
    let idp = spawn_mock_idp().await;
    let gateway = spawn_gateway(&idp, |_| {}).await;

    let session_id = "ccccddddeeeeffff0000111122223333";
    let state = start_and_extract_state(&gateway, session_id).await;
    let (token, _) = state.rsplit_once('_').expect("state has separator");

    let forged = format!("{token}_attacker-session");
    let response = gateway
        .http
        .get(gateway.url(&format!("/oauth/callback?code=c&state={forged}")))
        .send()
        .await
        .expect("callback");
    assert_eq!(response.status(), 400);

    // The real session can still complete afterwards.
    let response = gateway
        .http
        .get(gateway.url(&format!("/oauth/callback?code=c&state={state}")))
        .send()
        .await
        .expect("callback");
    assert_eq!(response.status(), 200);
}
