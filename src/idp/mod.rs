//! HTTP client for the external identity provider.
//!
//! The provider speaks a JSON envelope on every endpoint: `code` (0 means
//! success), `msg`, and the payload nested under `data`. The stable identity
//! used throughout the gateway is the `union_id` from the user-info endpoint.

use http::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

/// Scopes requested during authorization.
const OAUTH_SCOPE: &str = "contact:user.base:read";

/// Bound on every call to the provider.
const IDP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum IdpError {
    /// The HTTP exchange itself failed (connect, timeout, TLS).
    #[error("identity provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The provider answered with a non-2xx status.
    #[error("identity provider returned HTTP {0}")]
    Status(StatusCode),
    /// The body did not match the documented envelope.
    #[error("malformed identity provider response: {0}")]
    Decode(String),
    /// The provider reported an application-level error code.
    #[error("identity provider error {code}: {msg}")]
    Api { code: i64, msg: String },
}

/// Token grant returned by the access-token and refresh endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// The provider may omit this on refresh; the previous refresh token
    /// then stays valid.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Relative lifetime in seconds.
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Identity payload from the user-info endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    /// Stable identifier under which credentials are filed.
    pub union_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

/// Client for the provider's authorization endpoints.
pub struct IdpClient {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    redirect_uri: String,
}

impl IdpClient {
    pub fn new(
        base_url: String,
        app_id: String,
        app_secret: String,
        redirect_uri: String,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(IDP_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            app_id,
            app_secret,
            redirect_uri,
        })
    }

    /// Browser-facing authorization URL carrying the given state parameter.
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}/authen/v1/authorize?app_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            self.base_url,
            urlencoding::encode(&self.app_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(OAUTH_SCOPE),
            urlencoding::encode(state),
        )
    }

    /// Exchange an authorization code for a token grant.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, IdpError> {
        let response = self
            .http
            .post(format!("{}/authen/v1/access_token", self.base_url))
            .json(&json!({
                "grant_type": "authorization_code",
                "client_id": self.app_id,
                "client_secret": self.app_secret,
                "code": code,
                "redirect_uri": self.redirect_uri,
            }))
            .send()
            .await?;
        decode(response).await
    }

    /// Exchange a refresh token for a fresh grant.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, IdpError> {
        let response = self
            .http
            .post(format!("{}/authen/v1/refresh_access_token", self.base_url))
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .await?;
        decode(response).await
    }

    /// Fetch the identity behind an access token.
    pub async fn user_info(&self, access_token: &str) -> Result<UserInfo, IdpError> {
        let response = self
            .http
            .get(format!("{}/authen/v1/user_info", self.base_url))
            .bearer_auth(access_token)
            .send()
            .await?;
        decode(response).await
    }
}

/// Unwrap the provider envelope, mapping HTTP and application failures to
/// their own error classes.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, IdpError> {
    let status = response.status();
    if !status.is_success() {
        return Err(IdpError::Status(status));
    }
    let envelope: Envelope<T> = response
        .json()
        .await
        .map_err(|e| IdpError::Decode(e.to_string()))?;
    if envelope.code != 0 {
        return Err(IdpError::Api {
            code: envelope.code,
            msg: envelope.msg,
        });
    }
    envelope
        .data
        .ok_or_else(|| IdpError::Decode("missing data field".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::{get, post};
    use std::sync::Arc;
    use std::sync::Mutex;

    fn client() -> IdpClient {
        IdpClient::new(
            "https://idp.example.com/open-apis/".to_owned(),
            "cli_abc".to_owned(),
            "secret".to_owned(),
            "http://localhost:3000/oauth/callback".to_owned(),
        )
        .unwrap()
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client_for(base: &str) -> IdpClient {
        IdpClient::new(
            base.to_owned(),
            "cli_abc".to_owned(),
            "secret".to_owned(),
            "http://localhost:3000/oauth/callback".to_owned(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn exchange_code_posts_grant_request_and_decodes() {
        let seen: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let app = Router::new().route(
            "/authen/v1/access_token",
            post(move |axum::Json(body): axum::Json<serde_json::Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().unwrap() = Some(body);
                    axum::Json(json!({
                        "code": 0,
                        "msg": "success",
                        "data": {
                            "access_token": "at-1",
                            "refresh_token": "rt-1",
                            "expires_in": 7200,
                        },
                    }))
                }
            }),
        );
        let base = serve(app).await;

        let grant = client_for(&base).exchange_code("the-code").await.unwrap();
        assert_eq!(grant.access_token, "at-1");
        assert_eq!(grant.expires_in, 7200);

        let body = seen.lock().unwrap().clone().expect("request captured");
        assert_eq!(body["grant_type"], "authorization_code");
        assert_eq!(body["code"], "the-code");
        assert_eq!(body["client_id"], "cli_abc");
        assert_eq!(body["redirect_uri"], "http://localhost:3000/oauth/callback");
    }

    #[tokio::test]
    async fn provider_error_code_maps_to_api_error() {
        let app = Router::new().route(
            "/authen/v1/access_token",
            post(|| async {
                axum::Json(json!({ "code": 20024, "msg": "code expired" }))
            }),
        );
        let base = serve(app).await;

        let result = client_for(&base).exchange_code("stale").await;
        match result {
            Err(IdpError::Api { code, msg }) => {
                assert_eq!(code, 20024);
                assert_eq!(msg, "code expired");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_failure_maps_to_status_error() {
        let app = Router::new().route(
            "/authen/v1/access_token",
            post(|| async { (http::StatusCode::BAD_GATEWAY, "upstream down") }),
        );
        let base = serve(app).await;

        let result = client_for(&base).exchange_code("c").await;
        assert!(matches!(
            result,
            Err(IdpError::Status(StatusCode::BAD_GATEWAY))
        ));
    }

    #[tokio::test]
    async fn user_info_sends_bearer_token() {
        let seen: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let app = Router::new().route(
            "/authen/v1/user_info",
            get(move |headers: axum::http::HeaderMap| {
                let captured = captured.clone();
                async move {
                    *captured.lock().unwrap() = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    axum::Json(json!({
                        "code": 0,
                        "data": { "union_id": "on-u1", "name": "User One" },
                    }))
                }
            }),
        );
        let base = serve(app).await;

        let info = client_for(&base).user_info("at-xyz").await.unwrap();
        assert_eq!(info.union_id, "on-u1");
        assert_eq!(
            seen.lock().unwrap().as_deref(),
            Some("Bearer at-xyz")
        );
    }

    #[test]
    fn authorize_url_carries_all_parameters() {
        let url = client().authorize_url("tok_s1");
        assert!(url.starts_with("https://idp.example.com/open-apis/authen/v1/authorize?"));
        assert!(url.contains("app_id=cli_abc"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("state=tok_s1"));
        assert!(url.contains(
            "redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Foauth%2Fcallback"
        ));
        // The secret never appears in a browser-facing URL.
        assert!(!url.contains("secret"));
    }

    #[test]
    fn envelope_decodes_grant() {
        let body = json!({
            "code": 0,
            "msg": "success",
            "data": {
                "access_token": "at",
                "refresh_token": "rt",
                "expires_in": 7200,
                "token_type": "Bearer",
                "scope": "contact:user.base:read"
            }
        });
        let envelope: Envelope<TokenGrant> = serde_json::from_value(body).unwrap();
        assert_eq!(envelope.code, 0);
        let grant = envelope.data.unwrap();
        assert_eq!(grant.expires_in, 7200);
        assert_eq!(grant.refresh_token.as_deref(), Some("rt"));
    }

    #[test]
    fn grant_tolerates_missing_refresh_token() {
        let body = json!({"access_token": "at", "expires_in": 3600});
        let grant: TokenGrant = serde_json::from_value(body).unwrap();
        assert!(grant.refresh_token.is_none());
    }
}
