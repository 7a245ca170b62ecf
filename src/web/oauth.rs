//! Authorization endpoints: redirect to the identity provider and handle
//! the callback.
//!
//! The callback renders short HTML pages. Failures describe the error
//! category only; tokens, codes, and internal state never reach the page.

use crate::auth::broker::AuthError;
use crate::state::AppState;
use crate::web::error::ApiError;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use serde::Deserialize;
use tracing::{error, info, warn};

#[derive(Deserialize)]
pub struct StartParams {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// `GET /oauth/start?sessionId=` — bounce the browser to the identity
/// provider's authorization page.
pub async fn oauth_start(
    State(state): State<AppState>,
    Query(params): Query<StartParams>,
) -> Result<Redirect, ApiError> {
    let session_id = params
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("sessionId query parameter is required"))?;

    state.sessions.ensure(&session_id);
    let url = state.broker.authorize_url(&session_id);
    Ok(Redirect::temporary(&url))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// `GET /oauth/callback` — complete the authorization-code exchange and
/// bind the session to the resulting user.
pub async fn oauth_callback(
    State(app): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(idp_error) = params.error {
        warn!(error = %idp_error, "authorization denied at identity provider");
        return error_page(
            StatusCode::BAD_REQUEST,
            "The identity provider reported an error. Please try signing in again.",
        );
    }

    let (Some(code), Some(state_param)) = (params.code, params.state) else {
        return error_page(
            StatusCode::BAD_REQUEST,
            "Missing code or state parameter in the callback.",
        );
    };

    match app.broker.handle_callback(&code, &state_param).await {
        Ok((session_id, user_id)) => {
            app.sessions.bind(&session_id, &user_id);
            info!(session_id, user_id, "session bound to authenticated user");
            success_page()
        }
        Err(AuthError::InvalidState) => error_page(
            StatusCode::BAD_REQUEST,
            "Authorization failed: invalid or expired state. Please restart the sign-in flow.",
        ),
        Err(AuthError::Idp(e)) => {
            error!(error = %e, "identity provider exchange failed");
            error_page(
                StatusCode::BAD_GATEWAY,
                "Authorization failed while talking to the identity provider. Please try again.",
            )
        }
        Err(e) => {
            error!(error = %e, "authorization could not be completed");
            error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Authorization could not be completed. Please try again.",
            )
        }
    }
}

fn success_page() -> Response {
    Html(page(
        "Authorization successful",
        "Authorization successful. You can close this window and return to your client.",
    ))
    .into_response()
}

fn error_page(status: StatusCode, message: &str) -> Response {
    (status, Html(page("Authorization failed", message))).into_response()
}

fn page(title: &str, message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
         <body style=\"font-family: sans-serif; max-width: 32rem; margin: 4rem auto;\">\n\
         <h1>{title}</h1>\n<p>{message}</p>\n</body>\n</html>\n"
    )
}
