//! OAuth broker: pending authorization state, code exchange, and token
//! refresh.
//!
//! The `state` parameter sent to the identity provider is
//! `{state_token}_{session_id}`, so the session can be recovered from the
//! callback alone even if the in-memory pending map was lost. The pending
//! entry itself is single-use: a successful match consumes it.

use crate::auth::store::{Credentials, TokenStore};
use crate::idp::{IdpClient, IdpError};
use chrono::Utc;
use dashmap::DashMap;
use rand::RngCore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pending authorizations expire after this window.
const STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Access tokens within this margin of expiry are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 5 * 60;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The callback state did not match a pending authorization.
    #[error("invalid or expired authorization state")]
    InvalidState,
    /// No stored credentials for the user.
    #[error("no credentials for user")]
    NoCredentials,
    #[error(transparent)]
    Idp(#[from] IdpError),
    /// Disk-level failure persisting credentials.
    #[error("credential storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}

struct PendingAuth {
    session_id: String,
    created_at: Instant,
}

/// Orchestrates the authorization-code flow and keeps access tokens fresh.
pub struct OauthBroker {
    idp: Arc<IdpClient>,
    store: Arc<TokenStore>,
    pending: DashMap<String, PendingAuth>,
}

impl OauthBroker {
    pub fn new(idp: Arc<IdpClient>, store: Arc<TokenStore>) -> Self {
        Self {
            idp,
            store,
            pending: DashMap::new(),
        }
    }

    /// Build the authorization URL for a session and remember the pending
    /// state token.
    pub fn authorize_url(&self, session_id: &str) -> String {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let state_token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

        self.pending.insert(
            state_token.clone(),
            PendingAuth {
                session_id: session_id.to_owned(),
                created_at: Instant::now(),
            },
        );

        let state = format!("{state_token}_{session_id}");
        self.idp.authorize_url(&state)
    }

    /// Complete the callback: validate and consume the state, exchange the
    /// code, resolve the identity, and persist credentials.
    ///
    /// Returns the session id recovered from the state and the stable user
    /// id issued by the provider.
    pub async fn handle_callback(
        &self,
        code: &str,
        state: &str,
    ) -> Result<(String, String), AuthError> {
        // Session ids may not contain underscores, state tokens are hex;
        // the last underscore is therefore an unambiguous separator.
        let (state_token, session_id) = state.rsplit_once('_').ok_or(AuthError::InvalidState)?;

        // Consume-on-match keeps the token single-use without destroying a
        // legitimate pending entry when the session id does not line up.
        let (_, entry) = self
            .pending
            .remove_if(state_token, |_, entry| entry.session_id == session_id)
            .ok_or(AuthError::InvalidState)?;
        if entry.created_at.elapsed() > STATE_TTL {
            debug!(session_id, "authorization state expired before callback");
            return Err(AuthError::InvalidState);
        }

        let grant = self.idp.exchange_code(code).await?;
        let identity = self.idp.user_info(&grant.access_token).await?;
        let user_id = identity.union_id;

        let credentials = Credentials {
            user_id: user_id.clone(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.unwrap_or_default(),
            expires_at: Utc::now() + chrono::Duration::seconds(grant.expires_in),
        };
        self.store.save(&user_id, &credentials).await?;

        info!(session_id, user_id, "authorization completed");
        Ok((session_id.to_owned(), user_id))
    }

    /// Load credentials for a user, refreshing when the access token is
    /// within the refresh margin. Returns None when the user has no usable
    /// credentials; callers then route to the default worker.
    pub async fn ensure_valid(&self, user_id: &str) -> Option<Credentials> {
        let credentials = self.store.load(user_id).await?;
        if credentials.remaining(Utc::now()).num_seconds() > REFRESH_MARGIN_SECS {
            return Some(credentials);
        }

        match self.refresh(user_id).await {
            Ok(refreshed) => Some(refreshed),
            Err(e) => {
                warn!(user_id, error = %e, "token refresh failed, dropping cached credentials");
                self.store.invalidate(user_id);
                None
            }
        }
    }

    /// Refresh a user's grant and persist the result. The previous refresh
    /// token is kept when the provider omits a new one.
    pub async fn refresh(&self, user_id: &str) -> Result<Credentials, AuthError> {
        let current = self
            .store
            .load(user_id)
            .await
            .ok_or(AuthError::NoCredentials)?;
        let grant = self.idp.refresh(&current.refresh_token).await?;

        let credentials = Credentials {
            user_id: user_id.to_owned(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.unwrap_or(current.refresh_token),
            expires_at: Utc::now() + chrono::Duration::seconds(grant.expires_in),
        };
        self.store.save(user_id, &credentials).await?;
        debug!(user_id, "access token refreshed");
        Ok(credentials)
    }

    /// Evict pending authorizations past their window. Runs on the periodic
    /// sweep cadence.
    pub fn sweep_pending(&self) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, entry| entry.created_at.elapsed() < STATE_TTL);
        before - self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
