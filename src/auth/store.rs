//! Per-user credential persistence with an in-memory TTL cache.
//!
//! Credentials live at `{data_dir}/user-{user_id}/tokens.json`. The directory
//! is also handed to the user's worker process as its token directory. Writes
//! are atomic (write-then-rename) and serialized per user; reads go through a
//! cache so the hot path stays off the disk.

use crate::auth::sealed::SealKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const TOKENS_FILE: &str = "tokens.json";

/// A user's credential record. `expires_at` is always an absolute instant;
/// relative `expires_in` values are normalized before they get here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    /// Time remaining until the access token expires. Negative when already
    /// expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }
}

struct CachedCredentials {
    credentials: Credentials,
    cached_at: Instant,
}

/// On-disk credential store rooted at the gateway data directory.
pub struct TokenStore {
    data_dir: PathBuf,
    seal: SealKey,
    cache_ttl: Duration,
    cache: DashMap<String, CachedCredentials>,
    write_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// User ids come from the identity provider and end up in filesystem paths;
/// anything outside this alphabet is refused outright.
pub fn valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id.len() <= 128
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl TokenStore {
    pub fn new(data_dir: PathBuf, seal: SealKey, cache_ttl: Duration) -> Self {
        Self {
            data_dir,
            seal,
            cache_ttl,
            cache: DashMap::new(),
            write_locks: DashMap::new(),
        }
    }

    /// Token directory for a user's worker.
    pub fn user_dir(&self, user_id: &str) -> PathBuf {
        self.data_dir.join(format!("user-{user_id}"))
    }

    /// Token directory for the default worker.
    pub fn default_dir(&self) -> PathBuf {
        self.data_dir.join("default")
    }

    /// Load credentials for a user. Returns None for missing or unreadable
    /// records; a corrupt file never takes the gateway down.
    pub async fn load(&self, user_id: &str) -> Option<Credentials> {
        if !valid_user_id(user_id) {
            warn!(user_id, "refusing to load credentials for malformed user id");
            return None;
        }

        if let Some(entry) = self.cache.get(user_id) {
            if entry.cached_at.elapsed() < self.cache_ttl {
                return Some(entry.credentials.clone());
            }
            drop(entry);
            self.cache.remove(user_id);
        }

        let path = self.user_dir(user_id).join(TOKENS_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(user_id, "no credentials on disk");
                return None;
            }
            Err(e) => {
                warn!(user_id, error = %e, "failed to read credentials file");
                return None;
            }
        };

        let mut record: Credentials = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(user_id, error = %e, "corrupt credentials file, treating as absent");
                return None;
            }
        };

        record.refresh_token = match self.seal.open(&record.refresh_token) {
            Ok(token) => token,
            Err(e) => {
                warn!(user_id, error = %e, "failed to unseal refresh token, treating as absent");
                return None;
            }
        };

        self.cache.insert(
            user_id.to_owned(),
            CachedCredentials {
                credentials: record.clone(),
                cached_at: Instant::now(),
            },
        );
        Some(record)
    }

    /// Persist credentials for a user atomically and refresh the cache.
    pub async fn save(&self, user_id: &str, credentials: &Credentials) -> anyhow::Result<()> {
        if !valid_user_id(user_id) {
            anyhow::bail!("malformed user id");
        }

        let lock = self
            .write_locks
            .entry(user_id.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let dir = self.user_dir(user_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut record = credentials.clone();
        record.refresh_token = self.seal.seal(&record.refresh_token)?;
        let body = serde_json::to_vec_pretty(&record)?;

        // Write-then-rename so a crash leaves either the old file or the new
        // one, never a torn write.
        let tmp = dir.join(format!("{TOKENS_FILE}.tmp"));
        let path = dir.join(TOKENS_FILE);
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.cache.insert(
            user_id.to_owned(),
            CachedCredentials {
                credentials: credentials.clone(),
                cached_at: Instant::now(),
            },
        );
        debug!(user_id, "credentials saved");
        Ok(())
    }

    /// Remove a user's credentials from cache and disk. A missing file is
    /// not an error.
    pub async fn clear(&self, user_id: &str) -> anyhow::Result<()> {
        if !valid_user_id(user_id) {
            anyhow::bail!("malformed user id");
        }
        self.cache.remove(user_id);
        let path = self.user_dir(user_id).join(TOKENS_FILE);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the in-memory cache entry without touching disk. Used when a
    /// refresh fails and the cached record can no longer be trusted.
    pub fn invalidate(&self, user_id: &str) {
        self.cache.remove(user_id);
    }
}
