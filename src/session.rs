//! Session registry: bounded LRU mapping of session id → bound user.
//!
//! Sessions are created on first event-stream open and bound to a user by a
//! successful OAuth callback. The registry is LRU-bounded; overflow evicts
//! the least recently used session silently. Bindings also expire after an
//! idle TTL, enforced lazily on lookup and by a periodic prune.

use lru::LruCache;
use rand::RngCore;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How recent "recent" is for the health snapshot.
const RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Generate a fresh opaque session identifier: 128 bits of entropy, hex.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
struct SessionEntry {
    user_id: Option<String>,
    created_at: Instant,
    last_activity: Instant,
}

/// Aggregate counters surfaced on the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounters {
    pub total_sessions: usize,
    pub authenticated_sessions: usize,
    pub recent_sessions: usize,
}

/// Bounded LRU session registry with idle TTL.
pub struct SessionRegistry {
    inner: Mutex<LruCache<String, SessionEntry>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Record a session as seen, creating it if unknown.
    pub fn ensure(&self, session_id: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("session registry lock");
        match inner.get_mut(session_id) {
            Some(entry) => entry.last_activity = now,
            None => {
                inner.put(
                    session_id.to_owned(),
                    SessionEntry {
                        user_id: None,
                        created_at: now,
                        last_activity: now,
                    },
                );
            }
        }
    }

    /// Bind a session to a user id. Creates the session if unknown (the
    /// OAuth callback may land on an instance that evicted the session).
    pub fn bind(&self, session_id: &str, user_id: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("session registry lock");
        match inner.get_mut(session_id) {
            Some(entry) => {
                entry.user_id = Some(user_id.to_owned());
                entry.last_activity = now;
            }
            None => {
                inner.put(
                    session_id.to_owned(),
                    SessionEntry {
                        user_id: Some(user_id.to_owned()),
                        created_at: now,
                        last_activity: now,
                    },
                );
            }
        }
    }

    /// Resolve a session to its bound user, refreshing LRU recency and
    /// last-activity. Idle-expired sessions are dropped and resolve to None.
    pub fn user_of(&self, session_id: &str) -> Option<String> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("session registry lock");
        let expired = match inner.get_mut(session_id) {
            Some(entry) => {
                if now.duration_since(entry.last_activity) > self.ttl {
                    true
                } else {
                    entry.last_activity = now;
                    return entry.user_id.clone();
                }
            }
            None => return None,
        };
        if expired {
            inner.pop(session_id);
        }
        None
    }

    /// Remove a session outright.
    pub fn remove(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("session registry lock");
        inner.pop(session_id);
    }

    /// Drop all idle-expired sessions. Called periodically; lookups also
    /// expire lazily, so this only bounds memory, not correctness.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("session registry lock");
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.pop(id);
        }
        expired.len()
    }

    pub fn counters(&self) -> SessionCounters {
        let now = Instant::now();
        let inner = self.inner.lock().expect("session registry lock");
        let mut authenticated = 0;
        let mut recent = 0;
        for (_, entry) in inner.iter() {
            if entry.user_id.is_some() {
                authenticated += 1;
            }
            if now.duration_since(entry.last_activity) <= RECENT_WINDOW {
                recent += 1;
            }
        }
        SessionCounters {
            total_sessions: inner.len(),
            authenticated_sessions: authenticated,
            recent_sessions: recent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(capacity: usize) -> SessionRegistry {
        SessionRegistry::new(capacity, Duration::from_secs(3600))
    }

    #[test]
    fn session_ids_are_128_bit_hex() {
        let id = generate_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_session_id());
    }

    #[test]
    fn unbound_session_resolves_to_none() {
        let reg = registry(10);
        reg.ensure("s1");
        assert_eq!(reg.user_of("s1"), None);
    }

    #[test]
    fn bind_then_resolve() {
        let reg = registry(10);
        reg.ensure("s1");
        reg.bind("s1", "u-42");
        assert_eq!(reg.user_of("s1"), Some("u-42".to_owned()));
    }

    #[test]
    fn bind_creates_missing_session() {
        let reg = registry(10);
        reg.bind("ghost", "u-1");
        assert_eq!(reg.user_of("ghost"), Some("u-1".to_owned()));
    }

    #[test]
    fn remove_forgets_binding() {
        let reg = registry(10);
        reg.bind("s1", "u-1");
        reg.remove("s1");
        assert_eq!(reg.user_of("s1"), None);
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let reg = registry(2);
        reg.bind("a", "u-a");
        reg.bind("b", "u-b");
        // Touch "a" so "b" is the LRU entry.
        assert!(reg.user_of("a").is_some());
        reg.bind("c", "u-c");
        assert_eq!(reg.user_of("b"), None);
        assert_eq!(reg.user_of("a"), Some("u-a".to_owned()));
        assert_eq!(reg.user_of("c"), Some("u-c".to_owned()));
    }

    #[test]
    fn idle_sessions_expire_on_lookup() {
        let reg = SessionRegistry::new(10, Duration::from_millis(0));
        reg.bind("s1", "u-1");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(reg.user_of("s1"), None);
        assert_eq!(reg.counters().total_sessions, 0);
    }

    #[test]
    fn counters_track_bindings() {
        let reg = registry(10);
        reg.ensure("anon");
        reg.bind("auth", "u-1");
        let counters = reg.counters();
        assert_eq!(counters.total_sessions, 2);
        assert_eq!(counters.authenticated_sessions, 1);
        assert_eq!(counters.recent_sessions, 2);
    }

    #[test]
    fn prune_drops_expired_entries() {
        let reg = SessionRegistry::new(10, Duration::from_millis(0));
        reg.bind("s1", "u-1");
        reg.bind("s2", "u-2");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(reg.prune_expired(), 2);
        assert_eq!(reg.counters().total_sessions, 0);
    }

    proptest::proptest! {
        #[test]
        fn registry_stays_bounded_and_keeps_newest_binding(
            ids in proptest::collection::vec("[a-f0-9]{8}", 1..80),
            capacity in 1usize..16,
        ) {
            let reg = SessionRegistry::new(capacity, Duration::from_secs(3600));
            for id in &ids {
                reg.bind(id, "user");
            }
            proptest::prop_assert!(reg.counters().total_sessions <= capacity);
            // The most recently bound session is never the eviction victim.
            let newest = ids.last().expect("at least one id");
            proptest::prop_assert_eq!(reg.user_of(newest), Some("user".to_owned()));
        }
    }
}
