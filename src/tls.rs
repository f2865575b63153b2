//! rustls binding for the shared session cache.
//!
//! rustls asks a single [`StoresServerSessions`] for stateful resumption.
//! [`SharedSessionStore`] puts a small private memory cache in front of
//! the shared table, the way a TLS library keeps its own cache and only
//! falls back to external storage on a miss.

use std::fmt;
use std::sync::Arc;

use rustls::server::{ServerSessionMemoryCache, StoresServerSessions};
use rustls::ServerConfig;

use crate::cache::{unix_now, SessionCallbacks, SharedSessionCache};

/// Two-level session store: per-process memory cache, then shared table.
pub struct SharedSessionStore<C = SharedSessionCache> {
    shared: Arc<C>,
    local: Arc<ServerSessionMemoryCache>,
}

impl SharedSessionStore<SharedSessionCache> {
    /// Local cache sized by [`SharedSessionCache::local_cache_size`].
    pub fn new(cache: Arc<SharedSessionCache>) -> Self {
        let local_size = cache.local_cache_size();
        Self::with_local_size(cache, local_size)
    }
}

impl<C> SharedSessionStore<C> {
    pub fn with_local_size(shared: Arc<C>, local_size: usize) -> Self {
        SharedSessionStore {
            shared,
            local: ServerSessionMemoryCache::new(local_size),
        }
    }

    pub fn shared(&self) -> &Arc<C> {
        &self.shared
    }
}

/// rustls has no removal hook, so `on_session_evicted` is never driven
/// from here; `take` is the only path that frees shared entries.
impl<C> StoresServerSessions for SharedSessionStore<C>
where
    C: SessionCallbacks + fmt::Debug + Send + Sync,
{
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        let shared = self.shared.on_new_session(&key, &value, unix_now());
        let local = self.local.put(key, value);
        shared || local
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(value) = self.local.get(key) {
            return Some(value);
        }
        // The encoded value carries its own creation time, so nothing needs
        // restoring after the copy.
        let session = self.shared.on_lookup_miss(key)?;
        self.local.put(key.to_vec(), session.payload.clone());
        Some(session.payload)
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        // The shared table decides: a ticket another process already
        // consumed must not be served from our local copy.
        self.local.take(key);
        self.shared.on_session_taken(key).map(|s| s.payload)
    }

    fn can_cache(&self) -> bool {
        true
    }
}

impl<C: fmt::Debug> fmt::Debug for SharedSessionStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSessionStore")
            .field("shared", &self.shared)
            .field("local", &self.local)
            .finish()
    }
}

/// Route `config`'s stateful session storage through `cache`.
pub fn install(config: &mut ServerConfig, cache: Arc<SharedSessionCache>) {
    config.session_storage = Arc::new(SharedSessionStore::new(cache));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::CachedSession;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory stand-in for the shared table.
    #[derive(Debug, Default)]
    struct FakeShared {
        entries: Mutex<HashMap<Vec<u8>, CachedSession>>,
        lookups: Mutex<usize>,
    }

    impl SessionCallbacks for FakeShared {
        fn on_new_session(&self, key: &[u8], payload: &[u8], created_at: i64) -> bool {
            self.entries.lock().insert(
                key.to_vec(),
                CachedSession {
                    payload: payload.to_vec(),
                    created_at,
                },
            );
            true
        }

        fn on_lookup_miss(&self, key: &[u8]) -> Option<CachedSession> {
            *self.lookups.lock() += 1;
            self.entries.lock().get(key).cloned()
        }

        fn on_session_evicted(&self, key: &[u8]) {
            self.entries.lock().remove(key);
        }

        fn on_session_taken(&self, key: &[u8]) -> Option<CachedSession> {
            self.entries.lock().remove(key)
        }
    }

    #[test]
    fn put_reaches_both_levels() {
        let shared = Arc::new(FakeShared::default());
        let store = SharedSessionStore::with_local_size(Arc::clone(&shared), 4);

        assert!(store.put(b"id".to_vec(), b"session".to_vec()));
        assert_eq!(store.get(b"id"), Some(b"session".to_vec()));
        // Served locally.
        assert_eq!(*shared.lookups.lock(), 0);
        assert!(shared.entries.lock().contains_key(b"id".as_slice()));
    }

    #[test]
    fn local_miss_falls_back_to_shared() {
        let shared = Arc::new(FakeShared::default());
        shared.on_new_session(b"peer", b"from another worker", 1);
        let store = SharedSessionStore::with_local_size(Arc::clone(&shared), 4);

        assert_eq!(store.get(b"peer"), Some(b"from another worker".to_vec()));
        assert_eq!(*shared.lookups.lock(), 1);

        // Refilled locally on the hit.
        assert_eq!(store.get(b"peer"), Some(b"from another worker".to_vec()));
        assert_eq!(*shared.lookups.lock(), 1);
    }

    #[test]
    fn take_is_decided_by_shared_table() {
        let shared = Arc::new(FakeShared::default());
        let store = SharedSessionStore::with_local_size(Arc::clone(&shared), 4);
        store.put(b"ticket".to_vec(), b"once".to_vec());

        // Another process consumed it.
        shared.on_session_taken(b"ticket");

        assert_eq!(store.take(b"ticket"), None);
        assert_eq!(store.get(b"ticket"), None);
    }

    #[test]
    fn take_consumes_once() {
        let shared = Arc::new(FakeShared::default());
        let store = SharedSessionStore::with_local_size(Arc::clone(&shared), 4);
        store.put(b"ticket".to_vec(), b"once".to_vec());

        assert_eq!(store.take(b"ticket"), Some(b"once".to_vec()));
        assert_eq!(store.take(b"ticket"), None);
    }

    #[test]
    fn can_cache() {
        let store = SharedSessionStore::with_local_size(Arc::new(FakeShared::default()), 1);
        assert!(store.can_cache());
    }
}
