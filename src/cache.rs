use std::ffi::CString;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::config::CacheConfig;
use crate::error::{Result, ShctxError};
use crate::key::{pad_key, PaddedKey};
use crate::shm::layout::{KEY_LEN, MAX_DATA_LEN};
use crate::shm::{region, CachedSession, SessionTable, TableStats};

/// Called with `(padded key ++ payload, creation time)` after every
/// locally cached new session. Delivery to peers is up to the callee.
pub type ReplicationHook = Arc<dyn Fn(&[u8], i64) + Send + Sync>;

/// Snapshot of table occupancy.
pub type CacheStats = TableStats;

/// The hooks a TLS library drives during handshakes.
///
/// None of them fail: a rejected store, a miss and an unknown key are
/// all ordinary outcomes.
pub trait SessionCallbacks {
    /// A new session was negotiated. Returns whether it was cached.
    fn on_new_session(&self, key: &[u8], payload: &[u8], created_at: i64) -> bool;

    /// The library's own cache has no entry for `key`.
    fn on_lookup_miss(&self, key: &[u8]) -> Option<CachedSession>;

    /// The library dropped `key` from its own view.
    fn on_session_evicted(&self, key: &[u8]);

    /// Single-use retrieval: return and drop the entry atomically.
    fn on_session_taken(&self, key: &[u8]) -> Option<CachedSession>;
}

/// How this handle came to be, which decides who may destroy the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Created the object and owns its lifetime.
    Dispatcher,
    /// Attached to an object someone else created.
    Worker,
}

/// A process-local handle onto a shared session cache.
///
/// One per attached process (or per mapping). Dropping it detaches.
pub struct SharedSessionCache {
    table: SessionTable,
    object_name: CString,
    context_id: String,
    role: Role,
    replication: RwLock<Option<ReplicationHook>>,
}

impl SharedSessionCache {
    /// Create the shared object for `config.context_id` and format it.
    ///
    /// Dispatcher only. A stale object with the same name is removed first.
    pub fn create(config: &CacheConfig) -> Result<Self> {
        let object_name = config.object_name()?;
        let table = SessionTable::create(&object_name, config.mode, config.capacity)?;
        tracing::info!(
            context_id = %config.context_id,
            object = %object_name.to_string_lossy(),
            capacity = config.capacity,
            bytes = table.mapped_size(),
            "created shared session cache"
        );
        Ok(Self::from_table(table, object_name, config, Role::Dispatcher))
    }

    /// Map an existing object. Its contents are used as they are.
    pub fn attach(config: &CacheConfig) -> Result<Self> {
        let object_name = config.object_name()?;
        let table = SessionTable::open(&object_name)?;
        tracing::info!(
            context_id = %config.context_id,
            object = %object_name.to_string_lossy(),
            capacity = table.capacity(),
            "attached to shared session cache"
        );
        Ok(Self::from_table(table, object_name, config, Role::Worker))
    }

    fn from_table(
        table: SessionTable,
        object_name: CString,
        config: &CacheConfig,
        role: Role,
    ) -> Self {
        SharedSessionCache {
            table,
            object_name,
            context_id: config.context_id.clone(),
            role,
            replication: RwLock::new(None),
        }
    }

    /// Unmap. The shared object and its sessions persist.
    pub fn detach(self) -> Result<()> {
        tracing::debug!(context_id = %self.context_id, "detached from shared session cache");
        drop(self);
        Ok(())
    }

    /// Unmap and remove the shared object. Dispatcher only.
    ///
    /// Other processes keep their existing mappings; new attaches fail.
    pub fn destroy(self) -> Result<()> {
        if self.role != Role::Dispatcher {
            return Err(ShctxError::BadArgs(format!(
                "context {} was attached, not created, by this handle",
                self.context_id
            )));
        }
        let SharedSessionCache {
            table,
            object_name,
            context_id,
            ..
        } = self;
        drop(table);
        region::unlink(&object_name)?;
        tracing::info!(
            context_id = %context_id,
            object = %object_name.to_string_lossy(),
            "destroyed shared session cache"
        );
        Ok(())
    }

    /// Register the hook invoked after every locally cached new session.
    pub fn set_replication_hook<F>(&self, hook: F)
    where
        F: Fn(&[u8], i64) + Send + Sync + 'static,
    {
        *self.replication.write() = Some(Arc::new(hook));
    }

    pub fn clear_replication_hook(&self) {
        *self.replication.write() = None;
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn capacity(&self) -> u32 {
        self.table.capacity()
    }

    /// Mapped byte size of the shared object.
    pub fn mapped_size(&self) -> usize {
        self.table.mapped_size()
    }

    /// Entries a TLS library should keep in its private in-process cache
    /// in front of this one.
    pub fn local_cache_size(&self) -> usize {
        (self.capacity() as usize >> 3) | 0x3ff
    }

    pub fn stats(&self) -> CacheStats {
        self.table.stats()
    }

    /// Cache a freshly negotiated, already encoded session.
    ///
    /// Ids longer than `KEY_LEN` and empty or oversized payloads are
    /// rejected before the lock is taken.
    pub fn on_new_session(&self, key: &[u8], payload: &[u8], created_at: i64) -> bool {
        let Some(padded) = pad_key(key) else {
            tracing::debug!(key_len = key.len(), "session id too long, not caching");
            return false;
        };
        if payload.is_empty() || payload.len() > MAX_DATA_LEN {
            tracing::debug!(
                payload_len = payload.len(),
                max = MAX_DATA_LEN,
                "session payload size out of range, not caching"
            );
            return false;
        }

        self.table.store(&padded, payload, created_at);

        // The hook may call back into this handle, so it runs unlocked.
        let hook = self.replication.read().clone();
        if let Some(hook) = hook {
            hook(&encode_for_peers(&padded, payload), created_at);
        }
        true
    }

    /// Look up a session the TLS library did not have locally. A hit
    /// refreshes its recency.
    pub fn on_lookup_miss(&self, key: &[u8]) -> Option<CachedSession> {
        let padded = pad_key(key)?;
        self.table.fetch(&padded)
    }

    /// Free the slot holding `key`, if any. Its bytes stay until reuse.
    pub fn on_session_evicted(&self, key: &[u8]) {
        if let Some(padded) = pad_key(key) {
            self.table.remove(&padded);
        }
    }

    /// Return and free the slot holding `key` in one critical section.
    pub fn take(&self, key: &[u8]) -> Option<CachedSession> {
        let padded = pad_key(key)?;
        self.table.take(&padded)
    }

    /// Store a session received from a peer's replication hook.
    ///
    /// `encoded` is the padded key followed by the payload. Out-of-range
    /// lengths are dropped silently. A zero `created_at` is stamped with
    /// the current time. Never re-triggers the replication hook.
    pub fn replicate(&self, encoded: &[u8], created_at: i64) {
        if encoded.len() <= KEY_LEN || encoded.len() > KEY_LEN + MAX_DATA_LEN {
            tracing::debug!(len = encoded.len(), "ignoring replicated session of bad length");
            return;
        }
        let (key, payload) = encoded.split_at(KEY_LEN);
        let mut padded: PaddedKey = [0; KEY_LEN];
        padded.copy_from_slice(key);

        let created_at = if created_at == 0 { unix_now() } else { created_at };
        self.table.store(&padded, payload, created_at);
    }
}

impl SessionCallbacks for SharedSessionCache {
    fn on_new_session(&self, key: &[u8], payload: &[u8], created_at: i64) -> bool {
        SharedSessionCache::on_new_session(self, key, payload, created_at)
    }

    fn on_lookup_miss(&self, key: &[u8]) -> Option<CachedSession> {
        SharedSessionCache::on_lookup_miss(self, key)
    }

    fn on_session_evicted(&self, key: &[u8]) {
        SharedSessionCache::on_session_evicted(self, key)
    }

    fn on_session_taken(&self, key: &[u8]) -> Option<CachedSession> {
        self.take(key)
    }
}

impl fmt::Debug for SharedSessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSessionCache")
            .field("context_id", &self.context_id)
            .field("object_name", &self.object_name)
            .field("role", &self.role)
            .field("capacity", &self.capacity())
            .field("replication", &self.replication.read().is_some())
            .finish()
    }
}

fn encode_for_peers(key: &PaddedKey, payload: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(KEY_LEN + payload.len());
    encoded.extend_from_slice(key);
    encoded.extend_from_slice(payload);
    encoded
}

/// Current wall-clock time in unix seconds.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
