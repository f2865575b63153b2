/// Shared-memory session table.
///
/// Provides `SessionTable`, a fixed-capacity cross-process session store
/// backed by one named POSIX shared-memory object. The object holds the
/// lock line, a small header, and a pre-allocated array of slots. Each
/// slot carries its list links and trie node, so indexing never
/// allocates.
///
/// Every operation takes the segment lock once, performs pointer-sized
/// list/trie surgery plus at most one fixed-size payload copy, and
/// releases it. Encoding and decoding of payloads happens in the caller,
/// outside the lock.
pub mod arena;
pub mod layout;
pub mod lock;
pub mod recency;
pub mod region;
pub mod trie;

use std::ffi::CStr;

use arena::Arena;
use layout::{ACTIVE_HEAD, FREE_HEAD, MAX_DATA_LEN};
use lock::{ShmLock, ShmLockGuard};
use region::ShmRegion;

use crate::error::Result;
use crate::key::PaddedKey;

/// A session copied out of the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedSession {
    /// Encoded session, exactly as it was stored.
    pub payload: Vec<u8>,
    /// Creation time recorded with the payload (unix seconds).
    pub created_at: i64,
}

/// Occupancy of the two recency lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableStats {
    pub capacity: u32,
    pub active: u32,
    pub free: u32,
}

/// The process-local handle onto a mapped session table.
///
/// Several handles, in one process or many, may map the same object;
/// they coordinate only through the lock inside the segment.
pub struct SessionTable {
    region: ShmRegion,
    lock: ShmLock,
}

impl SessionTable {
    /// Create and format a new table, replacing any stale object.
    pub fn create(name: &CStr, mode: u32, capacity: u32) -> Result<Self> {
        let mapped = ShmRegion::create(name, mode, capacity)?;
        let shm_lock = match unsafe { lock::init(mapped.base_ptr()) } {
            Ok(l) => l,
            Err(e) => {
                drop(mapped);
                let _ = region::unlink(name);
                return Err(e);
            }
        };

        // Nobody else can see the object yet; format without the lock.
        unsafe { Arena::from_raw(mapped.base_ptr(), capacity) }.format();

        Ok(SessionTable {
            region: mapped,
            lock: shm_lock,
        })
    }

    /// Map an existing table without reinitializing anything.
    pub fn open(name: &CStr) -> Result<Self> {
        let mapped = ShmRegion::open(name)?;
        let shm_lock = unsafe { lock::from_existing(mapped.base_ptr()) };
        Ok(SessionTable {
            region: mapped,
            lock: shm_lock,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.region.capacity()
    }

    /// Mapped byte size of the object.
    pub fn mapped_size(&self) -> usize {
        layout::region_size(self.capacity())
    }

    /// Slots and roots, valid while `_guard` is held.
    fn arena<'g>(&self, _guard: &'g ShmLockGuard<'_>) -> Arena<'g> {
        unsafe { Arena::from_raw(self.region.base_ptr(), self.capacity()) }
    }

    /// Store `payload` under `key`, reusing a free slot or the LRU one.
    ///
    /// The caller has already checked `payload.len() <= MAX_DATA_LEN`.
    pub fn store(&self, key: &PaddedKey, payload: &[u8], created_at: i64) {
        debug_assert!(payload.len() <= MAX_DATA_LEN);

        let guard = self.lock.lock();
        let mut arena = self.arena(&guard);
        store_locked(&mut arena, key, payload, created_at);
    }

    /// Copy out the session under `key` and mark it most recently used.
    pub fn fetch(&self, key: &PaddedKey) -> Option<CachedSession> {
        let copied = {
            let guard = self.lock.lock();
            fetch_locked(&mut self.arena(&guard), key)
        };
        copied.map(SlotCopy::into_session)
    }

    /// Drop the session under `key`. Returns whether one was present.
    ///
    /// The slot's bytes are left in place until it is reused.
    pub fn remove(&self, key: &PaddedKey) -> bool {
        let guard = self.lock.lock();
        let mut arena = self.arena(&guard);
        match trie::lookup(&mut arena, key) {
            Some(index) => {
                recency::set_free(&mut arena, index);
                true
            }
            None => false,
        }
    }

    /// Copy out and drop the session under `key` in one critical section.
    pub fn take(&self, key: &PaddedKey) -> Option<CachedSession> {
        let copied = {
            let guard = self.lock.lock();
            let mut arena = self.arena(&guard);
            let index = trie::lookup(&mut arena, key)?;
            let copied = copy_out(&mut arena, index);
            recency::set_free(&mut arena, index);
            copied
        };
        Some(copied.into_session())
    }

    /// Count both lists under the lock.
    pub fn stats(&self) -> TableStats {
        let guard = self.lock.lock();
        let mut arena = self.arena(&guard);
        TableStats {
            capacity: arena.capacity(),
            active: recency::len(&mut arena, ACTIVE_HEAD),
            free: recency::len(&mut arena, FREE_HEAD),
        }
    }
}

fn store_locked(arena: &mut Arena, key: &PaddedKey, payload: &[u8], created_at: i64) {
    let Some(index) = recency::next_acquirable(arena) else {
        return;
    };
    trie::delete(arena, index);
    arena.slot(index).key = *key;

    let owner = trie::insert(arena, index);
    if owner != index {
        // Someone stored this key first; refresh their slot and hand the
        // one we acquired back to the free list.
        recency::set_free(arena, index);
    }

    let slot = arena.slot(owner);
    slot.data[..payload.len()].copy_from_slice(payload);
    slot.data_len = payload.len() as u32;
    slot.created_at = created_at;
    recency::set_active(arena, owner);
}

/// Fixed-size copy of a slot's payload, taken under the lock. The heap
/// allocation happens in [`SlotCopy::into_session`] after release.
struct SlotCopy {
    data: [u8; MAX_DATA_LEN],
    len: usize,
    created_at: i64,
}

impl SlotCopy {
    fn into_session(self) -> CachedSession {
        CachedSession {
            payload: self.data[..self.len].to_vec(),
            created_at: self.created_at,
        }
    }
}

fn fetch_locked(arena: &mut Arena, key: &PaddedKey) -> Option<SlotCopy> {
    let index = trie::lookup(arena, key)?;
    let copied = copy_out(arena, index);
    recency::set_active(arena, index);
    Some(copied)
}

fn copy_out(arena: &mut Arena, index: u32) -> SlotCopy {
    let slot = arena.slot(index);
    SlotCopy {
        data: slot.data,
        len: (slot.data_len as usize).min(MAX_DATA_LEN),
        created_at: slot.created_at,
    }
}

// All shared mutations go through the segment lock.
unsafe impl Send for SessionTable {}
unsafe impl Sync for SessionTable {}
