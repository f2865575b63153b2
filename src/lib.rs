//! Cross-process TLS session cache in POSIX shared memory.
//!
//! A dispatcher process creates a named shared-memory object holding a
//! fixed number of session slots; worker processes attach to it and feed
//! it from their TLS library's session-cache hooks, so a session
//! negotiated by one worker can be resumed by any other.

#[cfg(not(unix))]
compile_error!("shared_session_cache needs POSIX shared memory");

mod cache;
mod config;
mod error;
mod key;
mod shm;
pub mod tls;

pub use cache::{CacheStats, ReplicationHook, Role, SessionCallbacks, SharedSessionCache};
pub use config::{CacheConfig, CONTEXT_ID_MAX_LEN, DEFAULT_CAPACITY, DEFAULT_MODE, DEFAULT_NAMESPACE};
pub use error::{Result, ShctxError, Status};
pub use key::{pad_key, PaddedKey};
pub use shm::layout::{HEADER_SIZE, KEY_LEN, MAX_CAPACITY, MAX_DATA_LEN, SLOT_SIZE};
pub use shm::CachedSession;
