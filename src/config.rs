//! Configuration for a shared session cache context.

use std::ffi::CString;

use crate::error::{Result, ShctxError};

/// Longest accepted context id.
pub const CONTEXT_ID_MAX_LEN: usize = 7;

/// Default namespace in the shared object name.
pub const DEFAULT_NAMESPACE: &str = "tls";

/// Default permission bits for a newly created object.
pub const DEFAULT_MODE: u32 = 0o600;

/// Default number of slots.
pub const DEFAULT_CAPACITY: u32 = 20_000;

/// Longest name the object may get, leading slash included.
const OBJECT_NAME_MAX_LEN: usize = 255;

/// Configuration for creating or attaching to a shared session cache.
///
/// The dispatcher uses every field; workers only need `namespace` and
/// `context_id`, since the capacity is derived from the existing object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Prefix of the object name, so unrelated programs do not collide.
    pub namespace: String,

    /// Short id telling contexts of one program apart (at most 7 chars).
    pub context_id: String,

    /// Permission bits for the object at creation.
    pub mode: u32,

    /// Number of pre-allocated session slots.
    pub capacity: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            context_id: "default".to_string(),
            mode: DEFAULT_MODE,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Create a configuration for `context_id` with default values.
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Name of the shared object: `/<namespace>-shsess-<context_id>`.
    pub fn object_name(&self) -> Result<CString> {
        if self.context_id.is_empty() || self.context_id.len() > CONTEXT_ID_MAX_LEN {
            return Err(ShctxError::BadArgs(format!(
                "context id must be 1 to {CONTEXT_ID_MAX_LEN} bytes, got {:?}",
                self.context_id
            )));
        }
        check_component("context id", &self.context_id)?;
        if self.namespace.is_empty() {
            return Err(ShctxError::BadArgs("namespace must not be empty".into()));
        }
        check_component("namespace", &self.namespace)?;

        let name = format!("/{}-shsess-{}", self.namespace, self.context_id);
        if name.len() > OBJECT_NAME_MAX_LEN {
            return Err(ShctxError::BadArgs(format!(
                "object name {name:?} is longer than {OBJECT_NAME_MAX_LEN} bytes"
            )));
        }
        CString::new(name).map_err(|e| ShctxError::BadArgs(e.to_string()))
    }
}

fn check_component(what: &str, value: &str) -> Result<()> {
    if value.contains(['/', '\0']) {
        return Err(ShctxError::BadArgs(format!(
            "{what} {value:?} must not contain '/' or NUL"
        )));
    }
    Ok(())
}
