//! Error types for the shared session cache lifecycle.

use std::io;

use thiserror::Error;

/// Errors returned by lifecycle calls (create, attach, detach, destroy).
///
/// Steady-state operations never fail with an error: a rejected store
/// or a lookup miss is a normal outcome reported through `bool`/`Option`.
#[derive(Debug, Error)]
pub enum ShctxError {
    /// A system call on the shared-memory object failed.
    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A library call returned a non-zero status code.
    #[error("{call} failed with code {code}")]
    LibCall { call: &'static str, code: i32 },

    /// The caller passed an unusable argument or the segment is incompatible.
    #[error("invalid argument: {0}")]
    BadArgs(String),
}

impl ShctxError {
    /// Wrap the calling thread's last OS error.
    pub(crate) fn last_os(op: &'static str) -> Self {
        ShctxError::Syscall {
            op,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        ShctxError::Syscall { op, source }
    }

    /// The status code this error maps to.
    pub fn status(&self) -> Status {
        match self {
            ShctxError::Syscall { .. } => Status::BadSyscall,
            ShctxError::LibCall { .. } => Status::BadLibCall,
            ShctxError::BadArgs(_) => Status::BadArgs,
        }
    }
}

/// Result type for lifecycle operations.
pub type Result<T, E = ShctxError> = std::result::Result<T, E>;

/// Flat status of a lifecycle call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadSyscall,
    BadLibCall,
    BadArgs,
}

impl Status {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}
