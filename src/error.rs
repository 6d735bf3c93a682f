// ABOUTME: Error taxonomy for the sync engine
// ABOUTME: Distinguishes lock timeouts and version mismatches from storage failures

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Which lock an acquisition timed out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockKind::Read => "read",
            LockKind::Write => "write",
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// A read or write lock could not be acquired within the caller's
    /// timeout. Nested lock acquisition from inside a held transaction
    /// surfaces as this rather than deadlocking.
    #[error("timed out acquiring {} lock after {timeout:?}", kind.as_str())]
    LockTimeout { kind: LockKind, timeout: Duration },

    /// The on-disk schema was written by a newer library version. Fatal:
    /// proceeding could corrupt state the newer version relies on.
    #[error("database schema version {found} is newer than supported version {supported}")]
    VersionMismatch { found: i32, supported: i32 },

    #[error("database is closed")]
    Closed,

    /// A registered operation handler failed while publishing a
    /// checkpoint. The surrounding transaction rolls back, leaving the
    /// batch re-appliable.
    #[error("operation handler {name} failed")]
    Handler {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// True for conditions that cannot be resolved by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::VersionMismatch { .. } | SyncError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_message_names_the_lock() {
        let err = SyncError::LockTimeout {
            kind: LockKind::Write,
            timeout: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("write lock"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let err = SyncError::VersionMismatch {
            found: 9,
            supported: 1,
        };
        assert!(err.is_fatal());
    }
}
