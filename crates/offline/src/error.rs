//! Error types for the offline sync layer.

use guardian_core::{CodecError, EntityKind, IdentityKey};
use thiserror::Error;

use crate::transport::TransportError;

/// Local cache failure.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt cache record {kind}/{key}: {reason}")]
    Corrupt {
        kind: String,
        key: String,
        reason: String,
    },

    #[error("cache directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sync engine error.
///
/// Transport failures during a sync pass are recorded in the report and
/// retried; they only surface as errors from operations that need the
/// remote directly (such as a snapshot refresh).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("child {0} is not known locally or remotely")]
    UnknownChild(IdentityKey),

    #[error("child {0} has been deleted")]
    ChildDeleted(IdentityKey),

    #[error("history record {0} already exists with different content")]
    ImmutableRecord(IdentityKey),

    /// The remote only inserts users; it never applies changes to one it has.
    #[error("user {0} is already on the remote, which does not accept user updates")]
    UserAlreadySynced(IdentityKey),

    #[error("{kind} {key} has been deleted locally")]
    Tombstoned { kind: EntityKind, key: IdentityKey },

    #[error("{count} pending {kind} writes must be pushed first")]
    PendingWrites { kind: EntityKind, count: u64 },

    #[error("gave up writing {kind} {key} after repeated concurrent updates")]
    Contention { kind: EntityKind, key: IdentityKey },
}

impl SyncError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transport(e) => e.is_transient(),
            SyncError::Cache(CacheError::Storage(_)) => true,
            SyncError::Contention { .. } | SyncError::PendingWrites { .. } => true,
            _ => false,
        }
    }
}
