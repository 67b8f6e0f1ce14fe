//! Remote backend contract.
//!
//! The engine talks to the remote only through [`RemoteTransport`]. The HTTP
//! implementation lives in [`http`]; [`memory`] is an in-process backend used
//! by tests and local development.

use std::time::Duration;

use guardian_core::IdentityKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod http;
pub mod memory;

pub use http::HttpTransport;
pub use memory::InMemoryRemote;

/// Transport-level failure talking to the remote.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The remote does not know the child a history record was pushed for.
    #[error("child {0} not found on remote")]
    ParentNotFound(IdentityKey),

    /// The remote refused one specific record.
    #[error("rejected by remote: {0}")]
    Rejected(String),

    #[error("failed to parse remote response: {0}")]
    Parse(String),

    #[error("invalid remote endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TransportError {
    /// Whether the failure is expected to clear by itself (offline, slow,
    /// overloaded). Anything else needs the payload or the remote to change.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout(_) => true,
            TransportError::Api { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

/// Response of the bulk user push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncUsersResponse {
    pub success: bool,
    /// Users newly inserted; existing keys are skipped by the remote.
    #[serde(default)]
    pub inserted: u64,
}

/// A record the remote refused during a bulk push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedEntity {
    pub key: String,
    pub error: String,
}

/// Response of the bulk child upsert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncChildrenResponse {
    pub success: bool,
    #[serde(default)]
    pub upserted: Vec<String>,
    #[serde(default)]
    pub failed: Vec<RejectedEntity>,
}

impl SyncChildrenResponse {
    /// Whether the child with `key` was accepted.
    ///
    /// A response that lists neither upserts nor failures counts as accepting
    /// everything when `success` is set.
    pub fn accepted(&self, key: &IdentityKey) -> Result<(), TransportError> {
        if let Some(rejected) = self.failed.iter().find(|f| f.key == key.as_str()) {
            return Err(TransportError::Rejected(rejected.error.clone()));
        }
        if self.upserted.iter().any(|k| k == key.as_str()) {
            return Ok(());
        }
        if self.success && self.upserted.is_empty() {
            return Ok(());
        }
        Err(TransportError::Rejected(format!(
            "child {key} missing from upsert response"
        )))
    }
}

/// Result of a remote child delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The remote had no such child; treated as success.
    AlreadyAbsent,
}

/// Operations the remote backend exposes.
///
/// Implementations must be idempotent for repeated pushes of the same
/// identity key.
#[async_trait::async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Cheap reachability check.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Bulk insert users; users whose key already exists remotely are skipped.
    async fn sync_users(&self, users: &[Value]) -> Result<SyncUsersResponse, TransportError>;

    /// Bulk upsert children keyed by identity key.
    async fn sync_children(&self, children: &[Value]) -> Result<SyncChildrenResponse, TransportError>;

    async fn fetch_users(&self) -> Result<Vec<Value>, TransportError>;

    async fn fetch_children(&self) -> Result<Vec<Value>, TransportError>;

    /// Fetch one child, `None` when the remote does not know it.
    async fn fetch_child(&self, key: &IdentityKey) -> Result<Option<Value>, TransportError>;

    /// Append one history record to a child. Returns the child's resulting
    /// history. Fails with [`TransportError::ParentNotFound`] when the
    /// child does not exist remotely.
    async fn add_record(&self, child: &IdentityKey, record: &Value) -> Result<Vec<Value>, TransportError>;

    async fn delete_child(&self, key: &IdentityKey) -> Result<DeleteOutcome, TransportError>;
}
