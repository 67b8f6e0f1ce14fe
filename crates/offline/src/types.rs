//! Shared types for the cache, the engine and their callers.

use chrono::{DateTime, Utc};
use guardian_core::{EntityKind, IdentityKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sync state of one cached record.
///
/// `Dirty --push ok--> Synced`, `Synced --local write--> Dirty`,
/// `Dirty --push failure--> Dirty`. `Tombstone` marks a delete that the
/// remote has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Dirty,
    Synced,
    Tombstone,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Dirty => "dirty",
            SyncState::Synced => "synced",
            SyncState::Tombstone => "tombstone",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "dirty" => Some(SyncState::Dirty),
            "synced" => Some(SyncState::Synced),
            "tombstone" => Some(SyncState::Tombstone),
            _ => None,
        }
    }

    /// Whether the record still needs a push.
    pub fn is_pending(&self) -> bool {
        !matches!(self, SyncState::Synced)
    }
}

/// A cached entity wrapped with its sync state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub kind: EntityKind,
    pub key: IdentityKey,
    pub payload: Value,
    pub state: SyncState,
    /// Owning child for history records.
    pub owner: Option<IdentityKey>,
    /// Bumped by the cache on every write; used for compare-and-swap.
    pub revision: u64,
    /// Time of the last local persist.
    pub updated_at: DateTime<Utc>,
}

impl CacheRecord {
    pub fn new(kind: EntityKind, key: IdentityKey, payload: Value, state: SyncState) -> Self {
        Self {
            kind,
            key,
            payload,
            state,
            owner: None,
            revision: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_owner(mut self, owner: IdentityKey) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Same record with another state; revision and owner carry over.
    pub fn with_state(&self, state: SyncState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Same record with another payload; state, revision and owner carry over.
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state == SyncState::Dirty
    }

    pub fn is_tombstone(&self) -> bool {
        self.state == SyncState::Tombstone
    }
}

/// Optimistic concurrency expectation for a cache write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// Skip revision checking.
    Any,
    /// Require that no record exists under the key.
    Absent,
    /// Require the record to be at an exact revision.
    Exact(u64),
}

impl ExpectedRevision {
    /// Expectation matching what was just read.
    pub fn of(current: Option<&CacheRecord>) -> Self {
        match current {
            Some(record) => ExpectedRevision::Exact(record.revision),
            None => ExpectedRevision::Absent,
        }
    }
}

/// One record that could not be pushed in a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFailure {
    pub kind: EntityKind,
    pub key: IdentityKey,
    pub error: String,
    /// Transient failures are expected to clear on a later pass.
    pub transient: bool,
}

/// Outcome of one push+pull pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Records accepted by the remote and now `Synced`.
    pub pushed: Vec<(EntityKind, IdentityKey)>,
    /// Records left pending for the next pass.
    pub failed: Vec<PushFailure>,
    /// Parents pushed as part of a missing-parent repair.
    pub repaired_parents: Vec<IdentityKey>,
    /// Children purged after a confirmed remote delete.
    pub purged: Vec<IdentityKey>,
    /// Remote records inserted or overwritten locally.
    pub pulled: usize,
    /// Remote records merged into a pending local edit.
    pub merged: usize,
    /// Failures not tied to one pushed record: unreadable pending lists,
    /// snapshot fetches, reconcile errors.
    pub errors: Vec<String>,
    /// A snapshot fetch failed with a transient transport error.
    pub remote_unreachable: bool,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.errors.is_empty()
    }

    pub fn summary(&self) -> SyncSummary {
        SyncSummary {
            pushed: self.pushed.len(),
            failed: self.failed.len(),
            purged: self.purged.len(),
            pulled: self.pulled,
            merged: self.merged,
            finished_at: Utc::now(),
        }
    }
}

/// Counts from the last completed pass, for status display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub pushed: usize,
    pub failed: usize,
    pub purged: usize,
    pub pulled: usize,
    pub merged: usize,
    pub finished_at: DateTime<Utc>,
}

/// Passive sync status for the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Completed(SyncSummary),
    /// The last pass could not reach the remote; local writes stay queued.
    Offline,
    /// Local writes are failing to persist; distinct from "queued offline".
    StorageFailing { consecutive: u32 },
}

/// What `request_sync` did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncTrigger {
    /// A pass ran to completion; holds the report of the final pass.
    Ran(SyncReport),
    /// A pass was already in flight; one more pass will follow it.
    Coalesced,
}
