//! Offline-first sync engine.
//!
//! Local writes are staged into the [`LocalCache`] as `Dirty` and acknowledged
//! as soon as they are durable. A sync pass then:
//!
//! 1. pushes pending records in dependency order (users, child upserts, child
//!    deletes, history appends), each record in its own request so one
//!    failure never blocks its siblings;
//! 2. pulls full snapshots and reconciles them: unknown records are inserted,
//!    `Synced` copies are overwritten, `Dirty` copies are merged and stay
//!    `Dirty`, tombstones are left alone.
//!
//! Every read-modify-write against the cache is a compare-and-swap on the
//! record revision, so a pull racing a local edit retries instead of tearing
//! or dropping either side.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use guardian_core::{EntityKind, IdentityKey, codec};
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::cache::LocalCache;
use crate::error::{CacheError, SyncError};
use crate::transport::{RemoteTransport, TransportError};
use crate::types::{
    CacheRecord, ExpectedRevision, PushFailure, SyncReport, SyncState, SyncStatus, SyncTrigger,
};

/// Attempts at a compare-and-swap write before giving up.
const CAS_ATTEMPTS: usize = 8;

/// Push groups in dispatch order.
const PUSH_ORDER: [(EntityKind, SyncState); 4] = [
    (EntityKind::User, SyncState::Dirty),
    (EntityKind::Child, SyncState::Dirty),
    (EntityKind::Child, SyncState::Tombstone),
    (EntityKind::HistoryRecord, SyncState::Dirty),
];

/// Kinds with a remote snapshot, in pull order.
const PULL_ORDER: [EntityKind; 2] = [EntityKind::User, EntityKind::Child];

/// Tuning knobs for [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Hard limit on every remote call.
    pub request_timeout: Duration,
    /// Records pushed concurrently within one push group.
    pub max_concurrent_pushes: usize,
    /// Kinds pulled by [`SyncEngine::preload`].
    pub preload: Vec<EntityKind>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_concurrent_pushes: 4,
            preload: vec![EntityKind::User],
        }
    }
}

#[derive(Debug, Default)]
struct PassState {
    running: bool,
    rerun: bool,
}

/// Clears the in-flight flag if a pass is dropped before it finishes.
/// A coalesced follow-up stays owed and runs after the next pass.
struct PassGuard<'a> {
    pass: &'a Mutex<PassState>,
    armed: bool,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.pass).running = false;
        }
    }
}

fn lock(pass: &Mutex<PassState>) -> MutexGuard<'_, PassState> {
    pass.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `remote` with any history records only the local copy has appended to it.
/// Overwriting a synced child never shrinks its history.
fn keep_local_history(kind: EntityKind, local: &Value, remote: &Value) -> Value {
    let mut next = remote.clone();
    if kind != EntityKind::Child {
        return next;
    }
    let local_history = codec::history_slice(local);
    if local_history.is_empty() {
        return next;
    }
    let merged = codec::merge_history(local_history, codec::history_slice(remote));
    if let Some(obj) = next.as_object_mut() {
        obj.insert(codec::HISTORY_FIELD.to_string(), Value::Array(merged));
    }
    next
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PushOutcome {
    Pushed,
    /// Pushed after first pushing the missing parent child.
    Repaired(IdentityKey),
    Purged,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullOutcome {
    Inserted,
    Overwritten,
    Merged,
    Unchanged,
    KeptTombstone,
    Skipped,
}

/// The sync engine. Share it behind an `Arc`.
pub struct SyncEngine {
    cache: LocalCache,
    remote: Arc<dyn RemoteTransport>,
    options: EngineOptions,
    pass: Mutex<PassState>,
    status: watch::Sender<SyncStatus>,
    persist_failures: AtomicU32,
}

impl SyncEngine {
    pub fn new(cache: LocalCache, remote: Arc<dyn RemoteTransport>, options: EngineOptions) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            cache,
            remote,
            options,
            pass: Mutex::new(PassState::default()),
            status,
            persist_failures: AtomicU32::new(0),
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Subscribe to the passive status indicator.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Records of every kind still waiting for a push.
    pub async fn pending_writes(&self) -> Result<u64, SyncError> {
        let mut total = 0;
        for kind in EntityKind::ALL {
            total += self.cache.pending_count(kind).await?;
        }
        Ok(total)
    }

    // ---------------------------------------------------------------------
    // Local writes
    // ---------------------------------------------------------------------

    /// Stage a user write. Acknowledged once durable locally.
    ///
    /// Once a user has been pushed its content is final: the remote only
    /// inserts users, so a changing edit fails with
    /// [`SyncError::UserAlreadySynced`].
    pub async fn stage_user(&self, payload: Value) -> Result<CacheRecord, SyncError> {
        self.stage_entity(EntityKind::User, payload).await
    }

    /// Stage a child write. Acknowledged once durable locally.
    pub async fn stage_child(&self, payload: Value) -> Result<CacheRecord, SyncError> {
        self.stage_entity(EntityKind::Child, payload).await
    }

    async fn stage_entity(&self, kind: EntityKind, mut payload: Value) -> Result<CacheRecord, SyncError> {
        let key = codec::assign_key(kind, &mut payload)?;
        codec::stamp_updated_at(&mut payload, Utc::now());

        let mut unchanged = None;
        let result = self
            .with_cas(kind, &key, |current| match current {
                Some(current) if current.is_tombstone() => Err(SyncError::Tombstoned {
                    kind,
                    key: key.clone(),
                }),
                // Users are insert-only remotely, so a pushed user is final.
                Some(current) if kind == EntityKind::User && current.state == SyncState::Synced => {
                    if !codec::changes_nothing(&payload, &current.payload) {
                        return Err(SyncError::UserAlreadySynced(key.clone()));
                    }
                    unchanged = Some(current.clone());
                    Ok(None)
                }
                Some(current) => Ok(Some(CacheRecord {
                    payload: codec::merge(kind, &payload, &current.payload),
                    state: SyncState::Dirty,
                    ..current.clone()
                })),
                None => Ok(Some(CacheRecord::new(
                    kind,
                    key.clone(),
                    payload.clone(),
                    SyncState::Dirty,
                ))),
            })
            .await;

        let stored = match self.track_persist(result)? {
            Some(stored) => stored,
            None => {
                return unchanged.ok_or_else(|| SyncError::Contention {
                    kind,
                    key: key.clone(),
                });
            }
        };
        tracing::debug!(%kind, %key, revision = stored.revision, "staged local write");
        Ok(stored)
    }

    /// Stage a new growth measurement for `child_key`.
    ///
    /// History records are immutable: re-staging an identical record is a
    /// no-op and a different payload under an existing id is rejected.
    pub async fn stage_history_record(
        &self,
        child_key: &IdentityKey,
        mut record: Value,
    ) -> Result<CacheRecord, SyncError> {
        let record_key = codec::assign_key(EntityKind::HistoryRecord, &mut record)?;

        let child = match self.cache.get(EntityKind::Child, child_key).await? {
            Some(child) if child.is_tombstone() => {
                return Err(SyncError::ChildDeleted(child_key.clone()));
            }
            Some(child) => child,
            None => self
                .read_through(EntityKind::Child, child_key)
                .await?
                .ok_or_else(|| SyncError::UnknownChild(child_key.clone()))?,
        };

        let recorded = codec::history_slice(&child.payload)
            .iter()
            .find(|r| codec::record_identity(r) == record_key.as_str());
        if recorded.is_some_and(|r| r != &record) {
            return Err(SyncError::ImmutableRecord(record_key));
        }
        // Confirmed records leave the outbox; the child's history holds them.
        let already_recorded = recorded.is_some();

        let staged = self
            .with_cas(EntityKind::HistoryRecord, &record_key, |current| match current {
                Some(existing) if existing.payload == record => Ok(None),
                Some(_) => Err(SyncError::ImmutableRecord(record_key.clone())),
                None if already_recorded => Ok(None),
                None => Ok(Some(
                    CacheRecord::new(
                        EntityKind::HistoryRecord,
                        record_key.clone(),
                        record.clone(),
                        SyncState::Dirty,
                    )
                    .with_owner(child_key.clone()),
                )),
            })
            .await;

        let staged = match self.track_persist(staged)? {
            Some(stored) => stored,
            None => {
                tracing::debug!(record = %record_key, "identical history record already staged");
                let outboxed = self.cache.get(EntityKind::HistoryRecord, &record_key).await?;
                return Ok(outboxed.unwrap_or_else(|| {
                    CacheRecord::new(EntityKind::HistoryRecord, record_key, record, SyncState::Synced)
                        .with_owner(child_key.clone())
                }));
            }
        };

        // The child keeps its sync state; only its history grows.
        let appended = self
            .with_cas(EntityKind::Child, child_key, |current| {
                let Some(current) = current.filter(|c| !c.is_tombstone()) else {
                    return Ok(None);
                };
                let mut payload = current.payload.clone();
                if !codec::append_history(&mut payload, &record) {
                    return Ok(None);
                }
                Ok(Some(current.with_payload(payload)))
            })
            .await;
        self.track_persist(appended)?;

        tracing::debug!(child = %child_key, record = %record_key, "staged history record");
        Ok(staged)
    }

    /// Mark a child deleted. The tombstone is pushed on the next pass and
    /// purged (with its pending history) once the remote confirms.
    pub async fn stage_child_delete(&self, key: &IdentityKey) -> Result<(), SyncError> {
        let result = self
            .with_cas(EntityKind::Child, key, |current| match current {
                Some(current) if current.is_tombstone() => Ok(None),
                Some(current) => Ok(Some(current.with_state(SyncState::Tombstone))),
                None => Ok(Some(CacheRecord::new(
                    EntityKind::Child,
                    key.clone(),
                    json!({ "child_id": key.as_str() }),
                    SyncState::Tombstone,
                ))),
            })
            .await;
        self.track_persist(result)?;

        tracing::info!(child = %key, "child marked for deletion");
        Ok(())
    }

    fn track_persist<T>(&self, result: Result<T, SyncError>) -> Result<T, SyncError> {
        match &result {
            Err(SyncError::Cache(e)) => {
                let consecutive = self.persist_failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::error!(error = %e, consecutive, "local write failed to persist");
                self.status
                    .send_replace(SyncStatus::StorageFailing { consecutive });
            }
            Ok(_) => {
                if self.persist_failures.swap(0, Ordering::SeqCst) > 0 {
                    self.status.send_replace(SyncStatus::Idle);
                }
            }
            Err(_) => {}
        }
        result
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Read one entity. Falls back to the remote on a cache miss; returns
    /// `None` when the remote is unreachable too. Deleted children read as
    /// absent.
    pub async fn get(&self, kind: EntityKind, key: &IdentityKey) -> Result<Option<Value>, SyncError> {
        match self.cache.get(kind, key).await? {
            Some(record) if record.is_tombstone() => Ok(None),
            Some(record) => Ok(Some(record.payload)),
            None => Ok(self.read_through(kind, key).await?.map(|r| r.payload)),
        }
    }

    /// Every cached entity of `kind`, deleted children excluded.
    pub async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, SyncError> {
        Ok(self
            .cache
            .get_all(kind)
            .await?
            .into_iter()
            .filter(|r| !r.is_tombstone())
            .map(|r| r.payload)
            .collect())
    }

    async fn read_through(
        &self,
        kind: EntityKind,
        key: &IdentityKey,
    ) -> Result<Option<CacheRecord>, SyncError> {
        let fetched = match kind {
            EntityKind::Child => self.call(self.remote.fetch_child(key)).await,
            EntityKind::User => self.call(self.remote.fetch_users()).await.map(|users| {
                users
                    .into_iter()
                    .find(|u| codec::extract_key(EntityKind::User, u).as_ref() == Some(key))
            }),
            EntityKind::HistoryRecord => Ok(None),
        };

        let payload = match fetched {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::debug!(%kind, %key, error = %e, "read-through unavailable");
                return Ok(None);
            }
        };

        self.reconcile_remote(kind, payload).await?;
        Ok(self
            .cache
            .get(kind, key)
            .await?
            .filter(|r| !r.is_tombstone()))
    }

    // ---------------------------------------------------------------------
    // Sync passes
    // ---------------------------------------------------------------------

    /// Run a push+pull pass, or coalesce into the one already running.
    ///
    /// At most one pass is in flight. Any number of requests made while it
    /// runs collapse into exactly one follow-up pass, which the caller that
    /// started the first pass runs before returning. If that caller is
    /// cancelled mid-pass, the owed follow-up runs after the next pass that
    /// any caller starts.
    pub async fn request_sync(&self) -> SyncTrigger {
        {
            let mut pass = lock(&self.pass);
            if pass.running {
                pass.rerun = true;
                tracing::debug!("sync pass in flight; request coalesced");
                return SyncTrigger::Coalesced;
            }
            pass.running = true;
        }

        let mut guard = PassGuard {
            pass: &self.pass,
            armed: true,
        };
        loop {
            let report = self.run_pass().await;
            {
                let mut pass = lock(&self.pass);
                if pass.rerun {
                    pass.rerun = false;
                    tracing::debug!("running coalesced follow-up pass");
                    continue;
                }
                pass.running = false;
            }
            guard.armed = false;
            return SyncTrigger::Ran(report);
        }
    }

    async fn run_pass(&self) -> SyncReport {
        self.status.send_replace(SyncStatus::Syncing);
        let mut report = SyncReport::default();

        self.push_pass(&mut report).await;
        // Pull runs whether or not the push succeeded.
        self.pull_pass(&mut report).await;

        tracing::info!(
            pushed = report.pushed.len(),
            failed = report.failed.len(),
            repaired = report.repaired_parents.len(),
            purged = report.purged.len(),
            pulled = report.pulled,
            merged = report.merged,
            errors = report.errors.len(),
            "sync pass finished"
        );

        let consecutive = self.persist_failures.load(Ordering::SeqCst);
        let status = if consecutive > 0 {
            SyncStatus::StorageFailing { consecutive }
        } else if report.remote_unreachable && report.pushed.is_empty() {
            SyncStatus::Offline
        } else {
            SyncStatus::Completed(report.summary())
        };
        self.status.send_replace(status);
        report
    }

    async fn push_pass(&self, report: &mut SyncReport) {
        for (kind, state) in PUSH_ORDER {
            let records = match self.cache.list_by_state(kind, state).await {
                Ok(records) => records,
                Err(e) => {
                    tracing::error!(%kind, state = state.as_str(), error = %e, "could not read pending records");
                    report.errors.push(format!("reading pending {kind}: {e}"));
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }
            tracing::debug!(%kind, state = state.as_str(), count = records.len(), "pushing pending records");

            let limit = self.options.max_concurrent_pushes.max(1);
            let outcomes: Vec<(CacheRecord, Result<PushOutcome, SyncError>)> = stream::iter(records)
                .map(|record| async move {
                    let outcome = self.push_record(&record).await;
                    (record, outcome)
                })
                .buffer_unordered(limit)
                .collect()
                .await;

            for (record, outcome) in outcomes {
                match outcome {
                    Ok(PushOutcome::Pushed) => report.pushed.push((record.kind, record.key)),
                    Ok(PushOutcome::Repaired(parent)) => {
                        report.repaired_parents.push(parent);
                        report.pushed.push((record.kind, record.key));
                    }
                    Ok(PushOutcome::Purged) => report.purged.push(record.key),
                    Ok(PushOutcome::Skipped) => {}
                    Err(e) => {
                        tracing::warn!(kind = %record.kind, key = %record.key, error = %e, "push failed; will retry");
                        report.failed.push(PushFailure {
                            kind: record.kind,
                            key: record.key,
                            error: e.to_string(),
                            transient: e.is_transient(),
                        });
                    }
                }
            }
        }
    }

    async fn push_record(&self, record: &CacheRecord) -> Result<PushOutcome, SyncError> {
        match (record.kind, record.state) {
            (EntityKind::User, SyncState::Dirty) => self.push_user(record).await,
            (EntityKind::Child, SyncState::Dirty) => self.push_child(record).await,
            (EntityKind::Child, SyncState::Tombstone) => self.push_child_delete(record).await,
            (EntityKind::HistoryRecord, SyncState::Dirty) => self.push_history(record).await,
            _ => Ok(PushOutcome::Skipped),
        }
    }

    async fn push_user(&self, record: &CacheRecord) -> Result<PushOutcome, SyncError> {
        let response = self
            .call(self.remote.sync_users(std::slice::from_ref(&record.payload)))
            .await?;
        if !response.success {
            return Err(TransportError::Rejected("user sync reported failure".into()).into());
        }
        if response.inserted == 0 {
            // Skipped as a duplicate: only a retry of the same content counts.
            let existing = self
                .call(self.remote.fetch_users())
                .await?
                .into_iter()
                .find(|u| codec::extract_key(EntityKind::User, u).as_ref() == Some(&record.key));
            match existing {
                Some(remote) if codec::changes_nothing(&record.payload, &remote) => {}
                Some(_) => return Err(SyncError::UserAlreadySynced(record.key.clone())),
                None => {
                    return Err(TransportError::Rejected(format!("user {} was not inserted", record.key)).into());
                }
            }
        }
        self.mark_synced(record).await?;
        Ok(PushOutcome::Pushed)
    }

    async fn push_child(&self, record: &CacheRecord) -> Result<PushOutcome, SyncError> {
        let response = self
            .call(self.remote.sync_children(std::slice::from_ref(&record.payload)))
            .await?;
        response.accepted(&record.key)?;
        self.mark_synced(record).await?;
        Ok(PushOutcome::Pushed)
    }

    async fn push_child_delete(&self, record: &CacheRecord) -> Result<PushOutcome, SyncError> {
        let outcome = self.call(self.remote.delete_child(&record.key)).await?;
        let removed = self.cache.purge(EntityKind::Child, &record.key).await?;
        tracing::debug!(child = %record.key, ?outcome, removed, "purged deleted child");
        Ok(PushOutcome::Purged)
    }

    async fn push_history(&self, record: &CacheRecord) -> Result<PushOutcome, SyncError> {
        let Some(child_key) = record.owner.clone() else {
            return Err(CacheError::Corrupt {
                kind: record.kind.to_string(),
                key: record.key.to_string(),
                reason: "history record without owning child".into(),
            }
            .into());
        };

        // Purged together with its tombstoned child.
        if let Some(parent) = self.cache.get(EntityKind::Child, &child_key).await? {
            if parent.is_tombstone() {
                return Ok(PushOutcome::Skipped);
            }
        }

        let (history, outcome) = match self.call(self.remote.add_record(&child_key, &record.payload)).await {
            Ok(history) => (history, PushOutcome::Pushed),
            Err(TransportError::ParentNotFound(_)) => {
                let parent = self
                    .cache
                    .get(EntityKind::Child, &child_key)
                    .await?
                    .filter(|c| !c.is_tombstone())
                    .ok_or_else(|| SyncError::UnknownChild(child_key.clone()))?;
                tracing::info!(child = %child_key, record = %record.key, "parent missing remotely; pushing it first");
                self.push_child(&parent).await?;
                let history = self
                    .call(self.remote.add_record(&child_key, &record.payload))
                    .await?;
                (history, PushOutcome::Repaired(child_key.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        self.reconcile_history(&child_key, &history).await?;
        if codec::history_contains(&history, &record.key) {
            self.retire_history(record).await?;
        } else {
            self.mark_synced(record).await?;
        }
        Ok(outcome)
    }

    /// Fold the remote's view of a child's history into the cached child.
    async fn reconcile_history(&self, child_key: &IdentityKey, remote_history: &[Value]) -> Result<(), SyncError> {
        self.with_cas(EntityKind::Child, child_key, |current| {
            let Some(current) = current.filter(|c| !c.is_tombstone()) else {
                return Ok(None);
            };
            let local = codec::history_slice(&current.payload);
            let merged = codec::merge_history(local, remote_history);
            if merged.as_slice() == local {
                return Ok(None);
            }
            let mut payload = current.payload.clone();
            if let Some(obj) = payload.as_object_mut() {
                obj.insert(codec::HISTORY_FIELD.to_string(), Value::Array(merged));
            }
            Ok(Some(current.with_payload(payload)))
        })
        .await?;
        Ok(())
    }

    /// Drop a history record from the outbox once the remote holds it.
    async fn retire_history(&self, pushed: &CacheRecord) -> Result<(), SyncError> {
        let removed = self
            .cache
            .remove_if(pushed.kind, &pushed.key, pushed.revision)
            .await?;
        tracing::debug!(record = %pushed.key, removed, "history record confirmed remotely");
        Ok(())
    }

    /// Flip a pushed record to `Synced` unless it changed while in flight.
    async fn mark_synced(&self, pushed: &CacheRecord) -> Result<(), SyncError> {
        let written = self
            .with_cas(pushed.kind, &pushed.key, |current| match current {
                Some(current) if current.revision == pushed.revision && current.is_dirty() => {
                    Ok(Some(current.with_state(SyncState::Synced)))
                }
                _ => Ok(None),
            })
            .await?;
        if written.is_none() {
            tracing::debug!(kind = %pushed.kind, key = %pushed.key, "record changed during push; left pending");
        }
        Ok(())
    }

    async fn pull_pass(&self, report: &mut SyncReport) {
        for kind in PULL_ORDER {
            let snapshot = match self.fetch_snapshot(kind).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(%kind, error = %e, "snapshot fetch failed");
                    report.remote_unreachable |= e.is_transient();
                    report.errors.push(format!("fetching {kind}: {e}"));
                    continue;
                }
            };

            for payload in snapshot {
                match self.reconcile_remote(kind, payload).await {
                    Ok(PullOutcome::Inserted | PullOutcome::Overwritten) => report.pulled += 1,
                    Ok(PullOutcome::Merged) => report.merged += 1,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(%kind, error = %e, "could not reconcile remote record");
                        report.errors.push(format!("reconciling {kind}: {e}"));
                    }
                }
            }
        }
    }

    async fn fetch_snapshot(&self, kind: EntityKind) -> Result<Vec<Value>, TransportError> {
        match kind {
            EntityKind::User => self.call(self.remote.fetch_users()).await,
            EntityKind::Child => self.call(self.remote.fetch_children()).await,
            EntityKind::HistoryRecord => Ok(Vec::new()),
        }
    }

    /// Reconcile one fetched remote record with its local copy.
    async fn reconcile_remote(&self, kind: EntityKind, mut payload: Value) -> Result<PullOutcome, SyncError> {
        if codec::extract_key(kind, &payload).is_none() {
            tracing::warn!(%kind, "remote record without identity key skipped");
            return Ok(PullOutcome::Skipped);
        }
        let key = codec::assign_key(kind, &mut payload)?;

        // Pending appends survive an overwrite by being laid back on top.
        let pending: Vec<CacheRecord> = if kind == EntityKind::Child {
            self.cache
                .list_owned(EntityKind::HistoryRecord, &key)
                .await?
                .into_iter()
                .filter(CacheRecord::is_dirty)
                .collect()
        } else {
            Vec::new()
        };
        let mut overlaid = payload.clone();
        for record in &pending {
            codec::append_history(&mut overlaid, &record.payload);
        }

        let mut outcome = PullOutcome::Unchanged;
        self.with_cas(kind, &key, |current| {
            let (next, result) = match current {
                None => (
                    Some(CacheRecord::new(kind, key.clone(), overlaid.clone(), SyncState::Synced)),
                    PullOutcome::Inserted,
                ),
                Some(current) if current.is_tombstone() => (None, PullOutcome::KeptTombstone),
                Some(current) if current.is_dirty() => {
                    let merged = codec::merge(kind, &current.payload, &payload);
                    if merged == current.payload {
                        (None, PullOutcome::Unchanged)
                    } else {
                        (Some(current.with_payload(merged)), PullOutcome::Merged)
                    }
                }
                Some(current) => {
                    let next = keep_local_history(kind, &current.payload, &overlaid);
                    if next == current.payload {
                        (None, PullOutcome::Unchanged)
                    } else {
                        (Some(current.with_payload(next)), PullOutcome::Overwritten)
                    }
                }
            };
            outcome = result;
            Ok(next)
        })
        .await?;

        if outcome != PullOutcome::KeptTombstone {
            let remote_history = codec::history_slice(&payload);
            for record in pending.iter().filter(|r| codec::history_contains(remote_history, &r.key)) {
                self.retire_history(record).await?;
            }
        }

        Ok(outcome)
    }

    /// Pull the configured preload kinds so they are available offline.
    ///
    /// Returns the number of records inserted or refreshed.
    pub async fn preload(&self) -> Result<usize, SyncError> {
        let mut loaded = 0;
        for &kind in &self.options.preload {
            let snapshot = self.fetch_snapshot(kind).await?;
            let fetched = snapshot.len();
            for payload in snapshot {
                if matches!(
                    self.reconcile_remote(kind, payload).await?,
                    PullOutcome::Inserted | PullOutcome::Overwritten
                ) {
                    loaded += 1;
                }
            }
            tracing::info!(%kind, fetched, "preloaded");
        }
        Ok(loaded)
    }

    /// Replace the cached copy of `kind` with a fresh remote snapshot.
    ///
    /// Refused while any record of `kind` is pending, and for children also
    /// while any history record is, since those live in the child payload.
    /// For history records, which have no remote snapshot, this drops the
    /// already-pushed outbox.
    pub async fn refresh_snapshot(&self, kind: EntityKind) -> Result<usize, SyncError> {
        let guard: &[EntityKind] = match kind {
            EntityKind::Child => &[EntityKind::HistoryRecord],
            _ => &[],
        };
        self.ensure_nothing_pending(kind, guard).await?;

        let snapshot = self.fetch_snapshot(kind).await?;
        let mut records = Vec::with_capacity(snapshot.len());
        for mut payload in snapshot {
            if codec::extract_key(kind, &payload).is_none() {
                continue;
            }
            let key = codec::assign_key(kind, &mut payload)?;
            records.push(CacheRecord::new(kind, key, payload, SyncState::Synced));
        }

        if !self.cache.replace_snapshot(kind, &records, guard).await? {
            // A local write landed between the check and the swap.
            self.ensure_nothing_pending(kind, guard).await?;
            return Err(SyncError::PendingWrites { kind, count: 0 });
        }
        tracing::info!(%kind, records = records.len(), "snapshot refreshed");
        Ok(records.len())
    }

    async fn ensure_nothing_pending(&self, kind: EntityKind, guard: &[EntityKind]) -> Result<(), SyncError> {
        for blocking in std::iter::once(kind).chain(guard.iter().copied()) {
            let count = self.cache.pending_count(blocking).await?;
            if count > 0 {
                return Err(SyncError::PendingWrites { kind: blocking, count });
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    /// Run a remote call under the hard request timeout.
    async fn call<T, F>(&self, request: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let limit = self.options.request_timeout;
        tokio::time::timeout(limit, request)
            .await
            .unwrap_or_else(|_| Err(TransportError::Timeout(limit)))
    }

    /// Read-modify-write one record with compare-and-swap.
    ///
    /// `update` sees the current record (if any) and returns the record to
    /// store, or `None` to leave it alone. Lost races re-read and retry.
    async fn with_cas<F>(
        &self,
        kind: EntityKind,
        key: &IdentityKey,
        mut update: F,
    ) -> Result<Option<CacheRecord>, SyncError>
    where
        F: FnMut(Option<&CacheRecord>) -> Result<Option<CacheRecord>, SyncError>,
    {
        for _ in 0..CAS_ATTEMPTS {
            let current = self.cache.get(kind, key).await?;
            let Some(next) = update(current.as_ref())? else {
                return Ok(None);
            };
            let expected = ExpectedRevision::of(current.as_ref());
            if let Some(stored) = self.cache.put_if(next, expected).await? {
                return Ok(Some(stored));
            }
            tracing::debug!(%kind, %key, "lost cache write race; retrying");
        }
        Err(SyncError::Contention {
            kind,
            key: key.clone(),
        })
    }
}
