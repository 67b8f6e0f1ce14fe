//! In-process remote backend.
//!
//! Intended for tests/dev. Mirrors the HTTP backend's contract (idempotent
//! upserts by identity key, insert-only users, append-only history, delete
//! that treats "not found" as success) and adds fault injection: the whole
//! remote can be taken offline, individual keys can be made to fail, and
//! calls can be slowed down.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use guardian_core::{EntityKind, IdentityKey, codec};
use serde_json::Value;

use super::{
    DeleteOutcome, RejectedEntity, RemoteTransport, SyncChildrenResponse, SyncUsersResponse,
    TransportError,
};

/// Number of calls seen per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCalls {
    pub probe: usize,
    pub sync_users: usize,
    pub sync_children: usize,
    pub fetch_users: usize,
    pub fetch_children: usize,
    pub fetch_child: usize,
    pub add_record: usize,
    pub delete_child: usize,
}

#[derive(Debug, Default)]
struct RemoteState {
    users: BTreeMap<IdentityKey, Value>,
    children: BTreeMap<IdentityKey, Value>,
    offline: bool,
    failing: HashSet<IdentityKey>,
    latency: Option<Duration>,
    calls: RemoteCalls,
}

/// In-memory remote backend with fault injection.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call fail with a network error (or stop doing so).
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Make pushes that carry `key` fail with a network error.
    pub fn fail_key(&self, key: &IdentityKey) {
        self.lock().failing.insert(key.clone());
    }

    pub fn heal_key(&self, key: &IdentityKey) {
        self.lock().failing.remove(key);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Store a child directly, as if another device had pushed it.
    pub fn seed_child(&self, mut child: Value) -> Option<IdentityKey> {
        let key = codec::assign_key(EntityKind::Child, &mut child).ok()?;
        self.lock().children.insert(key.clone(), child);
        Some(key)
    }

    /// Store a user directly, as if another device had pushed it.
    pub fn seed_user(&self, mut user: Value) -> Option<IdentityKey> {
        let key = codec::assign_key(EntityKind::User, &mut user).ok()?;
        self.lock().users.insert(key.clone(), user);
        Some(key)
    }

    pub fn child(&self, key: &IdentityKey) -> Option<Value> {
        self.lock().children.get(key).cloned()
    }

    pub fn user(&self, key: &IdentityKey) -> Option<Value> {
        self.lock().users.get(key).cloned()
    }

    pub fn child_count(&self) -> usize {
        self.lock().children.len()
    }

    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }

    pub fn calls(&self) -> RemoteCalls {
        self.lock().calls
    }

    /// Apply latency and the offline switch; `count` bumps the call counter.
    async fn enter(&self, count: impl FnOnce(&mut RemoteCalls)) -> Result<(), TransportError> {
        let latency = {
            let mut state = self.lock();
            count(&mut state.calls);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.lock().offline {
            return Err(TransportError::Network("remote offline".into()));
        }
        Ok(())
    }

    fn check_failing(state: &RemoteState, key: &IdentityKey) -> Result<(), TransportError> {
        if state.failing.contains(key) {
            return Err(TransportError::Network(format!("injected failure for {key}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteTransport for InMemoryRemote {
    async fn probe(&self) -> Result<(), TransportError> {
        self.enter(|c| c.probe += 1).await
    }

    async fn sync_users(&self, users: &[Value]) -> Result<SyncUsersResponse, TransportError> {
        self.enter(|c| c.sync_users += 1).await?;
        let mut state = self.lock();

        let mut keyed = Vec::with_capacity(users.len());
        for user in users {
            let mut user = user.clone();
            let key = codec::assign_key(EntityKind::User, &mut user)
                .map_err(|e| TransportError::Rejected(e.to_string()))?;
            Self::check_failing(&state, &key)?;
            keyed.push((key, user));
        }

        let mut inserted = 0;
        for (key, user) in keyed {
            if !state.users.contains_key(&key) {
                state.users.insert(key, user);
                inserted += 1;
            }
        }
        Ok(SyncUsersResponse {
            success: true,
            inserted,
        })
    }

    async fn sync_children(&self, children: &[Value]) -> Result<SyncChildrenResponse, TransportError> {
        self.enter(|c| c.sync_children += 1).await?;
        let mut state = self.lock();
        let mut response = SyncChildrenResponse {
            success: true,
            ..Default::default()
        };

        for child in children {
            let Some(key) = codec::extract_key(EntityKind::Child, child) else {
                response.failed.push(RejectedEntity {
                    key: String::new(),
                    error: "child has no identity key".into(),
                });
                continue;
            };
            Self::check_failing(&state, &key)?;

            let mut incoming = child.clone();
            if codec::assign_key(EntityKind::Child, &mut incoming).is_err() {
                response.failed.push(RejectedEntity {
                    key: key.to_string(),
                    error: "child must be an object".into(),
                });
                continue;
            }
            let stored = match state.children.get(&key) {
                Some(existing) => codec::merge(EntityKind::Child, &incoming, existing),
                None => incoming,
            };
            state.children.insert(key.clone(), stored);
            response.upserted.push(key.into());
        }

        response.success = response.failed.is_empty();
        Ok(response)
    }

    async fn fetch_users(&self) -> Result<Vec<Value>, TransportError> {
        self.enter(|c| c.fetch_users += 1).await?;
        Ok(self.lock().users.values().cloned().collect())
    }

    async fn fetch_children(&self) -> Result<Vec<Value>, TransportError> {
        self.enter(|c| c.fetch_children += 1).await?;
        Ok(self.lock().children.values().cloned().collect())
    }

    async fn fetch_child(&self, key: &IdentityKey) -> Result<Option<Value>, TransportError> {
        self.enter(|c| c.fetch_child += 1).await?;
        Ok(self.lock().children.get(key).cloned())
    }

    async fn add_record(&self, child: &IdentityKey, record: &Value) -> Result<Vec<Value>, TransportError> {
        self.enter(|c| c.add_record += 1).await?;
        let mut state = self.lock();
        if let Some(key) = codec::extract_key(EntityKind::HistoryRecord, record) {
            Self::check_failing(&state, &key)?;
        }

        let Some(stored) = state.children.get_mut(child) else {
            return Err(TransportError::ParentNotFound(child.clone()));
        };
        codec::append_history(stored, record);
        Ok(codec::history_slice(stored).to_vec())
    }

    async fn delete_child(&self, key: &IdentityKey) -> Result<DeleteOutcome, TransportError> {
        self.enter(|c| c.delete_child += 1).await?;
        let mut state = self.lock();
        Self::check_failing(&state, key)?;
        Ok(match state.children.remove(key) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::AlreadyAbsent,
        })
    }
}
