//! Durable local cache backed by SQLite.
//!
//! One table holds every entity kind; `(entity_kind, identity_key)` is the
//! container key. Each row carries its sync state, an optional owner (the
//! child a history record belongs to) and a revision counter that the engine
//! uses for compare-and-swap writes. A write either fully lands or has no
//! effect: every mutation is a single statement or one transaction.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use guardian_core::{EntityKind, IdentityKey};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use crate::error::CacheError;
use crate::types::{CacheRecord, ExpectedRevision, SyncState};

impl sqlx::Type<sqlx::Sqlite> for SyncState {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for SyncState {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        SyncState::parse(s).ok_or_else(|| format!("invalid SyncState: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for SyncState {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let s = self.as_str();
        <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
    }
}

const SELECT_COLUMNS: &str =
    "entity_kind, identity_key, payload, sync_state, owner_key, revision, updated_at";

/// SQLite-backed local cache.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct LocalCache {
    pool: SqlitePool,
}

impl LocalCache {
    /// Open (creating if needed) the cache database at `path`.
    ///
    /// Runs in WAL mode with `synchronous = FULL` so a committed write
    /// survives a process kill.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        tracing::debug!(path = %path.display(), "opened local cache");
        Self::with_pool(pool).await
    }

    /// A private in-memory cache. Contents vanish when the last clone drops.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection to `:memory:` is its own database, so pin the pool
        // to one connection that never expires.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, CacheError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_records (
                entity_kind  TEXT NOT NULL,
                identity_key TEXT NOT NULL,
                payload      TEXT NOT NULL,
                sync_state   TEXT NOT NULL,
                owner_key    TEXT NULL,
                revision     INTEGER NOT NULL,
                updated_at   TEXT NOT NULL,
                PRIMARY KEY (entity_kind, identity_key)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS cache_records_by_state
            ON cache_records (entity_kind, sync_state)
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS cache_records_by_owner
            ON cache_records (owner_key)
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Insert or replace a record unconditionally.
    pub async fn put(&self, record: CacheRecord) -> Result<CacheRecord, CacheError> {
        match self.put_if(record, ExpectedRevision::Any).await? {
            Some(stored) => Ok(stored),
            // `Any` never loses a race.
            None => Err(CacheError::Storage(sqlx::Error::RowNotFound)),
        }
    }

    /// Write `record` if the stored revision matches `expected`.
    ///
    /// Returns the stored record (with its new revision), or `None` when the
    /// expectation did not hold and nothing was written.
    pub async fn put_if(
        &self,
        record: CacheRecord,
        expected: ExpectedRevision,
    ) -> Result<Option<CacheRecord>, CacheError> {
        let payload = serde_json::to_string(&record.payload)?;
        let now = Utc::now();
        let owner = record.owner.as_ref().map(IdentityKey::as_str);

        let sql = match expected {
            ExpectedRevision::Any => {
                r#"
                INSERT INTO cache_records (
                    entity_kind, identity_key, payload, sync_state, owner_key, revision, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
                ON CONFLICT(entity_kind, identity_key) DO UPDATE SET
                    payload = excluded.payload,
                    sync_state = excluded.sync_state,
                    owner_key = excluded.owner_key,
                    revision = cache_records.revision + 1,
                    updated_at = excluded.updated_at
                RETURNING revision
                "#
            }
            ExpectedRevision::Absent => {
                r#"
                INSERT INTO cache_records (
                    entity_kind, identity_key, payload, sync_state, owner_key, revision, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
                ON CONFLICT(entity_kind, identity_key) DO NOTHING
                RETURNING revision
                "#
            }
            ExpectedRevision::Exact(_) => {
                r#"
                UPDATE cache_records SET
                    payload = ?3,
                    sync_state = ?4,
                    owner_key = ?5,
                    revision = revision + 1,
                    updated_at = ?6
                WHERE entity_kind = ?1
                  AND identity_key = ?2
                  AND revision = ?7
                RETURNING revision
                "#
            }
        };

        let mut query = sqlx::query(sql)
            .bind(record.kind.as_str())
            .bind(record.key.as_str())
            .bind(&payload)
            .bind(record.state)
            .bind(owner)
            .bind(now.to_rfc3339());
        if let ExpectedRevision::Exact(rev) = expected {
            query = query.bind(rev as i64);
        }

        let row = query.fetch_optional(&self.pool).await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let revision: i64 = row.try_get("revision")?;

        Ok(Some(CacheRecord {
            revision: revision as u64,
            updated_at: now,
            ..record
        }))
    }

    /// Fetch one record by kind and key.
    pub async fn get(
        &self,
        kind: EntityKind,
        key: &IdentityKey,
    ) -> Result<Option<CacheRecord>, CacheError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM cache_records WHERE entity_kind = ?1 AND identity_key = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_record(&row)).transpose()
    }

    /// Every record of `kind`, tombstones included, ordered by key.
    pub async fn get_all(&self, kind: EntityKind) -> Result<Vec<CacheRecord>, CacheError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM cache_records WHERE entity_kind = ?1 ORDER BY identity_key"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Records of `kind` in `state`, oldest local write first.
    pub async fn list_by_state(
        &self,
        kind: EntityKind,
        state: SyncState,
    ) -> Result<Vec<CacheRecord>, CacheError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM cache_records \
             WHERE entity_kind = ?1 AND sync_state = ?2 \
             ORDER BY updated_at, identity_key"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(state)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Records of `kind` owned by `owner`, oldest local write first.
    pub async fn list_owned(
        &self,
        kind: EntityKind,
        owner: &IdentityKey,
    ) -> Result<Vec<CacheRecord>, CacheError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM cache_records \
             WHERE entity_kind = ?1 AND owner_key = ?2 \
             ORDER BY updated_at, identity_key"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(owner.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Number of records of `kind` that are not `Synced`.
    pub async fn pending_count(&self, kind: EntityKind) -> Result<u64, CacheError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS pending
            FROM cache_records
            WHERE entity_kind = ?1 AND sync_state != ?2
            "#,
        )
        .bind(kind.as_str())
        .bind(SyncState::Synced)
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = row.try_get("pending")?;
        Ok(pending as u64)
    }

    /// Delete one record. Returns whether a row existed.
    pub async fn remove(&self, kind: EntityKind, key: &IdentityKey) -> Result<bool, CacheError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cache_records
            WHERE entity_kind = ?1 AND identity_key = ?2
            "#,
        )
        .bind(kind.as_str())
        .bind(key.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete one record if it is still at `revision`. Returns whether it was
    /// removed.
    pub async fn remove_if(
        &self,
        kind: EntityKind,
        key: &IdentityKey,
        revision: u64,
    ) -> Result<bool, CacheError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cache_records
            WHERE entity_kind = ?1 AND identity_key = ?2 AND revision = ?3
            "#,
        )
        .bind(kind.as_str())
        .bind(key.as_str())
        .bind(revision as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a record together with every record it owns.
    ///
    /// Returns the number of rows removed.
    pub async fn purge(&self, kind: EntityKind, key: &IdentityKey) -> Result<u64, CacheError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cache_records
            WHERE (entity_kind = ?1 AND identity_key = ?2)
               OR owner_key = ?2
            "#,
        )
        .bind(kind.as_str())
        .bind(key.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Remove every record of `kind`. Returns the number of rows removed.
    pub async fn clear(&self, kind: EntityKind) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM cache_records WHERE entity_kind = ?1")
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Atomically replace every record of `kind` with `records`.
    ///
    /// Refuses (returning `Ok(false)`) while any record of `kind`, or of a
    /// kind listed in `guard`, is still pending, so an unpushed local write is
    /// never discarded.
    pub async fn replace_snapshot(
        &self,
        kind: EntityKind,
        records: &[CacheRecord],
        guard: &[EntityKind],
    ) -> Result<bool, CacheError> {
        let mut tx = self.pool.begin().await?;

        for blocking in std::iter::once(kind).chain(guard.iter().copied()) {
            let row = sqlx::query(
                r#"
                SELECT COUNT(*) AS pending
                FROM cache_records
                WHERE entity_kind = ?1 AND sync_state != ?2
                "#,
            )
            .bind(blocking.as_str())
            .bind(SyncState::Synced)
            .fetch_one(&mut *tx)
            .await?;
            let pending: i64 = row.try_get("pending")?;
            if pending > 0 {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        sqlx::query("DELETE FROM cache_records WHERE entity_kind = ?1")
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;

        let now = Utc::now().to_rfc3339();
        for record in records.iter().filter(|r| r.kind == kind) {
            let payload = serde_json::to_string(&record.payload)?;
            sqlx::query(
                r#"
                INSERT INTO cache_records (
                    entity_kind, identity_key, payload, sync_state, owner_key, revision, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
                ON CONFLICT(entity_kind, identity_key) DO NOTHING
                "#,
            )
            .bind(kind.as_str())
            .bind(record.key.as_str())
            .bind(&payload)
            .bind(record.state)
            .bind(record.owner.as_ref().map(IdentityKey::as_str))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

fn corrupt(kind: &str, key: &str, reason: impl ToString) -> CacheError {
    CacheError::Corrupt {
        kind: kind.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn row_to_record(row: &SqliteRow) -> Result<CacheRecord, CacheError> {
    let kind_raw: String = row.try_get("entity_kind")?;
    let key_raw: String = row.try_get("identity_key")?;

    let kind = EntityKind::from_str(&kind_raw).map_err(|e| corrupt(&kind_raw, &key_raw, e))?;
    let key = IdentityKey::parse(&key_raw).ok_or_else(|| corrupt(&kind_raw, &key_raw, "blank key"))?;

    let payload_raw: String = row.try_get("payload")?;
    let payload: Value =
        serde_json::from_str(&payload_raw).map_err(|e| corrupt(&kind_raw, &key_raw, e))?;

    let state: SyncState = row
        .try_get("sync_state")
        .map_err(|e| corrupt(&kind_raw, &key_raw, e))?;

    let owner: Option<String> = row.try_get("owner_key")?;
    let revision: i64 = row.try_get("revision")?;

    let updated_at_raw: String = row.try_get("updated_at")?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(&kind_raw, &key_raw, e))?;

    Ok(CacheRecord {
        kind,
        key,
        payload,
        state,
        owner: owner.as_deref().and_then(IdentityKey::parse),
        revision: revision as u64,
        updated_at,
    })
}

/// Default cache location: `{app_data_dir}/growth-guardian/cache.db`.
pub fn default_cache_path() -> Option<PathBuf> {
    let mut dir = dirs::data_dir().or_else(|| {
        dirs::home_dir().map(|mut h| {
            h.push(".local");
            h.push("share");
            h
        })
    })?;
    dir.push("growth-guardian");
    dir.push("cache.db");
    Some(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(raw: &str) -> IdentityKey {
        IdentityKey::parse(raw).unwrap()
    }

    fn child(raw: &str, state: SyncState) -> CacheRecord {
        CacheRecord::new(
            EntityKind::Child,
            key(raw),
            json!({ "child_id": raw, "name": "Asha" }),
            state,
        )
    }

    #[tokio::test]
    async fn put_then_get_round_trips_state_and_owner() {
        let cache = LocalCache::in_memory().await.unwrap();
        let record = CacheRecord::new(
            EntityKind::HistoryRecord,
            key("R1"),
            json!({ "id": "R1", "height": 91.5 }),
            SyncState::Dirty,
        )
        .with_owner(key("K1"));

        let stored = cache.put(record).await.unwrap();
        assert_eq!(stored.revision, 1);

        let read = cache.get(EntityKind::HistoryRecord, &key("R1")).await.unwrap().unwrap();
        assert_eq!(read.state, SyncState::Dirty);
        assert_eq!(read.owner, Some(key("K1")));
        assert_eq!(read.payload["height"], json!(91.5));
        assert!(cache.get(EntityKind::Child, &key("R1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_bumps_revision() {
        let cache = LocalCache::in_memory().await.unwrap();
        cache.put(child("K1", SyncState::Dirty)).await.unwrap();
        let second = cache.put(child("K1", SyncState::Synced)).await.unwrap();
        assert_eq!(second.revision, 2);
        assert_eq!(second.state, SyncState::Synced);
    }

    #[tokio::test]
    async fn put_if_rejects_stale_revision() {
        let cache = LocalCache::in_memory().await.unwrap();
        let first = cache.put(child("K1", SyncState::Synced)).await.unwrap();

        let written = cache
            .put_if(child("K1", SyncState::Dirty), ExpectedRevision::Exact(first.revision))
            .await
            .unwrap();
        assert!(written.is_some());

        // Someone else wrote in between; the old revision no longer matches.
        let stale = cache
            .put_if(child("K1", SyncState::Synced), ExpectedRevision::Exact(first.revision))
            .await
            .unwrap();
        assert!(stale.is_none());

        let absent = cache
            .put_if(child("K1", SyncState::Synced), ExpectedRevision::Absent)
            .await
            .unwrap();
        assert!(absent.is_none());

        let read = cache.get(EntityKind::Child, &key("K1")).await.unwrap().unwrap();
        assert_eq!(read.state, SyncState::Dirty);
    }

    #[tokio::test]
    async fn list_by_state_and_owner() {
        let cache = LocalCache::in_memory().await.unwrap();
        cache.put(child("K1", SyncState::Dirty)).await.unwrap();
        cache.put(child("K2", SyncState::Synced)).await.unwrap();
        cache.put(child("K3", SyncState::Tombstone)).await.unwrap();
        for id in ["R1", "R2"] {
            let record = CacheRecord::new(EntityKind::HistoryRecord, key(id), json!({ "id": id }), SyncState::Dirty)
                .with_owner(key("K1"));
            cache.put(record).await.unwrap();
        }

        let dirty = cache.list_by_state(EntityKind::Child, SyncState::Dirty).await.unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].key, key("K1"));

        let owned = cache.list_owned(EntityKind::HistoryRecord, &key("K1")).await.unwrap();
        assert_eq!(owned.len(), 2);

        assert_eq!(cache.pending_count(EntityKind::Child).await.unwrap(), 2);
        assert_eq!(cache.get_all(EntityKind::Child).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn purge_removes_owned_records() {
        let cache = LocalCache::in_memory().await.unwrap();
        cache.put(child("K1", SyncState::Tombstone)).await.unwrap();
        cache.put(child("K2", SyncState::Synced)).await.unwrap();
        let record = CacheRecord::new(EntityKind::HistoryRecord, key("R1"), json!({ "id": "R1" }), SyncState::Dirty)
            .with_owner(key("K1"));
        cache.put(record).await.unwrap();

        assert_eq!(cache.purge(EntityKind::Child, &key("K1")).await.unwrap(), 2);
        assert!(cache.get(EntityKind::HistoryRecord, &key("R1")).await.unwrap().is_none());
        assert!(cache.get(EntityKind::Child, &key("K2")).await.unwrap().is_some());
        assert!(!cache.remove(EntityKind::Child, &key("K1")).await.unwrap());
    }

    #[tokio::test]
    async fn clear_only_touches_one_kind() {
        let cache = LocalCache::in_memory().await.unwrap();
        cache.put(child("K1", SyncState::Synced)).await.unwrap();
        let user = CacheRecord::new(EntityKind::User, key("N1"), json!({ "nationalId": "N1" }), SyncState::Synced);
        cache.put(user).await.unwrap();

        assert_eq!(cache.clear(EntityKind::Child).await.unwrap(), 1);
        assert!(cache.get_all(EntityKind::Child).await.unwrap().is_empty());
        assert_eq!(cache.get_all(EntityKind::User).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replace_snapshot_refuses_while_pending() {
        let cache = LocalCache::in_memory().await.unwrap();
        cache.put(child("K1", SyncState::Dirty)).await.unwrap();

        let snapshot = vec![child("K9", SyncState::Synced)];
        assert!(!cache.replace_snapshot(EntityKind::Child, &snapshot, &[]).await.unwrap());
        assert!(cache.get(EntityKind::Child, &key("K1")).await.unwrap().is_some());

        cache.put(child("K1", SyncState::Synced)).await.unwrap();
        assert!(cache.replace_snapshot(EntityKind::Child, &snapshot, &[]).await.unwrap());
        let all = cache.get_all(EntityKind::Child).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, key("K9"));
    }

    #[tokio::test]
    async fn replace_snapshot_honours_guard_kinds() {
        let cache = LocalCache::in_memory().await.unwrap();
        cache.put(child("K1", SyncState::Synced)).await.unwrap();
        let record = CacheRecord::new(
            EntityKind::HistoryRecord,
            key("R1"),
            json!({ "id": "R1" }),
            SyncState::Dirty,
        )
        .with_owner(key("K1"));
        cache.put(record).await.unwrap();

        let snapshot = vec![child("K9", SyncState::Synced)];
        let guard = [EntityKind::HistoryRecord];
        assert!(!cache.replace_snapshot(EntityKind::Child, &snapshot, &guard).await.unwrap());
        assert!(cache.get(EntityKind::Child, &key("K1")).await.unwrap().is_some());
        assert!(cache.replace_snapshot(EntityKind::Child, &snapshot, &[]).await.unwrap());
    }

    #[tokio::test]
    async fn remove_if_checks_revision() {
        let cache = LocalCache::in_memory().await.unwrap();
        let first = cache.put(child("K1", SyncState::Synced)).await.unwrap();
        cache.put(child("K1", SyncState::Synced)).await.unwrap();

        assert!(!cache.remove_if(EntityKind::Child, &key("K1"), first.revision).await.unwrap());
        assert!(cache.get(EntityKind::Child, &key("K1")).await.unwrap().is_some());
        assert!(cache.remove_if(EntityKind::Child, &key("K1"), first.revision + 1).await.unwrap());
        assert!(cache.get(EntityKind::Child, &key("K1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");

        {
            let cache = LocalCache::open(&path).await.unwrap();
            cache.put(child("K1", SyncState::Dirty)).await.unwrap();
        }

        let reopened = LocalCache::open(&path).await.unwrap();
        let read = reopened.get(EntityKind::Child, &key("K1")).await.unwrap().unwrap();
        assert!(read.is_dirty());
    }

    #[tokio::test]
    async fn unreadable_row_reports_corruption() {
        let cache = LocalCache::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO cache_records VALUES ('child', 'K1', 'not json', 'dirty', NULL, 1, '2025-01-01T00:00:00Z')",
        )
        .execute(&cache.pool)
        .await
        .unwrap();

        let err = cache.get(EntityKind::Child, &key("K1")).await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
    }
}
