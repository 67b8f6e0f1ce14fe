//! Identity-key extraction and payload merging.
//!
//! This is the one place that decides which field of a payload is its
//! identity and how two copies of the same entity combine. Every crossing of
//! the local/remote boundary goes through these functions so key handling is
//! never re-derived per call site.
//!
//! ## Key precedence
//!
//! Each [`EntityKind`] carries an ordered list of candidate fields (see
//! [`EntityKind::key_fields`]). The first candidate holding a usable value
//! wins. Usable values are non-blank strings, numbers (decimal text) and
//! `{ "$oid": "..." }` objects as emitted by document stores.
//!
//! ## Merge
//!
//! - Scalar fields: last writer wins, judged by the `updated_at` timestamp of
//!   each side. A side without a timestamp is older than any side with one;
//!   ties go to the local side.
//! - `history` (children only): union by record identity, remote order first,
//!   then local-only records in local order. Never shrinks.
//! - `null` clears a field only when it comes from a winning side that
//!   carries a timestamp, i.e. a deliberate write. An unstamped `null` counts
//!   as absent and never erases a value from the other side.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{CodecError, CodecResult};
use crate::id::{EntityKind, IdentityKey};

/// Payload field carrying the wall-clock time of the last local write.
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Append-only history field on child payloads.
pub const HISTORY_FIELD: &str = "history";

/// Outcome of resolving the identity key of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolution {
    /// The key was read from `field`.
    Found {
        key: IdentityKey,
        field: &'static str,
    },
    /// No candidate field held a usable value; a fresh key was generated.
    Synthesized(IdentityKey),
}

impl KeyResolution {
    pub fn key(&self) -> &IdentityKey {
        match self {
            KeyResolution::Found { key, .. } => key,
            KeyResolution::Synthesized(key) => key,
        }
    }

    pub fn into_key(self) -> IdentityKey {
        match self {
            KeyResolution::Found { key, .. } => key,
            KeyResolution::Synthesized(key) => key,
        }
    }

    pub fn was_synthesized(&self) -> bool {
        matches!(self, KeyResolution::Synthesized(_))
    }
}

fn key_from_value(value: &Value) -> Option<IdentityKey> {
    match value {
        Value::String(s) => IdentityKey::parse(s),
        Value::Number(n) => IdentityKey::parse(&n.to_string()),
        Value::Object(map) => map
            .get("$oid")
            .and_then(Value::as_str)
            .and_then(IdentityKey::parse),
        _ => None,
    }
}

fn find_key(kind: EntityKind, payload: &Value) -> Option<(IdentityKey, &'static str)> {
    let obj = payload.as_object()?;
    kind.key_fields()
        .iter()
        .find_map(|field| obj.get(*field).and_then(key_from_value).map(|key| (key, *field)))
}

/// Read the identity key of `payload` by candidate precedence.
pub fn extract_key(kind: EntityKind, payload: &Value) -> Option<IdentityKey> {
    find_key(kind, payload).map(|(key, _)| key)
}

/// Read the identity key of `payload`, synthesizing one if none is present.
pub fn resolve_key(kind: EntityKind, payload: &Value) -> KeyResolution {
    match find_key(kind, payload) {
        Some((key, field)) => KeyResolution::Found { key, field },
        None => KeyResolution::Synthesized(IdentityKey::synthesize(kind)),
    }
}

/// Resolve the key of `payload` and write it back to the primary key field.
///
/// After this call [`extract_key`] on the payload returns the same key no
/// matter which candidate it was originally found under.
pub fn assign_key(kind: EntityKind, payload: &mut Value) -> CodecResult<IdentityKey> {
    let resolution = resolve_key(kind, payload);
    let obj = payload
        .as_object_mut()
        .ok_or(CodecError::NotAnObject { kind: kind.as_str() })?;
    let key = resolution.into_key();
    obj.insert(
        kind.primary_key_field().to_string(),
        Value::String(key.as_str().to_string()),
    );
    Ok(key)
}

/// Wall-clock timestamp of the last write recorded in `payload`, if any.
///
/// Accepts RFC 3339 strings and epoch milliseconds.
pub fn updated_at(payload: &Value) -> Option<DateTime<Utc>> {
    match payload.get(UPDATED_AT_FIELD)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Record `at` as the time of the last write. No-op for non-object payloads.
pub fn stamp_updated_at(payload: &mut Value, at: DateTime<Utc>) {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
}

fn local_takes_precedence(local: &Value, remote: &Value) -> bool {
    match (updated_at(local), updated_at(remote)) {
        (Some(l), Some(r)) => l >= r,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => true,
    }
}

/// Merge two payloads of the same identity into one.
///
/// Pure and deterministic: identical inputs always give identical output, so
/// retried passes converge on the same result.
pub fn merge(kind: EntityKind, local: &Value, remote: &Value) -> Value {
    let local_wins = local_takes_precedence(local, remote);

    let (Some(l), Some(r)) = (local.as_object(), remote.as_object()) else {
        return if local_wins { local.clone() } else { remote.clone() };
    };

    let (winner, loser) = if local_wins { (l, r) } else { (r, l) };
    let clears = updated_at(if local_wins { local } else { remote }).is_some();
    let mut merged: Map<String, Value> = loser.clone();
    for (field, value) in winner {
        if value.is_null() && !clears && merged.get(field).is_some_and(|v| !v.is_null()) {
            continue;
        }
        merged.insert(field.clone(), value.clone());
    }

    if kind == EntityKind::Child && (l.contains_key(HISTORY_FIELD) || r.contains_key(HISTORY_FIELD)) {
        let history = merge_history(history_slice(local), history_slice(remote));
        merged.insert(HISTORY_FIELD.to_string(), Value::Array(history));
    }

    Value::Object(merged)
}

/// Whether applying `edit` over `base` would change nothing but the write
/// timestamp. Fields `base` has that `edit` omits are not compared.
pub fn changes_nothing(edit: &Value, base: &Value) -> bool {
    let (Some(edit), Some(base)) = (edit.as_object(), base.as_object()) else {
        return edit == base;
    };
    edit.iter()
        .filter(|(field, _)| field.as_str() != UPDATED_AT_FIELD)
        .all(|(field, value)| match base.get(field) {
            Some(existing) => existing == value,
            None => value.is_null(),
        })
}

/// The history records of a child payload; empty when absent or malformed.
pub fn history_slice(payload: &Value) -> &[Value] {
    payload
        .get(HISTORY_FIELD)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Identity used to deduplicate history records.
///
/// Records without any id fall back to their JSON text. `serde_json` keeps
/// object keys sorted, so equal records give equal text.
pub fn record_identity(record: &Value) -> String {
    extract_key(EntityKind::HistoryRecord, record)
        .map(String::from)
        .unwrap_or_else(|| record.to_string())
}

/// Order-preserving union of two histories by record identity.
pub fn merge_history(local: &[Value], remote: &[Value]) -> Vec<Value> {
    let mut seen = HashSet::with_capacity(local.len() + remote.len());
    let mut merged = Vec::with_capacity(local.len().max(remote.len()));
    for record in remote.iter().chain(local.iter()) {
        if seen.insert(record_identity(record)) {
            merged.push(record.clone());
        }
    }
    merged
}

/// Whether `history` already holds a record with identity `key`.
pub fn history_contains(history: &[Value], key: &IdentityKey) -> bool {
    history.iter().any(|r| record_identity(r) == key.as_str())
}

/// Append `record` to the history of a child payload unless a record with the
/// same identity is already there. Returns whether the payload changed.
pub fn append_history(payload: &mut Value, record: &Value) -> bool {
    let Some(obj) = payload.as_object_mut() else {
        return false;
    };
    let identity = record_identity(record);
    let history = obj
        .entry(HISTORY_FIELD)
        .or_insert_with(|| Value::Array(Vec::new()));
    if !history.is_array() {
        *history = Value::Array(Vec::new());
    }
    let Some(records) = history.as_array_mut() else {
        return false;
    };
    if records.iter().any(|r| record_identity(r) == identity) {
        return false;
    }
    records.push(record.clone());
    true
}
