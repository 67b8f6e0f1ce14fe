//! Identity keys and entity kinds shared across the sync layers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;

/// Synchronizable entity types.
///
/// Each kind maps to one keyed container in the local cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Child,
    HistoryRecord,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::User, EntityKind::Child, EntityKind::HistoryRecord];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Child => "child",
            EntityKind::HistoryRecord => "history_record",
        }
    }

    /// Candidate payload fields holding the identity key, highest precedence first.
    ///
    /// Order: client-generated id, server-assigned id, legacy alias.
    pub fn key_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::User => &["nationalId", "_id", "id"],
            EntityKind::Child => &["child_id", "_id", "id"],
            EntityKind::HistoryRecord => &["id", "record_id", "_id"],
        }
    }

    /// The field a synthesized or normalized key is written back to.
    pub fn primary_key_field(&self) -> &'static str {
        self.key_fields()[0]
    }

    fn key_prefix(&self) -> &'static str {
        match self {
            EntityKind::User => "NID",
            EntityKind::Child => "CHILD",
            EntityKind::HistoryRecord => "RECORD",
        }
    }
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(EntityKind::User),
            "child" => Ok(EntityKind::Child),
            "history_record" => Ok(EntityKind::HistoryRecord),
            other => Err(CodecError::UnknownKind(other.to_string())),
        }
    }
}

/// Stable identity of one logical entity across local and remote copies.
///
/// Assigned by whoever creates the entity and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Build a key from raw text, trimming surrounding whitespace.
    ///
    /// Returns `None` for empty input.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Synthesize a fresh time-ordered key for `kind`.
    ///
    /// Uses UUIDv7 so keys generated on one device sort by creation time.
    pub fn synthesize(kind: EntityKind) -> Self {
        Self(format!("{}-{}", kind.key_prefix(), Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdentityKey {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(CodecError::EmptyKey)
    }
}

impl From<IdentityKey> for String {
    fn from(value: IdentityKey) -> Self {
        value.0
    }
}

impl AsRef<str> for IdentityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
