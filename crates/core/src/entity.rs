//! Typed views over synchronizable payloads.
//!
//! The sync engine itself works on raw JSON payloads so fields it does not
//! know survive a round trip. These structs are the typed shape the rest of
//! the application builds and reads; unknown fields are kept in `extra`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec;
use crate::error::{CodecError, CodecResult};
use crate::id::{EntityKind, IdentityKey};

/// An entity that crosses the local/remote boundary.
pub trait SyncEntity: Serialize + DeserializeOwned {
    /// Which cache container the entity lives in.
    const KIND: EntityKind;

    /// Identity key by canonical precedence, if the entity has one yet.
    fn identity_key(&self) -> Option<IdentityKey> {
        self.to_payload()
            .ok()
            .and_then(|payload| codec::extract_key(Self::KIND, &payload))
    }

    fn to_payload(&self) -> CodecResult<Value> {
        serde_json::to_value(self).map_err(|e| CodecError::invalid_payload(e.to_string()))
    }

    fn from_payload(payload: &Value) -> CodecResult<Self> {
        Self::deserialize(payload).map_err(|e| CodecError::invalid_payload(e.to_string()))
    }
}

/// Malnutrition screening notes on a child.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Malnutrition {
    #[serde(rename = "hasSigns", default, skip_serializing_if = "Option::is_none")]
    pub has_signs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// One growth measurement. Immutable once created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub illnesses: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malnutrition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HistoryRecord {
    /// New measurement with a fresh time-based id, taken now.
    pub fn new(height: f64, weight: f64) -> Self {
        Self {
            id: Some(IdentityKey::synthesize(EntityKind::HistoryRecord).into()),
            height: Some(height),
            weight: Some(weight),
            date: Some(Utc::now()),
            ..Self::default()
        }
    }
}

impl SyncEntity for HistoryRecord {
    const KIND: EntityKind = EntityKind::HistoryRecord;
}

/// A registered child.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Child {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "dateOfBirth", default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardian: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub illnesses: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malnutrition: Option<Malnutrition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SyncEntity for Child {
    const KIND: EntityKind = EntityKind::Child;
}

/// An application user. Holds a credential hash, never a plaintext secret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "nationalId", default, skip_serializing_if = "Option::is_none")]
    pub national_id: Option<String>,
    #[serde(rename = "fullName", default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "password", default, skip_serializing_if = "Option::is_none")]
    pub credential_hash: Option<String>,
    #[serde(rename = "isAdult", default, skip_serializing_if = "Option::is_none")]
    pub is_adult: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SyncEntity for User {
    const KIND: EntityKind = EntityKind::User;
}
