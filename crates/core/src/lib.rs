//! `guardian-core`: entity codec for offline-first sync.
//!
//! Pure building blocks (no I/O): identity keys, the canonical key-extraction
//! precedence per entity kind, typed payload views, and the deterministic
//! merge used whenever a local and a remote copy of an entity meet.

pub mod codec;
pub mod entity;
pub mod error;
pub mod id;

pub use codec::{KeyResolution, assign_key, extract_key, merge, merge_history, resolve_key};
pub use entity::{Child, HistoryRecord, Malnutrition, SyncEntity, User};
pub use error::{CodecError, CodecResult};
pub use id::{EntityKind, IdentityKey};
