//! Codec error model.

use thiserror::Error;

/// Result type used by the entity codec.
pub type CodecResult<T> = Result<T, CodecError>;

/// Entity codec error.
///
/// Merging never fails; these only come from staging payloads of the wrong
/// shape or parsing identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A payload was not a JSON object.
    #[error("payload for {kind} must be a JSON object")]
    NotAnObject { kind: &'static str },

    /// An identity key was empty.
    #[error("identity key must not be empty")]
    EmptyKey,

    /// An entity kind name was not recognised.
    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    /// A typed view could not be built from a payload.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl CodecError {
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }
}
