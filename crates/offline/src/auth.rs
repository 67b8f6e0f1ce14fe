//! Offline login against preloaded users.

use std::sync::Arc;

use guardian_core::{EntityKind, IdentityKey, SyncEntity, User};
use thiserror::Error;

use crate::engine::SyncEngine;
use crate::error::SyncError;

/// Checks a presented secret against a stored credential hash.
///
/// Hashing is the application's concern; the sync layer only stores and
/// forwards the hash.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, secret: &str, credential_hash: &str) -> bool;
}

impl<F> CredentialVerifier for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn verify(&self, secret: &str, credential_hash: &str) -> bool {
        self(secret, credential_hash)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown user")]
    UnknownUser,

    #[error("user has no stored credential")]
    NoCredential,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Authenticates users from the local cache, falling back to the remote
/// when the user has not been preloaded and the remote is reachable.
pub struct OfflineAuthenticator<V> {
    engine: Arc<SyncEngine>,
    verifier: V,
}

impl<V: CredentialVerifier> OfflineAuthenticator<V> {
    pub fn new(engine: Arc<SyncEngine>, verifier: V) -> Self {
        Self { engine, verifier }
    }

    pub async fn authenticate(&self, national_id: &str, secret: &str) -> Result<User, AuthError> {
        let key = IdentityKey::parse(national_id).ok_or(AuthError::UnknownUser)?;
        let payload = self
            .engine
            .get(EntityKind::User, &key)
            .await?
            .ok_or(AuthError::UnknownUser)?;
        let user = User::from_payload(&payload).map_err(SyncError::from)?;

        let hash = user.credential_hash.as_deref().ok_or(AuthError::NoCredential)?;
        if !self.verifier.verify(secret, hash) {
            tracing::debug!(user = %key, "offline login rejected");
            return Err(AuthError::InvalidCredentials);
        }
        Ok(user)
    }
}
