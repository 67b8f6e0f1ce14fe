//! `guardian-offline`
//!
//! **Responsibility:** offline-first persistence and synchronization for the
//! child-growth client.
//!
//! This crate provides:
//! - A durable local cache of users, children and growth history
//! - Staging of local writes while the remote is unreachable
//! - Debounced connectivity detection
//! - Push/pull sync passes that reconcile the cache with the remote
//! - Offline login against preloaded users
//!
//! The remote stays the shared authority; the cache is the source every
//! read is served from.

pub mod auth;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod transport;
pub mod types;
pub mod worker;

pub use auth::{AuthError, CredentialVerifier, OfflineAuthenticator};
pub use cache::LocalCache;
pub use config::{ConfigError, SyncConfig};
pub use connectivity::{ConnectivityMonitor, NetworkState, ReachableSignal, spawn_probe};
pub use engine::{EngineOptions, SyncEngine};
pub use error::{CacheError, SyncError};
pub use transport::{HttpTransport, InMemoryRemote, RemoteTransport, TransportError};
pub use types::{CacheRecord, SyncReport, SyncState, SyncStatus, SyncSummary, SyncTrigger};
pub use worker::{SyncWorker, WorkerHandle};
