//! `guardian-sync`: headless sync daemon.
//!
//! Opens the local cache, watches connectivity and keeps the cache and the
//! remote in step until interrupted.

use std::sync::Arc;

use anyhow::Context;
use guardian_offline::{
    ConnectivityMonitor, HttpTransport, LocalCache, RemoteTransport, SyncConfig, SyncEngine,
    SyncStatus, SyncWorker, spawn_probe,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    guardian_observability::init();

    let config = SyncConfig::from_env().context("invalid sync configuration")?;
    let cache_path = config.resolve_cache_path()?;
    tracing::info!(api_url = %config.api_url, cache = %cache_path.display(), "starting guardian-sync");

    let cache = LocalCache::open(&cache_path)
        .await
        .with_context(|| format!("failed to open cache at {}", cache_path.display()))?;
    let remote: Arc<dyn RemoteTransport> = Arc::new(
        HttpTransport::new(&config.api_url, config.auth_token.clone(), config.request_timeout())
            .context("invalid remote endpoint")?,
    );
    let engine = Arc::new(SyncEngine::new(cache, remote.clone(), config.engine_options()));

    let mut status = engine.status();
    let status_log = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            match &*status.borrow_and_update() {
                SyncStatus::Completed(summary) => tracing::info!(?summary, "sync completed"),
                SyncStatus::StorageFailing { consecutive } => {
                    tracing::error!(consecutive, "local cache writes failing")
                }
                other => tracing::debug!(status = ?other, "sync status"),
            }
        }
    });

    let (monitor, signal) = ConnectivityMonitor::spawn(config.debounce());
    let probe = spawn_probe(monitor, remote, config.probe_interval(), config.request_timeout());
    let worker = SyncWorker::new(engine.clone(), signal, config.sync_interval()).start();

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    probe.abort();
    worker.shutdown().await;
    status_log.abort();

    let pending = engine.pending_writes().await?;
    if pending > 0 {
        tracing::warn!(pending, "exiting with unsynced local writes; they will be pushed next run");
    }
    Ok(())
}
