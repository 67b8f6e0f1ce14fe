//! Background worker driving sync passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::connectivity::ReachableSignal;
use crate::engine::SyncEngine;
use crate::types::SyncTrigger;

/// Background sync worker.
///
/// Runs one pass at startup (after preloading offline data), one whenever
/// the connectivity monitor reports the remote reachable, and one on every
/// periodic tick. All of them go through [`SyncEngine::request_sync`].
pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    signal: ReachableSignal,
    interval: Duration,
    shutdown: Arc<Notify>,
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    join: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl WorkerHandle {
    /// Ask the worker to stop and wait for it. A pass in flight finishes first.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "sync worker ended abnormally");
        }
    }
}

impl SyncWorker {
    pub fn new(engine: Arc<SyncEngine>, signal: ReachableSignal, interval: Duration) -> Self {
        Self {
            engine,
            signal,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Spawn the worker loop.
    pub fn start(self) -> WorkerHandle {
        let shutdown = self.shutdown.clone();
        let join = tokio::spawn(self.run());
        WorkerHandle { join, shutdown }
    }

    async fn run(self) {
        let Self {
            engine,
            mut signal,
            interval,
            shutdown,
        } = self;
        tracing::info!(?interval, "sync worker started");

        match engine.preload().await {
            Ok(loaded) => tracing::debug!(loaded, "startup preload done"),
            Err(e) => tracing::info!(error = %e, "startup preload skipped; remote unavailable"),
        }
        Self::sync(&engine, "startup").await;

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::info!("sync worker received shutdown signal");
                    break;
                }
                Some(()) = signal.recv() => {
                    Self::sync(&engine, "reachable").await;
                }
                _ = ticker.tick() => {
                    Self::sync(&engine, "interval").await;
                }
            }
        }

        tracing::info!("sync worker stopped");
    }

    async fn sync(engine: &SyncEngine, trigger: &'static str) {
        match engine.request_sync().await {
            SyncTrigger::Ran(report) if report.is_clean() => {
                tracing::debug!(trigger, pushed = report.pushed.len(), "sync pass clean");
            }
            SyncTrigger::Ran(report) => {
                tracing::warn!(
                    trigger,
                    failed = report.failed.len(),
                    errors = report.errors.len(),
                    "sync pass left work pending"
                );
            }
            SyncTrigger::Coalesced => tracing::debug!(trigger, "sync request coalesced"),
        }
    }
}
