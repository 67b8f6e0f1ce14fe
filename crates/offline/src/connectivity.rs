//! Connectivity detection.
//!
//! Raw network-state reports go in through a [`ConnectivityMonitor`]; one
//! debounced "remote became reachable" signal comes out of the paired
//! [`ReachableSignal`]. No shared online flag exists to poll.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::transport::RemoteTransport;

/// Raw network state as reported by the platform or a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkState {
    Online,
    Offline,
}

/// Reporting handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    events: mpsc::UnboundedSender<NetworkState>,
}

/// Single-consumer receiver of debounced reachability signals.
#[derive(Debug)]
pub struct ReachableSignal {
    rx: mpsc::Receiver<()>,
}

impl ReachableSignal {
    /// Wait for the next signal. `None` once the monitor has stopped.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Take a pending signal without waiting.
    pub fn try_recv(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

impl ConnectivityMonitor {
    /// Start the debouncing task.
    ///
    /// The monitor assumes the remote is unreachable until told otherwise, so
    /// the first `Online` report produces a signal.
    pub fn spawn(debounce: Duration) -> (Self, ReachableSignal) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // Capacity one: a signal that is still unconsumed absorbs new ones.
        let (signal_tx, signal_rx) = mpsc::channel(1);
        tokio::spawn(debounce_loop(events_rx, signal_tx, debounce));
        (Self { events: events_tx }, ReachableSignal { rx: signal_rx })
    }

    /// Report a network state change. Returns `false` once the monitor has
    /// stopped (its signal receiver was dropped).
    pub fn report(&self, state: NetworkState) -> bool {
        self.events.send(state).is_ok()
    }

    pub fn report_online(&self) -> bool {
        self.report(NetworkState::Online)
    }

    pub fn report_offline(&self) -> bool {
        self.report(NetworkState::Offline)
    }
}

async fn debounce_loop(
    mut events: mpsc::UnboundedReceiver<NetworkState>,
    signal: mpsc::Sender<()>,
    window: Duration,
) {
    let mut last = NetworkState::Offline;

    while let Some(state) = events.recv().await {
        let became_reachable = last == NetworkState::Offline && state == NetworkState::Online;
        last = state;
        if !became_reachable {
            continue;
        }

        let deadline = Instant::now() + window;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                next = events.recv() => match next {
                    Some(state) => last = state,
                    None => return,
                },
            }
        }

        if last != NetworkState::Online {
            tracing::debug!("connectivity flapped back offline inside debounce window");
            continue;
        }

        match signal.try_send(()) {
            Ok(()) => tracing::debug!("remote reachable"),
            Err(TrySendError::Full(())) => tracing::debug!("reachable signal already pending"),
            Err(TrySendError::Closed(())) => return,
        }
    }
}

/// Periodically probe the remote and feed the result to `monitor`.
///
/// Stops when the monitor stops.
pub fn spawn_probe(
    monitor: ConnectivityMonitor,
    remote: Arc<dyn RemoteTransport>,
    every: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let state = match tokio::time::timeout(timeout, remote.probe()).await {
                Ok(Ok(())) => NetworkState::Online,
                Ok(Err(e)) => {
                    tracing::trace!(error = %e, "health probe failed");
                    NetworkState::Offline
                }
                Err(_) => NetworkState::Offline,
            };
            if !monitor.report(state) {
                tracing::debug!("connectivity monitor stopped; ending probe");
                break;
            }
        }
    })
}
