//! Connectivity signal: an injectable online/offline switch.
//!
//! The store never inspects the network itself. Something outside it
//! (the [`HealthProbe`], a platform hook, or a test) flips a
//! [`Connectivity`] handle, and the store reacts to the edges.

use examsync_storage::RemoteStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

/// Current state plus a count of Offline -> Online edges, so a listener
/// that wakes late can still tell a reconnect happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub state: ConnectivityState,
    pub reconnects: u64,
}

/// Sending side of the connectivity signal. Cheap to clone.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<Link>>,
}

impl Connectivity {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _) = watch::channel(Link {
            state: initial,
            reconnects: 0,
        });
        Connectivity { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<Link> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> ConnectivityState {
        self.tx.borrow().state
    }

    /// "Became reachable". Returns true if this was an edge.
    pub fn set_online(&self) -> bool {
        self.tx.send_if_modified(|link| {
            if link.state == ConnectivityState::Online {
                return false;
            }
            link.state = ConnectivityState::Online;
            link.reconnects += 1;
            true
        })
    }

    /// "Became unreachable". Returns true if this was an edge.
    pub fn set_offline(&self) -> bool {
        self.tx.send_if_modified(|link| {
            if link.state == ConnectivityState::Offline {
                return false;
            }
            link.state = ConnectivityState::Offline;
            true
        })
    }
}

/// Polls the remote store and drives a [`Connectivity`] from the result.
pub struct HealthProbe {
    remote: Arc<dyn RemoteStore>,
    connectivity: Connectivity,
    interval: Duration,
}

impl HealthProbe {
    pub fn new(remote: Arc<dyn RemoteStore>, connectivity: Connectivity, interval: Duration) -> Self {
        HealthProbe {
            remote,
            connectivity,
            interval,
        }
    }

    /// Probe once and update the signal. Returns the observed state.
    pub async fn probe(&self) -> ConnectivityState {
        match self.remote.ping().await {
            Ok(()) => {
                if self.connectivity.set_online() {
                    info!("remote reachable: online");
                }
                ConnectivityState::Online
            }
            Err(e) => {
                if self.connectivity.set_offline() {
                    warn!(error = %e, "remote unreachable: offline");
                }
                ConnectivityState::Offline
            }
        }
    }

    /// Probe forever on a fixed interval.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.probe().await;
            }
        })
    }
}
