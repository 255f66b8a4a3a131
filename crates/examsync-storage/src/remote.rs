//! Remote durable store contract.
//!
//! The sync layer only ever talks to the remote through `RemoteStore`, so
//! tests can wrap or replace it and the backend can change without touching
//! the queueing logic.

use async_trait::async_trait;
use examsync_core::{Record, RecordPath, SyncError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::tree;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network or service failure; retrying later may succeed.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The remote object exists but could not be decoded.
    #[error("remote data corrupt: {0}")]
    Corrupt(String),
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        SyncError::RemoteUnavailable(e.to_string())
    }
}

/// A mutation applied to the remote tree.
///
/// Carries the whole tree after the mutation so that every subscriber can
/// extract its own path, whether it sits above or below `path`.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: RecordPath,
    pub tree: Arc<Record>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Replace the value at `path`.
    async fn set(&self, path: &RecordPath, value: Record) -> Result<(), RemoteError>;

    /// Fetch the value at `path`; `Ok(None)` when absent.
    async fn get(&self, path: &RecordPath) -> Result<Option<Record>, RemoteError>;

    /// Mint a collision-free child key under `parent`.
    async fn generate_id(&self, parent: &RecordPath) -> Result<String, RemoteError>;

    /// Delete the value at `path`. Deleting an absent path succeeds.
    async fn remove(&self, path: &RecordPath) -> Result<(), RemoteError>;

    /// Open a live feed for `path`, seeded with its current value.
    async fn subscribe(&self, path: &RecordPath) -> Result<RemoteFeed, RemoteError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), RemoteError>;
}

/// Live change feed for one path.
pub struct RemoteFeed {
    path: RecordPath,
    initial: Option<Option<Record>>,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl RemoteFeed {
    pub fn new(
        path: RecordPath,
        initial: Option<Record>,
        rx: broadcast::Receiver<ChangeEvent>,
    ) -> Self {
        RemoteFeed {
            path,
            initial: Some(initial),
            rx,
        }
    }

    pub fn path(&self) -> &RecordPath {
        &self.path
    }

    /// Next value seen at this feed's path: the initial value first, then
    /// one item per overlapping remote mutation. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Option<Record>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(ev) if ev.path.overlaps(&self.path) => {
                    return Some(tree::get_at(&ev.tree, &self.path).cloned());
                }
                Ok(_) => continue,
                // Every event carries the full tree, so skipping missed ones
                // only delays delivery until the next overlapping mutation.
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(path = %self.path, skipped = n, "remote feed lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
