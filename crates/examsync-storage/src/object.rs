//! `RemoteStore` backed by a single JSON object in an OpenDAL operator.
//!
//! The whole record tree lives at `object_key`. Mutations are
//! read-modify-write under an async lock, so writers within one process
//! never lose each other's updates. Change notifications fan out in-process
//! over a broadcast channel.

use async_trait::async_trait;
use examsync_core::{Record, RecordPath};
use opendal::{ErrorKind, Operator};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::remote::{ChangeEvent, RemoteError, RemoteFeed, RemoteStore};
use crate::tree;

const CHANGE_BUFFER: usize = 256;

pub struct OperatorStore {
    op: Operator,
    key: String,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl OperatorStore {
    pub fn new(op: Operator, key: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        OperatorStore {
            op,
            key: key.into(),
            write_lock: Mutex::new(()),
            changes,
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    async fn load(&self) -> Result<Record, RemoteError> {
        match self.op.read(&self.key).await {
            Ok(buf) => serde_json::from_slice(&buf.to_vec())
                .map_err(|e| RemoteError::Corrupt(format!("{}: {e}", self.key))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(tree::empty()),
            Err(e) => Err(RemoteError::Unavailable(format!("reading {}: {e}", self.key))),
        }
    }

    async fn store(&self, tree: &Record) -> Result<(), RemoteError> {
        let bytes = serde_json::to_vec(tree)
            .map_err(|e| RemoteError::Corrupt(format!("serializing tree: {e}")))?;
        self.op
            .write(&self.key, bytes)
            .await
            .map(|_| ())
            .map_err(|e| RemoteError::Unavailable(format!("writing {}: {e}", self.key)))
    }

    /// Apply `mutate` to the stored tree and notify subscribers.
    async fn mutate<F>(&self, path: &RecordPath, mutate: F) -> Result<(), RemoteError>
    where
        F: FnOnce(&mut Record) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut tree = self.load().await?;
        mutate(&mut tree);
        self.store(&tree).await?;
        // No receivers is fine: nobody is subscribed.
        let _ = self.changes.send(ChangeEvent {
            path: path.clone(),
            tree: Arc::new(tree),
        });
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for OperatorStore {
    async fn set(&self, path: &RecordPath, value: Record) -> Result<(), RemoteError> {
        self.mutate(path, |tree| tree::set_at(tree, path, value))
            .await?;
        debug!(path = %path, "remote set");
        Ok(())
    }

    async fn get(&self, path: &RecordPath) -> Result<Option<Record>, RemoteError> {
        let tree = self.load().await?;
        Ok(tree::get_at(&tree, path).cloned())
    }

    async fn generate_id(&self, parent: &RecordPath) -> Result<String, RemoteError> {
        // v7 keys sort by creation time, like the push IDs clients expect.
        let id = uuid::Uuid::now_v7().simple().to_string();
        debug!(parent = %parent, id = %id, "remote id minted");
        Ok(id)
    }

    async fn remove(&self, path: &RecordPath) -> Result<(), RemoteError> {
        self.mutate(path, |tree| {
            tree::remove_at(tree, path);
        })
        .await?;
        debug!(path = %path, "remote remove");
        Ok(())
    }

    async fn subscribe(&self, path: &RecordPath) -> Result<RemoteFeed, RemoteError> {
        // Subscribe before reading so no mutation slips between the two.
        let rx = self.changes.subscribe();
        let initial = self.get(path).await?;
        Ok(RemoteFeed::new(path.clone(), initial, rx))
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        crate::health::check_health(&self.op)
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))
    }
}
