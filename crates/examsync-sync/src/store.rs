//! `SyncStore`: the offline-tolerant record store consumers talk to.
//!
//! While online, mutations go straight to the remote store and are mirrored
//! into the local snapshot. While offline (or when the remote call fails)
//! they land in the snapshot and the pending queue, and are replayed in
//! enqueue order by the next drain.
//!
//! Local state lives behind one `std::sync::Mutex` that is never held
//! across an `.await`; remote calls hold no local lock.

use chrono::Utc;
use examsync_core::config::SyncConfig;
use examsync_core::{Ack, OpKind, Record, RecordPath, SyncError, SyncResult};
use examsync_storage::{LocalCache, RemoteStore};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connectivity::{ConnectivityState, Link};
use crate::queue::PendingOperation;
use crate::state::{DeadLetter, LocalState};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Failed replays before an operation is dead-lettered
    pub max_retries: u32,
    /// Prefix of IDs minted for records created offline
    pub provisional_prefix: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            max_retries: 3,
            provisional_prefix: "local:".into(),
        }
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(cfg: &SyncConfig) -> Self {
        SyncOptions {
            max_retries: cfg.max_retries.max(1),
            provisional_prefix: cfg.provisional_prefix.clone(),
        }
    }
}

/// Result of [`SyncStore::append`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Appended {
    /// Server ID when synced, provisional ID when queued
    pub id: String,
    pub ack: Ack,
}

/// Summary of one `drain_pending` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    /// Replay passes run by this call; 0 when another drain absorbed it
    pub passes: u32,
    pub replayed: usize,
    /// Operations still queued after the last pass
    pub requeued: usize,
    /// Operations dead-lettered by this call
    pub failed: Vec<DeadLetter>,
}

impl DrainReport {
    /// True when a drain was already running and picked this trigger up.
    pub fn coalesced(&self) -> bool {
        self.passes == 0
    }

    fn absorb(&mut self, pass: DrainReport) {
        self.passes += pass.passes;
        self.replayed += pass.replayed;
        self.requeued = pass.requeued;
        self.failed.extend(pass.failed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub online: bool,
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub local_cache_bytes: u64,
    pub last_sync: Option<chrono::DateTime<Utc>>,
}

/// Handle for a live subscription. Dropping it detaches the feed.
pub struct Subscription {
    path: RecordPath,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    fn inactive(path: RecordPath) -> Self {
        Subscription { path, task: None }
    }

    pub fn path(&self) -> &RecordPath {
        &self.path
    }

    /// False for handles returned while offline, and once the feed ended.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Detach the feed. A no-op if it already ended.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

enum Replayed {
    Done,
    Added {
        provisional: String,
        server: String,
        value: Record,
    },
}

struct Inner {
    remote: Arc<dyn RemoteStore>,
    local: Mutex<LocalState>,
    link: watch::Receiver<Link>,
    options: SyncOptions,
    provisional_seq: AtomicU64,
    drain_lock: tokio::sync::Mutex<()>,
    drain_requested: AtomicBool,
}

/// Offline-tolerant record store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncStore {
    inner: Arc<Inner>,
}

impl SyncStore {
    /// Load local state from `cache` and attach to `remote`.
    ///
    /// Reconnect-triggered drains only run once
    /// [`spawn_reconnect_listener`](Self::spawn_reconnect_listener) is called.
    pub fn open(
        remote: Arc<dyn RemoteStore>,
        cache: Box<dyn LocalCache>,
        link: watch::Receiver<Link>,
        options: SyncOptions,
    ) -> SyncResult<Self> {
        let local = LocalState::load(cache)?;
        info!(
            pending = local.pending_len(),
            failed = local.failed().len(),
            "sync store opened"
        );
        Ok(SyncStore {
            inner: Arc::new(Inner {
                remote,
                local: Mutex::new(local),
                link,
                options,
                provisional_seq: AtomicU64::new(0),
                drain_lock: tokio::sync::Mutex::new(()),
                drain_requested: AtomicBool::new(false),
            }),
        })
    }

    pub fn is_online(&self) -> bool {
        self.inner.link.borrow().state == ConnectivityState::Online
    }

    /// Store `record` at `path`, replacing any subtree there.
    pub async fn write(&self, path: &RecordPath, record: Record) -> SyncResult<Ack> {
        let online = self.is_online();
        let behind = online && self.queue_touches(path);
        if online && !behind {
            let stamped = stamp_save(record.clone());
            match self.inner.remote.set(path, stamped.clone()).await {
                Ok(()) => {
                    self.local().put(path, stamped, None)?;
                    debug!(path = %path, "write synced");
                    return Ok(Ack::Synced);
                }
                Err(e) => warn!(path = %path, error = %e, "remote write failed, queueing"),
            }
        }

        let op = PendingOperation::save(path.clone(), record.clone());
        self.local().put(path, record, Some(op))?;
        if behind {
            self.request_follow_up();
        }
        debug!(path = %path, "write queued");
        Ok(Ack::Queued)
    }

    /// Create a child of `parent` under a fresh key.
    pub async fn append(&self, parent: &RecordPath, record: Record) -> SyncResult<Appended> {
        let online = self.is_online();
        let behind = online && self.queue_covers(parent);
        if online && !behind {
            match self.append_remote(parent, record.clone()).await {
                Ok((id, value)) => {
                    self.local().put(&parent.child(&id)?, value, None)?;
                    debug!(path = %parent, id = %id, "append synced");
                    return Ok(Appended { id, ack: Ack::Synced });
                }
                Err(e) => warn!(path = %parent, error = %e, "remote append failed, queueing"),
            }
        }

        let provisional = self.provisional_id();
        let target = parent.child(&provisional)?;
        let mut local_value = record.clone();
        if let Some(obj) = local_value.as_object_mut() {
            obj.insert("id".into(), Value::String(provisional.clone()));
        }
        let op = PendingOperation::add(parent.clone(), provisional.clone(), record);
        self.local().put(&target, local_value, Some(op))?;
        if behind {
            self.request_follow_up();
        }
        debug!(path = %parent, id = %provisional, "append queued");
        Ok(Appended {
            id: provisional,
            ack: Ack::Queued,
        })
    }

    /// Current value at `path`. Never fails: remote errors fall back to the
    /// local snapshot.
    pub async fn read(&self, path: &RecordPath) -> Option<Record> {
        if self.is_online() && !self.queue_touches(path) {
            match self.inner.remote.get(path).await {
                Ok(Some(value)) => {
                    self.mirror(path, Some(value.clone()));
                    return Some(value);
                }
                Ok(None) => debug!(path = %path, "absent remotely, using local snapshot"),
                Err(e) => warn!(path = %path, error = %e, "remote read failed, using local snapshot"),
            }
        }
        self.local().get(path)
    }

    /// Delete the value at `path`.
    pub async fn remove(&self, path: &RecordPath) -> SyncResult<Ack> {
        let online = self.is_online();
        let behind = online && self.queue_touches(path);
        if online && !behind {
            match self.inner.remote.remove(path).await {
                Ok(()) => {
                    self.local().delete(path, None)?;
                    debug!(path = %path, "remove synced");
                    return Ok(Ack::Synced);
                }
                Err(e) => warn!(path = %path, error = %e, "remote remove failed, queueing"),
            }
        }

        self.local()
            .delete(path, Some(PendingOperation::delete(path.clone())))?;
        if behind {
            self.request_follow_up();
        }
        debug!(path = %path, "remove queued");
        Ok(Ack::Queued)
    }

    /// Watch `path` on the remote store. `on_change` sees the current value
    /// first, then every remote mutation that overlaps `path`.
    ///
    /// Offline, nothing is registered and the handle is inactive.
    pub async fn subscribe<F>(&self, path: &RecordPath, mut on_change: F) -> Subscription
    where
        F: FnMut(Option<Record>) + Send + 'static,
    {
        if !self.is_online() {
            debug!(path = %path, "offline, subscription not registered");
            return Subscription::inactive(path.clone());
        }
        let mut feed = match self.inner.remote.subscribe(path).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!(path = %path, error = %e, "remote subscribe failed");
                return Subscription::inactive(path.clone());
            }
        };

        let store = self.clone();
        let feed_path = path.clone();
        let task = tokio::spawn(async move {
            while let Some(value) = feed.next().await {
                store.mirror(&feed_path, value.clone());
                on_change(value);
            }
            debug!(path = %feed_path, "remote feed closed");
        });
        Subscription {
            path: path.clone(),
            task: Some(task),
        }
    }

    /// Replay queued operations against the remote store.
    ///
    /// Drains never overlap. A call made while one is running marks a
    /// follow-up pass for the running drain and returns a report with
    /// `passes == 0`.
    pub async fn drain_pending(&self) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        self.inner.drain_requested.store(true, Ordering::SeqCst);
        loop {
            let Ok(guard) = self.inner.drain_lock.try_lock() else {
                debug!("drain already running, trigger coalesced");
                return Ok(report);
            };
            while self.inner.drain_requested.swap(false, Ordering::SeqCst) {
                report.absorb(self.drain_pass().await?);
            }
            drop(guard);
            // A trigger may have landed between the last check and the unlock.
            if !self.inner.drain_requested.load(Ordering::SeqCst) {
                return Ok(report);
            }
        }
    }

    pub fn stats(&self) -> StorageStats {
        let online = self.is_online();
        let local = self.local();
        StorageStats {
            online,
            pending_operations: local.pending_len(),
            failed_operations: local.failed().len(),
            local_cache_bytes: local.used_bytes(),
            last_sync: local.last_sync(),
        }
    }

    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.local().pending().cloned().collect()
    }

    pub fn failed_operations(&self) -> Vec<DeadLetter> {
        self.local().failed().to_vec()
    }

    /// Server ID a provisional ID was remapped to, if it has synced.
    pub fn resolve_id(&self, provisional: &str) -> Option<String> {
        self.local().resolve_id(provisional).map(str::to_string)
    }

    pub fn flush(&self) -> SyncResult<()> {
        self.local().flush()
    }

    /// Run one drain for every Offline -> Online edge of the link.
    pub fn spawn_reconnect_listener(&self) -> JoinHandle<()> {
        let store = self.clone();
        let mut rx = self.inner.link.clone();
        tokio::spawn(async move {
            let mut seen = rx.borrow_and_update().reconnects;
            while rx.changed().await.is_ok() {
                let link = *rx.borrow_and_update();
                match link.state {
                    ConnectivityState::Online if link.reconnects > seen => {
                        seen = link.reconnects;
                        info!(reconnects = seen, "connectivity restored, draining");
                        let store = store.clone();
                        tokio::spawn(async move {
                            match store.drain_pending().await {
                                Ok(r) if !r.coalesced() => info!(
                                    replayed = r.replayed,
                                    requeued = r.requeued,
                                    failed = r.failed.len(),
                                    "drain complete"
                                ),
                                Ok(_) => {}
                                Err(e) => error!(error = %e, "drain aborted"),
                            }
                        });
                    }
                    ConnectivityState::Online => {}
                    ConnectivityState::Offline => info!("connectivity lost"),
                }
            }
        })
    }

    async fn drain_pass(&self) -> SyncResult<DrainReport> {
        let mut report = DrainReport {
            passes: 1,
            ..Default::default()
        };
        if !self.is_online() {
            report.requeued = self.local().pending_len();
            return Ok(report);
        }
        // The batch stays in local state, persisted and visible to path
        // checks, until each op is acknowledged.
        let batch = self.local().begin_drain();
        if batch == 0 {
            return Ok(report);
        }
        info!(count = batch, "replaying pending operations");

        loop {
            let Some(mut op) = self.local().next_in_flight() else {
                break;
            };
            if !self.is_online() {
                let held = self.local().defer_all_in_flight()?;
                debug!(deferred = held, "offline mid-drain, deferring rest");
                report.requeued += held;
                break;
            }

            match self.replay(&op).await {
                Ok(Replayed::Done) => {
                    self.local().ack_in_flight()?;
                    debug!(op = %op.kind, path = %op.path, "replayed");
                    report.replayed += 1;
                }
                Ok(Replayed::Added {
                    provisional,
                    server,
                    value,
                }) => {
                    debug!(path = %op.path, from = %provisional, to = %server, "replayed add");
                    let mut local = self.local();
                    if let Err(e) = local.remap_id(&provisional, &server) {
                        error!(from = %provisional, to = %server, error = %e, "remap failed");
                    }
                    local.ack_in_flight()?;
                    report.replayed += 1;
                    let placed = op.path.child(&server).and_then(|target| {
                        if local.pending_touches(&target) {
                            Ok(())
                        } else {
                            local.put(&target, value, None)
                        }
                    });
                    if let Err(e) = placed {
                        warn!(path = %op.path, id = %server, error = %e, "failed to store synced record");
                    }
                }
                Err(e) => {
                    op.attempts += 1;
                    if op.attempts >= self.inner.options.max_retries || !e.is_transient() {
                        error!(
                            op = %op.kind,
                            path = %op.path,
                            attempts = op.attempts,
                            error = %e,
                            "giving up on queued operation"
                        );
                        let letter = DeadLetter {
                            op,
                            reason: e.to_string(),
                            failed_at: Utc::now(),
                        };
                        self.local().dead_letter_in_flight(letter.clone())?;
                        report.failed.push(letter);
                    } else {
                        warn!(op = %op.kind, path = %op.path, attempts = op.attempts, error = %e, "replay failed, requeueing");
                        self.local().defer_in_flight(op)?;
                        report.requeued += 1;
                    }
                }
            }
        }

        let synced_any = report.replayed > 0;
        self.local().finish_drain(synced_any)?;
        Ok(report)
    }

    async fn replay(&self, op: &PendingOperation) -> SyncResult<Replayed> {
        let remote = &self.inner.remote;
        match op.kind {
            OpKind::Save => {
                let payload = op.payload.clone().ok_or_else(|| missing_payload(op))?;
                remote.set(&op.path, stamp_save(payload)).await?;
                Ok(Replayed::Done)
            }
            OpKind::Delete => {
                remote.remove(&op.path).await?;
                Ok(Replayed::Done)
            }
            OpKind::Add => {
                let provisional = op.provisional_id.clone().ok_or_else(|| {
                    SyncError::LocalCacheFailure(format!("queued add {} has no provisional id", op.op_id))
                })?;
                let payload = op.payload.clone().ok_or_else(|| missing_payload(op))?;

                let reserved = self.local().resolve_id(&provisional).map(str::to_string);
                let server = match reserved {
                    Some(id) => id,
                    None => {
                        let id = remote.generate_id(&op.path).await?;
                        self.local().reserve_id(&provisional, &id)?;
                        id
                    }
                };
                let value = stamp_add(payload, &server);
                remote.set(&op.path.child(&server)?, value.clone()).await?;
                Ok(Replayed::Added {
                    provisional,
                    server,
                    value,
                })
            }
        }
    }

    async fn append_remote(&self, parent: &RecordPath, record: Record) -> SyncResult<(String, Record)> {
        let id = self.inner.remote.generate_id(parent).await?;
        let value = stamp_add(record, &id);
        self.inner.remote.set(&parent.child(&id)?, value.clone()).await?;
        Ok((id, value))
    }

    /// Mirror a value seen remotely into the snapshot, unless queued work
    /// would be clobbered.
    fn mirror(&self, path: &RecordPath, value: Option<Record>) {
        let mut local = self.local();
        if local.pending_touches(path) {
            return;
        }
        let res = match value {
            Some(v) => local.put(path, v, None),
            None => local.delete(path, None),
        };
        if let Err(e) = res {
            warn!(path = %path, error = %e, "failed to mirror remote value");
        }
    }

    /// Work queued while online waits behind earlier operations; a drain
    /// that is running makes one more pass for it.
    fn request_follow_up(&self) {
        self.inner.drain_requested.store(true, Ordering::SeqCst);
    }

    fn queue_touches(&self, path: &RecordPath) -> bool {
        self.local().pending_touches(path)
    }

    /// True if a queued operation targets `parent` or one of its ancestors,
    /// so a new child written now could be clobbered on replay.
    fn queue_covers(&self, parent: &RecordPath) -> bool {
        self.local().pending().any(|op| {
            op.target()
                .map(|t| t == *parent || t.is_ancestor_of(parent))
                .unwrap_or(true)
        })
    }

    fn provisional_id(&self) -> String {
        let seq = self.inner.provisional_seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}{}-{}",
            self.inner.options.provisional_prefix,
            Utc::now().timestamp_millis(),
            seq
        )
    }

    fn local(&self) -> MutexGuard<'_, LocalState> {
        self.inner.local.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn missing_payload(op: &PendingOperation) -> SyncError {
    SyncError::LocalCacheFailure(format!("queued {} {} has no payload", op.kind, op.op_id))
}

/// Merge server-side timestamps into an object record.
fn stamp_save(mut record: Record) -> Record {
    if let Some(obj) = record.as_object_mut() {
        let now = Utc::now();
        obj.insert("timestamp".into(), Value::from(now.timestamp_millis()));
        obj.insert("lastModified".into(), Value::String(now.to_rfc3339()));
    }
    record
}

fn stamp_add(mut record: Record, id: &str) -> Record {
    if let Some(obj) = record.as_object_mut() {
        let now = Utc::now();
        obj.insert("id".into(), Value::String(id.to_string()));
        obj.insert("timestamp".into(), Value::from(now.timestamp_millis()));
        obj.insert("createdAt".into(), Value::String(now.to_rfc3339()));
    }
    record
}
