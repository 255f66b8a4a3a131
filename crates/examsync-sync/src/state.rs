//! Local sync state: record snapshot, pending queue, ID map, and dead letters.
//!
//! Everything is persisted through a string-keyed [`LocalCache`]:
//!
//! | key                   | value                                   |
//! |-----------------------|-----------------------------------------|
//! | `snapshot/<segment>`  | JSON subtree of one top-level collection |
//! | `sync/pending`        | every unacknowledged [`PendingOperation`] |
//! | `sync/failed`         | dead-lettered operations                |
//! | `sync/id-map`         | provisional ID -> server ID             |
//! | `sync/last-sync`      | RFC 3339 time of the last useful drain  |
//!
//! Each public method is one atomic step over the in-memory state: it
//! either commits to the cache and memory together or changes nothing in
//! memory and returns the error.
//!
//! A drain pass moves the queue into an in-flight batch held here, so the
//! batch stays visible to path checks and stays persisted until each
//! operation is acknowledged. Operations that fail go to a deferred list
//! and rejoin the queue, after anything enqueued meanwhile, when the pass
//! finishes. `sync/pending` always holds in-flight, then queued, then
//! deferred operations, and loads back as one queue.

use chrono::{DateTime, Utc};
use examsync_core::{Record, RecordPath, SyncError, SyncResult};
use examsync_storage::{tree, LocalCache};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::queue::{PendingOperation, PendingQueue};

const SNAPSHOT_PREFIX: &str = "snapshot/";
const KEY_PENDING: &str = "sync/pending";
const KEY_FAILED: &str = "sync/failed";
const KEY_ID_MAP: &str = "sync/id-map";
const KEY_LAST_SYNC: &str = "sync/last-sync";

/// An operation that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub op: PendingOperation,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn to_error(&self) -> SyncError {
        SyncError::ReplayFailure {
            kind: self.op.kind,
            path: self.op.path.to_string(),
            attempts: self.op.attempts,
            reason: self.reason.clone(),
        }
    }
}

pub struct LocalState {
    cache: Box<dyn LocalCache>,
    tree: Value,
    queue: PendingQueue,
    in_flight: VecDeque<PendingOperation>,
    deferred: Vec<PendingOperation>,
    failed: Vec<DeadLetter>,
    id_map: BTreeMap<String, String>,
    last_sync: Option<DateTime<Utc>>,
}

impl LocalState {
    /// Rebuild state from whatever the cache holds.
    pub fn load(cache: Box<dyn LocalCache>) -> SyncResult<Self> {
        let mut tree = tree::empty();
        for key in cache.keys() {
            let Some(segment) = key.strip_prefix(SNAPSHOT_PREFIX) else {
                continue;
            };
            let value: Value = decode(cache.as_ref(), &key)?.unwrap_or(Value::Null);
            let path = RecordPath::root().child(segment)?;
            tree::set_at(&mut tree, &path, value);
        }

        let queue = decode(cache.as_ref(), KEY_PENDING)?.unwrap_or_default();
        let failed = decode(cache.as_ref(), KEY_FAILED)?.unwrap_or_default();
        let id_map = decode(cache.as_ref(), KEY_ID_MAP)?.unwrap_or_default();
        let last_sync = cache
            .get(KEY_LAST_SYNC)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(LocalState {
            cache,
            tree,
            queue,
            in_flight: VecDeque::new(),
            deferred: Vec::new(),
            failed,
            id_map,
            last_sync,
        })
    }

    pub fn get(&self, path: &RecordPath) -> Option<Record> {
        tree::get_at(&self.tree, path).cloned()
    }

    /// Operations waiting for the next drain pass.
    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    /// Every unacknowledged operation, in persisted order.
    pub fn pending(&self) -> impl Iterator<Item = &PendingOperation> {
        self.in_flight
            .iter()
            .chain(self.queue.iter())
            .chain(self.deferred.iter())
    }

    pub fn pending_len(&self) -> usize {
        self.in_flight.len() + self.queue.len() + self.deferred.len()
    }

    /// True if any unacknowledged operation can change the value at `path`.
    pub fn pending_touches(&self, path: &RecordPath) -> bool {
        self.pending().any(|op| op.touches(path))
    }

    pub fn failed(&self) -> &[DeadLetter] {
        &self.failed
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    pub fn used_bytes(&self) -> u64 {
        self.cache.used_bytes()
    }

    pub fn resolve_id(&self, provisional: &str) -> Option<&str> {
        self.id_map.get(provisional).map(String::as_str)
    }

    /// Store `value` at `path`, optionally queueing `op` in the same step.
    pub fn put(
        &mut self,
        path: &RecordPath,
        value: Record,
        op: Option<PendingOperation>,
    ) -> SyncResult<()> {
        let mut next = self.tree.clone();
        tree::set_at(&mut next, path, value);
        self.commit(next, path, op)
    }

    /// Drop the value at `path`, optionally queueing `op` in the same step.
    pub fn delete(&mut self, path: &RecordPath, op: Option<PendingOperation>) -> SyncResult<()> {
        let mut next = self.tree.clone();
        tree::remove_at(&mut next, path);
        self.commit(next, path, op)
    }

    /// Start a drain pass: the queue becomes the in-flight batch, behind
    /// anything left over from a pass that did not finish. Returns the
    /// batch size. The persisted form is unchanged.
    pub fn begin_drain(&mut self) -> usize {
        let mut batch = std::mem::take(&mut self.in_flight);
        batch.extend(self.queue.take_all());
        batch.extend(self.deferred.drain(..));
        self.in_flight = batch;
        self.in_flight.len()
    }

    /// Front of the in-flight batch, the next operation to replay.
    pub fn next_in_flight(&self) -> Option<PendingOperation> {
        self.in_flight.front().cloned()
    }

    /// The remote acknowledged the front in-flight operation.
    pub fn ack_in_flight(&mut self) -> SyncResult<()> {
        let mut in_flight = self.in_flight.clone();
        in_flight.pop_front();
        let all = unacked(&self.queue, &in_flight, &self.deferred);
        self.write_json(KEY_PENDING, &all)?;
        self.in_flight = in_flight;
        self.flush()
    }

    /// Replace the front in-flight operation with `op` and hold it for the
    /// next pass.
    pub fn defer_in_flight(&mut self, op: PendingOperation) -> SyncResult<()> {
        let mut in_flight = self.in_flight.clone();
        in_flight.pop_front();
        let mut deferred = self.deferred.clone();
        deferred.push(op);
        let all = unacked(&self.queue, &in_flight, &deferred);
        self.write_json(KEY_PENDING, &all)?;
        self.in_flight = in_flight;
        self.deferred = deferred;
        self.flush()
    }

    /// Hold the rest of the batch for the next pass without replaying it.
    /// Returns how many operations were held.
    pub fn defer_all_in_flight(&mut self) -> SyncResult<usize> {
        let mut deferred = self.deferred.clone();
        deferred.extend(self.in_flight.iter().cloned());
        let all = unacked(&self.queue, &VecDeque::new(), &deferred);
        self.write_json(KEY_PENDING, &all)?;
        let held = self.in_flight.len();
        self.in_flight.clear();
        self.deferred = deferred;
        self.flush()?;
        Ok(held)
    }

    /// Drop the front in-flight operation into the dead letters.
    pub fn dead_letter_in_flight(&mut self, letter: DeadLetter) -> SyncResult<()> {
        let mut in_flight = self.in_flight.clone();
        in_flight.pop_front();
        let mut failed = self.failed.clone();
        failed.push(letter);
        let all = unacked(&self.queue, &in_flight, &self.deferred);
        self.write_json(KEY_PENDING, &all)?;
        self.write_json(KEY_FAILED, &failed)?;
        self.in_flight = in_flight;
        self.failed = failed;
        self.flush()
    }

    /// Close out a drain pass: deferred operations rejoin the queue after
    /// anything enqueued meanwhile, and the sync time is stamped.
    ///
    /// On error the batch stays held and the next pass picks it up.
    pub fn finish_drain(&mut self, synced_any: bool) -> SyncResult<()> {
        let mut queue = self.queue.clone();
        queue.requeue(self.in_flight.iter().cloned());
        queue.requeue(self.deferred.iter().cloned());
        let now = Utc::now();

        self.write_json(KEY_PENDING, &queue)?;
        if synced_any {
            self.cache.set(KEY_LAST_SYNC, now.to_rfc3339())?;
            self.last_sync = Some(now);
        }
        self.queue = queue;
        self.in_flight.clear();
        self.deferred.clear();
        self.flush()
    }

    /// Reserve a server ID for a provisional one before the remote write, so
    /// a retried add reuses it instead of minting a duplicate.
    pub fn reserve_id(&mut self, provisional: &str, server: &str) -> SyncResult<()> {
        let mut id_map = self.id_map.clone();
        id_map.insert(provisional.to_string(), server.to_string());
        self.write_json(KEY_ID_MAP, &id_map)?;
        self.id_map = id_map;
        self.flush()
    }

    /// Replace every local reference to `provisional` with `server`: the
    /// snapshot key, any string field equal to it, and queued operations.
    pub fn remap_id(&mut self, provisional: &str, server: &str) -> SyncResult<()> {
        let mut next = self.tree.clone();
        let mut changed = BTreeSet::new();
        if let Some(map) = next.as_object_mut() {
            for (segment, subtree) in map.iter_mut() {
                if tree::rewrite_strings(subtree, provisional, server) > 0 {
                    changed.insert(segment.clone());
                }
            }
        }
        for segment in &changed {
            self.persist_collection(&next, segment)?;
        }

        let mut queue = self.queue.clone();
        queue.rewrite_id(provisional, server);
        let mut in_flight = self.in_flight.clone();
        let mut deferred = self.deferred.clone();
        for op in in_flight.iter_mut().chain(deferred.iter_mut()) {
            op.rewrite_id(provisional, server);
        }
        let all = unacked(&queue, &in_flight, &deferred);
        self.write_json(KEY_PENDING, &all)?;

        self.tree = next;
        self.queue = queue;
        self.in_flight = in_flight;
        self.deferred = deferred;
        self.flush()
    }

    pub fn flush(&mut self) -> SyncResult<()> {
        self.cache.flush().map_err(SyncError::from)
    }

    fn commit(
        &mut self,
        next: Value,
        path: &RecordPath,
        op: Option<PendingOperation>,
    ) -> SyncResult<()> {
        // A root write can add or drop any collection.
        let segments: BTreeSet<String> = match path.collection() {
            Some(c) => [c.to_string()].into(),
            None => collections(&self.tree).chain(collections(&next)).collect(),
        };
        for segment in &segments {
            self.persist_collection(&next, segment)?;
        }

        if let Some(op) = op {
            let mut queue = self.queue.clone();
            queue.push(op);
            let all = unacked(&queue, &self.in_flight, &self.deferred);
            self.write_json(KEY_PENDING, &all)?;
            self.queue = queue;
        }
        self.tree = next;
        self.flush()
    }

    fn persist_collection(&mut self, snapshot: &Value, segment: &str) -> SyncResult<()> {
        let key = format!("{SNAPSHOT_PREFIX}{segment}");
        match snapshot.get(segment) {
            Some(v) => self.write_json(&key, v),
            None => {
                self.cache.remove(&key);
                Ok(())
            }
        }
    }

    fn write_json<T: Serialize>(&mut self, key: &str, value: &T) -> SyncResult<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| SyncError::LocalCacheFailure(format!("serializing {key}: {e}")))?;
        self.cache.set(key, json).map_err(SyncError::from)
    }
}

/// The persisted form of every unacknowledged operation.
fn unacked(
    queue: &PendingQueue,
    in_flight: &VecDeque<PendingOperation>,
    deferred: &[PendingOperation],
) -> PendingQueue {
    let mut all = queue.clone();
    all.prepend(in_flight.iter().cloned());
    all.requeue(deferred.iter().cloned());
    all
}

fn collections(snapshot: &Value) -> impl Iterator<Item = String> + '_ {
    snapshot
        .as_object()
        .into_iter()
        .flat_map(|m| m.keys().cloned())
}

fn decode<T: DeserializeOwned>(cache: &dyn LocalCache, key: &str) -> SyncResult<Option<T>> {
    match cache.get(key) {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| SyncError::LocalCacheFailure(format!("corrupt cache entry {key}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use examsync_storage::{JsonFileCache, MemoryCache};
    use serde_json::json;

    fn p(s: &str) -> RecordPath {
        RecordPath::parse(s).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let mut st = LocalState::load(Box::new(MemoryCache::new())).unwrap();
        st.put(&p("students/1"), json!({"name": "Ali"}), None).unwrap();
        assert_eq!(st.get(&p("students/1")), Some(json!({"name": "Ali"})));
        st.delete(&p("students/1"), None).unwrap();
        assert_eq!(st.get(&p("students/1")), None);
        assert_eq!(st.get(&p("students")), Some(json!({})));
    }

    #[test]
    fn survives_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        {
            let cache = JsonFileCache::open(&path, 0).unwrap();
            let mut st = LocalState::load(Box::new(cache)).unwrap();
            st.put(
                &p("students/1"),
                json!({"name": "Ali"}),
                Some(PendingOperation::save(p("students/1"), json!({"name": "Ali"}))),
            )
            .unwrap();
            st.reserve_id("local:1-0", "srv").unwrap();
        }
        let st = LocalState::load(Box::new(JsonFileCache::open(&path, 0).unwrap())).unwrap();
        assert_eq!(st.get(&p("students/1/name")), Some(json!("Ali")));
        assert_eq!(st.queue().len(), 1);
        assert_eq!(st.resolve_id("local:1-0"), Some("srv"));
    }

    #[test]
    fn quota_failure_leaves_state_untouched() {
        let mut st = LocalState::load(Box::new(MemoryCache::with_quota(64))).unwrap();
        let big = json!({"blob": "x".repeat(200)});
        let err = st
            .put(&p("students/1"), big.clone(), Some(PendingOperation::save(p("students/1"), big)))
            .unwrap_err();
        assert!(matches!(err, SyncError::LocalCacheFailure(_)));
        assert_eq!(st.get(&p("students/1")), None);
        assert!(st.queue().is_empty());
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let mut cache = MemoryCache::new();
        cache.set("snapshot/students", "{broken".into()).unwrap();
        let err = LocalState::load(Box::new(cache)).err().unwrap();
        assert!(matches!(err, SyncError::LocalCacheFailure(_)));
    }

    #[test]
    fn remap_rewrites_keys_references_and_queue() {
        let mut st = LocalState::load(Box::new(MemoryCache::new())).unwrap();
        st.put(&p("questions/local:1-0"), json!({"id": "local:1-0", "text": "2+2?"}), None)
            .unwrap();
        st.put(
            &p("exams/e1"),
            json!({"questionIds": ["local:1-0"]}),
            Some(PendingOperation::delete(p("questions/local:1-0"))),
        )
        .unwrap();

        st.remap_id("local:1-0", "srv1").unwrap();

        assert_eq!(st.get(&p("questions/local:1-0")), None);
        assert_eq!(st.get(&p("questions/srv1/id")), Some(json!("srv1")));
        assert_eq!(st.get(&p("exams/e1")), Some(json!({"questionIds": ["srv1"]})));
        assert_eq!(st.queue().iter().next().unwrap().path, p("questions/srv1"));
    }

    #[test]
    fn finish_drain_orders_requeue_after_new_ops() {
        let mut st = LocalState::load(Box::new(MemoryCache::new())).unwrap();
        st.delete(&p("a"), Some(PendingOperation::delete(p("a")))).unwrap();
        assert_eq!(st.begin_drain(), 1);
        assert!(st.queue().is_empty());
        // Still pending while in flight
        assert!(st.pending_touches(&p("a")));

        let mut op = st.next_in_flight().unwrap();
        st.delete(&p("b"), Some(PendingOperation::delete(p("b")))).unwrap();
        op.attempts += 1;
        st.defer_in_flight(op).unwrap();
        assert_eq!(st.pending_len(), 2);
        st.finish_drain(false).unwrap();

        let order: Vec<String> = st.queue().iter().map(|op| op.path.to_string()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(st.queue().iter().nth(1).unwrap().attempts, 1);
        assert!(st.last_sync().is_none());
    }

    #[test]
    fn unacknowledged_batch_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        {
            let mut st =
                LocalState::load(Box::new(JsonFileCache::open(&path, 0).unwrap())).unwrap();
            for key in ["students/1", "students/2", "students/3"] {
                st.put(&p(key), json!({}), Some(PendingOperation::save(p(key), json!({}))))
                    .unwrap();
            }
            st.begin_drain();
            st.ack_in_flight().unwrap();
            // Dropped mid-pass, before finish_drain
        }
        let st = LocalState::load(Box::new(JsonFileCache::open(&path, 0).unwrap())).unwrap();
        let left: Vec<String> = st.queue().iter().map(|op| op.path.to_string()).collect();
        assert_eq!(left, vec!["students/2", "students/3"]);
    }

    #[test]
    fn dead_letter_leaves_the_batch() {
        let mut st = LocalState::load(Box::new(MemoryCache::new())).unwrap();
        st.delete(&p("a"), Some(PendingOperation::delete(p("a")))).unwrap();
        st.begin_drain();
        let op = st.next_in_flight().unwrap();
        st.dead_letter_in_flight(DeadLetter {
            op,
            reason: "gone".into(),
            failed_at: Utc::now(),
        })
        .unwrap();
        st.finish_drain(false).unwrap();
        assert_eq!(st.pending_len(), 0);
        assert_eq!(st.failed().len(), 1);
    }

    #[test]
    fn root_write_replaces_all_collections() {
        let mut st = LocalState::load(Box::new(MemoryCache::new())).unwrap();
        st.put(&p("students/1"), json!({}), None).unwrap();
        st.put(&RecordPath::root(), json!({"questions": {}}), None).unwrap();
        assert_eq!(st.get(&p("students")), None);
        assert_eq!(st.get(&p("questions")), Some(json!({})));
        assert_eq!(st.cache.keys(), vec!["snapshot/questions".to_string()]);
    }
}
