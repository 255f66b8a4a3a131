//! Pending-operation queue: mutations made while the remote was unreachable.

use chrono::{DateTime, Utc};
use examsync_core::{OpKind, Record, RecordPath, SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use examsync_storage::tree;

/// One queued mutation, replayed in enqueue order on the next drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Stable identity across retries
    pub op_id: uuid::Uuid,
    /// Enqueue order; informational once an op has been re-queued
    pub seq: u64,
    pub kind: OpKind,
    /// Target path; for `Add` this is the parent collection
    pub path: RecordPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Record>,
    /// Placeholder key minted offline (`Add` only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisional_id: Option<String>,
    /// Failed replay attempts so far
    #[serde(default)]
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
    fn new(kind: OpKind, path: RecordPath, payload: Option<Record>) -> Self {
        PendingOperation {
            op_id: uuid::Uuid::new_v4(),
            seq: 0,
            kind,
            path,
            payload,
            provisional_id: None,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn save(path: RecordPath, payload: Record) -> Self {
        Self::new(OpKind::Save, path, Some(payload))
    }

    pub fn add(parent: RecordPath, provisional_id: String, payload: Record) -> Self {
        let mut op = Self::new(OpKind::Add, parent, Some(payload));
        op.provisional_id = Some(provisional_id);
        op
    }

    pub fn delete(path: RecordPath) -> Self {
        Self::new(OpKind::Delete, path, None)
    }

    /// The path whose value this operation changes.
    pub fn target(&self) -> SyncResult<RecordPath> {
        match (&self.kind, &self.provisional_id) {
            (OpKind::Add, Some(id)) => self.path.child(id),
            (OpKind::Add, None) => Err(SyncError::LocalCacheFailure(format!(
                "queued add {} has no provisional id",
                self.op_id
            ))),
            _ => Ok(self.path.clone()),
        }
    }

    /// True if replaying this operation can change the value seen at `path`.
    pub fn touches(&self, path: &RecordPath) -> bool {
        self.target().map(|t| t.overlaps(path)).unwrap_or(true)
    }

    /// Substitute a remapped ID in the path and payload.
    pub fn rewrite_id(&mut self, from: &str, to: &str) {
        self.path = self.path.replace_segment(from, to);
        if let Some(payload) = self.payload.as_mut() {
            tree::rewrite_strings(payload, from, to);
        }
    }
}

/// FIFO of pending operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingQueue {
    ops: VecDeque<PendingOperation>,
    next_seq: u64,
}

impl PendingQueue {
    /// Append a fresh operation, assigning its sequence number.
    pub fn push(&mut self, mut op: PendingOperation) -> u64 {
        op.seq = self.next_seq;
        self.next_seq += 1;
        self.ops.push_back(op);
        self.next_seq - 1
    }

    /// Append operations that failed replay, after anything already queued.
    pub fn requeue(&mut self, ops: impl IntoIterator<Item = PendingOperation>) {
        self.ops.extend(ops);
    }

    /// Put operations back at the front, keeping their order.
    pub fn prepend(&mut self, ops: impl IntoIterator<Item = PendingOperation>) {
        let mut front: VecDeque<PendingOperation> = ops.into_iter().collect();
        front.append(&mut self.ops);
        self.ops = front;
    }

    /// Remove and return every queued operation in order.
    pub fn take_all(&mut self) -> VecDeque<PendingOperation> {
        std::mem::take(&mut self.ops)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation> {
        self.ops.iter()
    }

    /// True if any queued operation can change the value at `path`.
    pub fn touches(&self, path: &RecordPath) -> bool {
        self.ops.iter().any(|op| op.touches(path))
    }

    pub fn rewrite_id(&mut self, from: &str, to: &str) {
        for op in self.ops.iter_mut() {
            op.rewrite_id(from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn p(s: &str) -> RecordPath {
        RecordPath::parse(s).unwrap()
    }

    #[test]
    fn push_assigns_increasing_seq() {
        let mut q = PendingQueue::default();
        assert_eq!(q.push(PendingOperation::delete(p("a"))), 0);
        assert_eq!(q.push(PendingOperation::delete(p("b"))), 1);
        let taken: Vec<_> = q.take_all().into_iter().map(|op| op.seq).collect();
        assert_eq!(taken, vec![0, 1]);
        assert!(q.is_empty());
        // Sequence keeps counting after a drain
        assert_eq!(q.push(PendingOperation::delete(p("c"))), 2);
    }

    #[test]
    fn requeue_goes_after_new_work() {
        let mut q = PendingQueue::default();
        q.push(PendingOperation::delete(p("old1")));
        q.push(PendingOperation::delete(p("old2")));
        let failed = q.take_all();
        q.push(PendingOperation::delete(p("during_replay")));
        q.requeue(failed);
        let order: Vec<String> = q.iter().map(|op| op.path.to_string()).collect();
        assert_eq!(order, vec!["during_replay", "old1", "old2"]);
    }

    #[test]
    fn prepend_goes_before_queued_work() {
        let mut q = PendingQueue::default();
        q.push(PendingOperation::delete(p("new")));
        q.prepend(vec![PendingOperation::delete(p("a")), PendingOperation::delete(p("b"))]);
        let order: Vec<String> = q.iter().map(|op| op.path.to_string()).collect();
        assert_eq!(order, vec!["a", "b", "new"]);
    }

    #[test]
    fn add_targets_provisional_child() {
        let op = PendingOperation::add(p("questions"), "local:1-0".into(), json!({"text": "?"}));
        assert_eq!(op.target().unwrap(), p("questions/local:1-0"));
        assert!(op.touches(&p("questions")));
        assert!(op.touches(&p("questions/local:1-0/text")));
        assert!(!op.touches(&p("questions/other")));
    }

    #[test]
    fn rewrite_id_updates_path_and_payload() {
        let mut op = PendingOperation::save(
            p("exams/e1"),
            json!({"questionIds": ["local:1-0", "q2"]}),
        );
        op.rewrite_id("local:1-0", "srv");
        assert_eq!(op.payload, Some(json!({"questionIds": ["srv", "q2"]})));

        let mut del = PendingOperation::delete(p("questions/local:1-0"));
        del.rewrite_id("local:1-0", "srv");
        assert_eq!(del.path, p("questions/srv"));
    }

    #[test]
    fn serde_roundtrip_preserves_queue() {
        let mut q = PendingQueue::default();
        q.push(PendingOperation::save(p("students/1"), json!({"name": "Ali"})));
        q.push(PendingOperation::add(p("questions"), "local:9-1".into(), json!({})));
        let json = serde_json::to_string(&q).unwrap();
        let back: PendingQueue = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.iter().nth(1).unwrap().provisional_id.as_deref(), Some("local:9-1"));
        assert_eq!(back.next_seq, 2);
    }

    proptest! {
        #[test]
        fn take_all_preserves_enqueue_order(keys in proptest::collection::vec("[a-z]{1,6}", 0..20)) {
            let mut q = PendingQueue::default();
            for k in &keys {
                q.push(PendingOperation::delete(p(k)));
            }
            let out: Vec<String> = q.take_all().into_iter().map(|op| op.path.to_string()).collect();
            prop_assert_eq!(out, keys);
        }
    }
}
