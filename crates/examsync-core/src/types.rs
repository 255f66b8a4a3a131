use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// An opaque record: normally a JSON object, but any JSON value is stored as-is.
pub type Record = serde_json::Value;

/// Characters the remote store refuses inside a path segment.
const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']'];

/// Hierarchical key addressing a record or subtree, e.g. `students/abc123`.
///
/// Leading, trailing, and doubled `/` are normalized away. The root path
/// (no segments) is valid to read but cannot be written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordPath {
    segments: Vec<String>,
}

impl RecordPath {
    pub fn root() -> Self {
        RecordPath {
            segments: Vec::new(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let mut segments = Vec::new();
        for seg in raw.split('/').filter(|s| !s.is_empty()) {
            validate_segment(raw, seg)?;
            segments.push(seg.to_string());
        }
        Ok(RecordPath { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// First segment, i.e. the top-level collection this path lives in.
    pub fn collection(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Final segment (the record key), if any.
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<RecordPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(RecordPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn child(&self, segment: &str) -> Result<RecordPath, SyncError> {
        let mut next = self.clone();
        for seg in segment.split('/').filter(|s| !s.is_empty()) {
            validate_segment(segment, seg)?;
            next.segments.push(seg.to_string());
        }
        Ok(next)
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &RecordPath) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// True if a mutation at `self` can change the value seen at `other`,
    /// i.e. the paths are equal or one contains the other.
    pub fn overlaps(&self, other: &RecordPath) -> bool {
        self == other || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }

    /// Replace every segment equal to `from` with `to`.
    pub fn replace_segment(&self, from: &str, to: &str) -> RecordPath {
        RecordPath {
            segments: self
                .segments
                .iter()
                .map(|s| if s == from { to.to_string() } else { s.clone() })
                .collect(),
        }
    }
}

fn validate_segment(raw: &str, seg: &str) -> Result<(), SyncError> {
    if seg.contains(FORBIDDEN) {
        return Err(SyncError::InvalidPath {
            path: raw.to_string(),
            reason: "segment contains one of . # $ [ ]",
        });
    }
    if seg.chars().any(char::is_control) {
        return Err(SyncError::InvalidPath {
            path: raw.to_string(),
            reason: "segment contains a control character",
        });
    }
    Ok(())
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl FromStr for RecordPath {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordPath::parse(s)
    }
}

impl TryFrom<String> for RecordPath {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RecordPath::parse(&value)
    }
}

impl From<RecordPath> for String {
    fn from(p: RecordPath) -> String {
        p.to_string()
    }
}

/// Outcome of a mutating call that did not fail.
///
/// `Queued` is never conflated with success: the change is visible locally
/// but the remote store has not acknowledged it yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ack {
    /// Remote store acknowledged the mutation.
    Synced,
    /// Stored locally and queued for replay on the next reconnect.
    Queued,
}

impl Ack {
    pub fn is_synced(self) -> bool {
        matches!(self, Ack::Synced)
    }
}

/// Kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Save,
    Add,
    Delete,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpKind::Save => "save",
            OpKind::Add => "add",
            OpKind::Delete => "delete",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_normalizes_slashes() {
        let p = RecordPath::parse("/students//abc/").unwrap();
        assert_eq!(p.to_string(), "students/abc");
        assert_eq!(p.depth(), 2);
        assert_eq!(p.collection(), Some("students"));
        assert_eq!(p.key(), Some("abc"));
    }

    #[test]
    fn empty_is_root() {
        let p = RecordPath::parse("").unwrap();
        assert!(p.is_root());
        assert!(p.parent().is_none());
    }

    #[test]
    fn rejects_forbidden_characters() {
        assert!(RecordPath::parse("students/a.b").is_err());
        assert!(RecordPath::parse("students/$x").is_err());
        assert!(RecordPath::parse("a[0]").is_err());
    }

    #[test]
    fn provisional_ids_are_valid_segments() {
        let p = RecordPath::parse("questions/local:1697000000000-0").unwrap();
        assert_eq!(p.key(), Some("local:1697000000000-0"));
    }

    #[test]
    fn ancestry_and_overlap() {
        let parent = RecordPath::parse("students").unwrap();
        let child = RecordPath::parse("students/1").unwrap();
        let other = RecordPath::parse("questions/1").unwrap();
        assert!(parent.is_ancestor_of(&child));
        assert!(!child.is_ancestor_of(&parent));
        assert!(!parent.is_ancestor_of(&parent));
        assert!(parent.overlaps(&child));
        assert!(child.overlaps(&parent));
        assert!(!child.overlaps(&other));
        assert!(RecordPath::root().overlaps(&other));
    }

    #[test]
    fn replace_segment_rewrites_matches_only() {
        let p = RecordPath::parse("questions/local:1-0/options").unwrap();
        let q = p.replace_segment("local:1-0", "srv42");
        assert_eq!(q.to_string(), "questions/srv42/options");
    }

    #[test]
    fn serde_as_string() {
        let p = RecordPath::parse("exams/x").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"exams/x\"");
        let back: RecordPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(serde_json::from_str::<RecordPath>("\"a.b\"").is_err());
    }

    proptest! {
        #[test]
        fn display_parse_is_stable(segs in proptest::collection::vec("[a-zA-Z0-9_:-]{1,8}", 0..5)) {
            let raw = segs.join("/");
            let p = RecordPath::parse(&raw).unwrap();
            prop_assert_eq!(p.to_string(), raw.clone());
            prop_assert_eq!(RecordPath::parse(&p.to_string()).unwrap(), p);
        }

        #[test]
        fn parent_is_ancestor(segs in proptest::collection::vec("[a-z0-9]{1,6}", 1..5)) {
            let p = RecordPath::parse(&segs.join("/")).unwrap();
            let parent = p.parent().unwrap();
            prop_assert!(parent.is_ancestor_of(&p));
            prop_assert!(parent.overlaps(&p));
        }
    }
}
