//! Path operations over a JSON record tree.
//!
//! Both the remote object and the local snapshot hold their records as one
//! `serde_json::Value` tree. Writing a parent replaces the whole subtree;
//! writing a child creates intermediate objects as needed and replaces any
//! non-object value standing in the way.

use examsync_core::{Record, RecordPath};
use serde_json::{Map, Value};

/// A fresh, empty tree.
pub fn empty() -> Value {
    Value::Object(Map::new())
}

/// Borrow the value at `path`, or `None` if any segment is missing.
pub fn get_at<'a>(tree: &'a Value, path: &RecordPath) -> Option<&'a Value> {
    let mut node = tree;
    for seg in path.segments() {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

/// Store `value` at `path`, replacing whatever subtree was there.
pub fn set_at(tree: &mut Value, path: &RecordPath, value: Record) {
    let Some((last, parents)) = path.segments().split_last() else {
        *tree = value;
        return;
    };
    let mut node = tree;
    for seg in parents {
        node = ensure_object(node)
            .entry(seg.clone())
            .or_insert_with(empty);
    }
    ensure_object(node).insert(last.clone(), value);
}

/// Detach and return the value at `path`. Parents are left in place, so an
/// emptied collection reads back as `{}` rather than absent.
pub fn remove_at(tree: &mut Value, path: &RecordPath) -> Option<Value> {
    let Some((last, parents)) = path.segments().split_last() else {
        return Some(std::mem::replace(tree, empty()));
    };
    let mut node = tree;
    for seg in parents {
        node = node.as_object_mut()?.get_mut(seg)?;
    }
    node.as_object_mut()?.remove(last)
}

/// Replace every string equal to `from` with `to`, and rename object keys
/// equal to `from`. A key is not renamed onto an existing `to` entry.
/// Returns how many substitutions were made.
pub fn rewrite_strings(tree: &mut Value, from: &str, to: &str) -> usize {
    if from == to {
        return 0;
    }
    match tree {
        Value::String(s) if s == from => {
            *s = to.to_string();
            1
        }
        Value::Array(items) => items.iter_mut().map(|v| rewrite_strings(v, from, to)).sum(),
        Value::Object(map) => {
            let mut n = 0;
            if map.contains_key(from) {
                if map.contains_key(to) {
                    tracing::warn!(from, to, "key already taken, not renaming");
                } else if let Some(v) = map.remove(from) {
                    map.insert(to.to_string(), v);
                    n += 1;
                }
            }
            n + map
                .values_mut()
                .map(|v| rewrite_strings(v, from, to))
                .sum::<usize>()
        }
        _ => 0,
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = empty();
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}
