//! Nested, path-addressed Last-Writer-Wins map with tombstones.
//!
//! This is the primary data model for room state. Leaves live in `entries`
//! keyed by path; deletes live in `tombstones`. An entry is visible iff no
//! tombstone at the same path beats it. Setting an object value decomposes
//! it into its leaves, each resolved independently; arrays and scalars are
//! stored whole. The full operation log is retained for snapshots, merge,
//! and partial sync.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::crdt::beats;
use crate::error::{ProtoError, Result};
use crate::op::{OpKind, Operation};
use crate::validate::{check_path, check_value, is_blocked_key};

/// A concrete leaf value with its winning write's ordering pair.
#[derive(Debug, Clone, PartialEq)]
struct MapEntry {
    value: Value,
    timestamp: f64,
    origin: String,
}

/// A delete marker. Persists so late writes with lower ordering cannot
/// resurrect the path.
#[derive(Debug, Clone, PartialEq)]
struct TombstoneMark {
    timestamp: f64,
    origin: String,
}

/// Serialized leaf entry. Snapshot keys join path segments with ".".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// The leaf value.
    pub value: Value,
    /// Winning timestamp.
    pub timestamp: f64,
    /// Winning origin.
    #[serde(rename = "node_id")]
    pub origin: String,
}

/// Serialized tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTombstone {
    /// Tombstone timestamp.
    pub timestamp: f64,
    /// Tombstone origin.
    #[serde(rename = "node_id")]
    pub origin: String,
}

/// Wire-shape state snapshot: entries, tombstones, and the operation log.
///
/// Snapshot keys use "." separators while operation paths are arrays, so a
/// path segment containing a literal "." is not reconstructable from a
/// snapshot. Known limitation, kept for wire compatibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapSnapshot {
    /// Visible and shadowed leaf entries, keyed by "."-joined path.
    pub entries: BTreeMap<String, SnapshotEntry>,
    /// Delete markers, keyed by "."-joined path.
    pub tombstones: BTreeMap<String, SnapshotTombstone>,
    /// The full operation log.
    pub operations: Vec<Operation>,
}

/// Nested path-addressed LWW map.
#[derive(Debug, Clone)]
pub struct LwwMap {
    node_id: String,
    entries: BTreeMap<Vec<String>, MapEntry>,
    tombstones: BTreeMap<Vec<String>, TombstoneMark>,
    log: Vec<Operation>,
    seen: HashSet<Uuid>,
}

impl LwwMap {
    /// Create an empty map owned by `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            entries: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            log: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// The node id local writes are attributed to.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Write `value` at `path` locally and return the operation for
    /// forwarding. An empty path addresses the root: object values flatten
    /// into top-level leaves.
    pub fn set(&mut self, path: Vec<String>, value: Value) -> Result<Operation> {
        let op = Operation::set(self.node_id.clone(), path, value)?;
        self.apply(&op)?;
        Ok(op)
    }

    /// Tombstone `path` locally and return the operation for forwarding.
    pub fn delete(&mut self, path: Vec<String>) -> Result<Operation> {
        let op = Operation::delete(self.node_id.clone(), path)?;
        self.apply(&op)?;
        Ok(op)
    }

    /// Apply an operation from anywhere.
    ///
    /// Idempotent by operation id: a repeat returns `Ok(false)` and changes
    /// nothing. Object `set` payloads decompose into leaves, each passing
    /// its own `(timestamp, origin)` test against the existing entry.
    pub fn apply(&mut self, op: &Operation) -> Result<bool> {
        op.validate()?;
        if self.seen.contains(&op.id) {
            return Ok(false);
        }
        match op.kind {
            OpKind::Set => {
                let value = op.value.as_ref().ok_or_else(|| ProtoError::InvalidOperation {
                    reason: "set operation without value".into(),
                })?;
                self.apply_set(&op.path, value, op.timestamp, &op.origin);
            }
            OpKind::Delete => {
                let newer = match self.tombstones.get(&op.path) {
                    Some(existing) => {
                        beats(op.timestamp, &op.origin, existing.timestamp, &existing.origin)
                    }
                    None => true,
                };
                if newer {
                    self.tombstones.insert(
                        op.path.clone(),
                        TombstoneMark { timestamp: op.timestamp, origin: op.origin.clone() },
                    );
                }
            }
        }
        self.seen.insert(op.id);
        self.log.push(op.clone());
        Ok(true)
    }

    fn apply_set(&mut self, path: &[String], value: &Value, timestamp: f64, origin: &str) {
        match value {
            // Non-empty objects decompose into their leaves; everything
            // else (scalars, arrays, the empty object) is stored whole.
            Value::Object(map) if !map.is_empty() => {
                for (key, child) in map {
                    let mut leaf_path = path.to_vec();
                    leaf_path.push(key.clone());
                    self.apply_set(&leaf_path, child, timestamp, origin);
                }
            }
            _ => {
                let wins = match self.entries.get(path) {
                    Some(existing) => {
                        beats(timestamp, origin, existing.timestamp, &existing.origin)
                    }
                    None => true,
                };
                if wins {
                    self.entries.insert(
                        path.to_vec(),
                        MapEntry {
                            value: value.clone(),
                            timestamp,
                            origin: origin.to_string(),
                        },
                    );
                }
            }
        }
    }

    fn entry_visible(&self, path: &[String], entry: &MapEntry) -> bool {
        match self.tombstones.get(path) {
            Some(t) => !beats(t.timestamp, &t.origin, entry.timestamp, &entry.origin),
            None => true,
        }
    }

    /// Read the value at `path`: a visible leaf wins; otherwise the nested
    /// object reconstructed from strict descendants; otherwise `None`.
    #[must_use]
    pub fn get(&self, path: &[String]) -> Option<Value> {
        if path.is_empty() {
            let root = self.value();
            return match &root {
                Value::Object(m) if m.is_empty() && !self.has_root_entry() => None,
                _ => Some(root),
            };
        }
        if let Some(entry) = self.entries.get(path) {
            if self.entry_visible(path, entry) {
                return Some(entry.value.clone());
            }
        }
        let nested = self.reconstruct(path);
        match nested {
            Value::Object(ref m) if m.is_empty() => None,
            other => Some(other),
        }
    }

    fn has_root_entry(&self) -> bool {
        let root: &[String] = &[];
        self.entries.get(root).is_some_and(|e| self.entry_visible(root, e))
    }

    /// Build a nested object from all visible entries strictly below `prefix`.
    fn reconstruct(&self, prefix: &[String]) -> Value {
        let mut tree = Value::Object(Map::new());
        for (path, entry) in &self.entries {
            if path.len() <= prefix.len() || !path.starts_with(prefix) {
                continue;
            }
            if path.iter().any(|s| is_blocked_key(s)) {
                continue;
            }
            if !self.entry_visible(path, entry) {
                continue;
            }
            insert_leaf(&mut tree, &path[prefix.len()..], entry.value.clone());
        }
        tree
    }

    /// Materialize the full nested value.
    ///
    /// Iteration is in path order, so ancestors land before descendants and
    /// a descendant write overwrites an ancestor scalar (descendants win).
    /// Paths containing blocked keys are skipped outright.
    #[must_use]
    pub fn value(&self) -> Value {
        let mut tree = Value::Object(Map::new());
        for (path, entry) in &self.entries {
            if path.iter().any(|s| is_blocked_key(s)) {
                continue;
            }
            if !self.entry_visible(path, entry) {
                continue;
            }
            if path.is_empty() {
                tree = entry.value.clone();
            } else {
                insert_leaf(&mut tree, path, entry.value.clone());
            }
        }
        tree
    }

    /// Replay another map's operation log through [`Self::apply`].
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        for op in &other.log {
            self.apply(op)?;
        }
        Ok(())
    }

    /// Distinct visible top-level keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for (path, entry) in &self.entries {
            let Some(first) = path.first() else { continue };
            if is_blocked_key(first) || !self.entry_visible(path, entry) {
                continue;
            }
            if !keys.iter().any(|k| k == first) {
                keys.push(first.clone());
            }
        }
        keys
    }

    /// Is `key` a visible top-level key?
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.entries.iter().any(|(path, entry)| {
            path.first().is_some_and(|first| first == key) && self.entry_visible(path, entry)
        })
    }

    /// Number of visible leaf entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|(path, entry)| self.entry_visible(path, entry))
            .count()
    }

    /// True when no leaf is visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The retained operation log, in arrival order.
    #[must_use]
    pub fn log(&self) -> &[Operation] {
        &self.log
    }

    /// Operations strictly newer than `since` for their origin. Used to
    /// answer partial sync requests.
    #[must_use]
    pub fn log_since(&self, since: &crate::version::VersionVector) -> Vec<Operation> {
        self.log
            .iter()
            .filter(|op| op.timestamp > since.get(&op.origin))
            .cloned()
            .collect()
    }

    /// Serialize entries, tombstones, and the operation log.
    #[must_use]
    pub fn snapshot(&self) -> MapSnapshot {
        let entries = self
            .entries
            .iter()
            .map(|(path, e)| {
                (
                    path.join("."),
                    SnapshotEntry {
                        value: e.value.clone(),
                        timestamp: e.timestamp,
                        origin: e.origin.clone(),
                    },
                )
            })
            .collect();
        let tombstones = self
            .tombstones
            .iter()
            .map(|(path, t)| {
                (
                    path.join("."),
                    SnapshotTombstone { timestamp: t.timestamp, origin: t.origin.clone() },
                )
            })
            .collect();
        MapSnapshot { entries, tombstones, operations: self.log.clone() }
    }

    /// Rebuild a map from a snapshot, re-validating every key, value, and
    /// operation. A tampered snapshot is rejected whole.
    pub fn from_snapshot(node_id: impl Into<String>, snapshot: &MapSnapshot) -> Result<Self> {
        let mut map = Self::new(node_id);
        for (key, entry) in &snapshot.entries {
            let path = split_snapshot_key(key);
            check_path(&path)?;
            check_value(&entry.value)?;
            map.entries.insert(
                path,
                MapEntry {
                    value: entry.value.clone(),
                    timestamp: entry.timestamp,
                    origin: entry.origin.clone(),
                },
            );
        }
        for (key, tomb) in &snapshot.tombstones {
            let path = split_snapshot_key(key);
            check_path(&path)?;
            map.tombstones.insert(
                path,
                TombstoneMark { timestamp: tomb.timestamp, origin: tomb.origin.clone() },
            );
        }
        for op in &snapshot.operations {
            op.validate()?;
            if map.seen.insert(op.id) {
                map.log.push(op.clone());
            }
        }
        Ok(map)
    }
}

fn split_snapshot_key(key: &str) -> Vec<String> {
    if key.is_empty() {
        Vec::new()
    } else {
        key.split('.').map(str::to_string).collect()
    }
}

/// Insert `value` at `path` inside `tree`, replacing any scalar found along
/// the way with an object (descendants win over ancestor scalars).
fn insert_leaf(tree: &mut Value, path: &[String], value: Value) {
    debug_assert!(!path.is_empty());
    if !tree.is_object() {
        *tree = Value::Object(Map::new());
    }
    let mut slot = tree;
    for segment in &path[..path.len() - 1] {
        let map = slot.as_object_mut().expect("slot coerced to object");
        let child = map.entry(segment.clone()).or_insert_with(|| Value::Object(Map::new()));
        if !child.is_object() {
            *child = Value::Object(Map::new());
        }
        slot = child;
    }
    let map = slot.as_object_mut().expect("slot coerced to object");
    map.insert(path[path.len() - 1].clone(), value);
}
