//! Last-Writer-Wins register: a single replicated cell.

use std::collections::HashSet;

use serde_json::Value;
use uuid::Uuid;

use crate::crdt::beats;
use crate::error::{ProtoError, Result};
use crate::op::{OpKind, Operation};

/// A single-cell CRDT resolving concurrent writes by `(timestamp, origin)`.
///
/// The register keeps its full operation log so replicas can merge by
/// replay; an operation already applied (by id) is a no-op.
#[derive(Debug, Clone)]
pub struct LwwRegister {
    node_id: String,
    cell: Option<Cell>,
    log: Vec<Operation>,
    seen: HashSet<Uuid>,
}

#[derive(Debug, Clone)]
struct Cell {
    value: Value,
    timestamp: f64,
    origin: String,
}

impl LwwRegister {
    /// Create an empty register owned by `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            cell: None,
            log: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// The node id local writes are attributed to.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Write a value locally: builds a `set` operation with an empty path,
    /// applies it, and returns it for forwarding to peers.
    pub fn set(&mut self, value: Value) -> Result<Operation> {
        let op = Operation::set(self.node_id.clone(), Vec::new(), value)?;
        self.apply(&op)?;
        Ok(op)
    }

    /// Apply an operation.
    ///
    /// Returns `Ok(false)` when the operation was already seen (idempotent
    /// re-apply). Fails with [`ProtoError::UnsupportedOp`] for anything but
    /// `set`. The operation is recorded in the log whether or not it wins
    /// the cell.
    pub fn apply(&mut self, op: &Operation) -> Result<bool> {
        op.validate()?;
        if self.seen.contains(&op.id) {
            return Ok(false);
        }
        if op.kind != OpKind::Set {
            return Err(ProtoError::UnsupportedOp { kind: op.kind.as_str().to_string() });
        }
        let value = op.value.clone().ok_or_else(|| ProtoError::InvalidOperation {
            reason: "set operation without value".into(),
        })?;

        let wins = match &self.cell {
            Some(cell) => beats(op.timestamp, &op.origin, cell.timestamp, &cell.origin),
            None => true,
        };
        if wins {
            self.cell = Some(Cell { value, timestamp: op.timestamp, origin: op.origin.clone() });
        }

        self.seen.insert(op.id);
        self.log.push(op.clone());
        Ok(true)
    }

    /// The current value, if any write has been observed.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.cell.as_ref().map(|c| &c.value)
    }

    /// The `(timestamp, origin)` of the winning write, if any.
    #[must_use]
    pub fn winner(&self) -> Option<(f64, &str)> {
        self.cell.as_ref().map(|c| (c.timestamp, c.origin.as_str()))
    }

    /// Replay another register's log through [`Self::apply`].
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        for op in &other.log {
            self.apply(op)?;
        }
        Ok(())
    }

    /// The retained operation log.
    #[must_use]
    pub fn log(&self) -> &[Operation] {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op_at(origin: &str, timestamp: f64, value: Value) -> Operation {
        let mut op = Operation::set(origin, Vec::new(), value).unwrap();
        op.timestamp = timestamp;
        op
    }

    #[test]
    fn test_set_and_value() {
        let mut reg = LwwRegister::new("a");
        assert!(reg.value().is_none());
        reg.set(json!("hello")).unwrap();
        assert_eq!(reg.value(), Some(&json!("hello")));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut reg = LwwRegister::new("a");
        let op = op_at("b", 10.0, json!(1));
        assert!(reg.apply(&op).unwrap());
        assert!(!reg.apply(&op).unwrap());
        assert_eq!(reg.log().len(), 1);
    }

    #[test]
    fn test_losing_write_is_logged_but_not_visible() {
        let mut reg = LwwRegister::new("a");
        reg.apply(&op_at("b", 10.0, json!("new"))).unwrap();
        reg.apply(&op_at("b", 5.0, json!("old"))).unwrap();
        assert_eq!(reg.value(), Some(&json!("new")));
        assert_eq!(reg.log().len(), 2);
    }

    #[test]
    fn test_equal_timestamp_greater_origin_wins() {
        let mut reg = LwwRegister::new("x");
        reg.apply(&op_at("a", 10.0, json!("from-a"))).unwrap();
        reg.apply(&op_at("b", 10.0, json!("from-b"))).unwrap();
        assert_eq!(reg.value(), Some(&json!("from-b")));

        // Arrival order does not matter.
        let mut reg2 = LwwRegister::new("x");
        reg2.apply(&op_at("b", 10.0, json!("from-b"))).unwrap();
        reg2.apply(&op_at("a", 10.0, json!("from-a"))).unwrap();
        assert_eq!(reg2.value(), Some(&json!("from-b")));
    }

    #[test]
    fn test_delete_is_unsupported() {
        let mut reg = LwwRegister::new("a");
        let del = Operation::delete("b", Vec::new()).unwrap();
        assert!(matches!(
            reg.apply(&del).unwrap_err(),
            ProtoError::UnsupportedOp { .. }
        ));
        // Rejected operations leave no trace.
        assert!(reg.log().is_empty());
    }

    #[test]
    fn test_merge_converges() {
        let mut a = LwwRegister::new("a");
        let mut b = LwwRegister::new("b");
        a.apply(&op_at("a", 1.0, json!("first"))).unwrap();
        b.apply(&op_at("b", 2.0, json!("second"))).unwrap();

        let mut a2 = a.clone();
        a.merge(&b).unwrap();
        b.merge(&a2).unwrap();
        assert_eq!(a.value(), b.value());
        assert_eq!(a.value(), Some(&json!("second")));
    }
}
