//! Operations: immutable records of a single CRDT mutation.
//!
//! An operation carries everything a replica needs to replay the mutation
//! deterministically: a globally unique id, the emitter's wall-clock
//! timestamp, the emitting node id (`node_id` on the wire), the addressed
//! path, the kind, and the payload for sets. Equality is by id only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ProtoError, Result};
use crate::validate::{check_path, check_value, check_value_size};

/// Wall-clock seconds since the Unix epoch, with sub-second precision.
#[must_use]
pub fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// The kind of mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// Write a value at a path.
    Set,
    /// Tombstone a path.
    Delete,
}

impl OpKind {
    /// The wire string for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Delete => "delete",
        }
    }
}

/// One CRDT mutation.
///
/// Wire shape: `{id, timestamp, node_id, path: [string], op_type:
/// "set"|"delete", value?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Globally unique operation id.
    pub id: Uuid,
    /// Emitter wall-clock seconds since epoch. Advisory: a broker in
    /// server-timestamp mode substitutes its own monotonic value.
    pub timestamp: f64,
    /// Node id of the emitting participant. Breaks timestamp ties.
    #[serde(rename = "node_id")]
    pub origin: String,
    /// Ordered path segments addressed by this operation.
    pub path: Vec<String>,
    /// Mutation kind.
    #[serde(rename = "op_type")]
    pub kind: OpKind,
    /// Payload, present for `set`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Operation {}

impl Operation {
    /// Build a validated `set` operation stamped with a fresh id and the
    /// local wall clock.
    pub fn set(origin: impl Into<String>, path: Vec<String>, value: Value) -> Result<Self> {
        let op = Self {
            id: Uuid::new_v4(),
            timestamp: now_seconds(),
            origin: origin.into(),
            path,
            kind: OpKind::Set,
            value: Some(value),
        };
        op.validate()?;
        Ok(op)
    }

    /// Build a validated `delete` operation.
    pub fn delete(origin: impl Into<String>, path: Vec<String>) -> Result<Self> {
        let op = Self {
            id: Uuid::new_v4(),
            timestamp: now_seconds(),
            origin: origin.into(),
            path,
            kind: OpKind::Delete,
            value: None,
        };
        op.validate()?;
        Ok(op)
    }

    /// Structural validation: path safety, value safety and size, and
    /// kind/payload agreement. Called by the constructors, by [`Self::from_json`],
    /// and again by every CRDT apply (defense in depth).
    pub fn validate(&self) -> Result<()> {
        check_path(&self.path)?;
        if self.origin.is_empty() {
            return Err(ProtoError::InvalidOperation { reason: "empty node_id".into() });
        }
        if !self.timestamp.is_finite() || self.timestamp < 0.0 {
            return Err(ProtoError::InvalidOperation {
                reason: format!("non-finite or negative timestamp {}", self.timestamp),
            });
        }
        match self.kind {
            OpKind::Set => {
                let value = self.value.as_ref().ok_or_else(|| ProtoError::InvalidOperation {
                    reason: "set operation without value".into(),
                })?;
                check_value(value)?;
                check_value_size(value)?;
            }
            OpKind::Delete => {
                if self.value.is_some() {
                    return Err(ProtoError::InvalidOperation {
                        reason: "delete operation carries a value".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Encode to the wire JSON value.
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode from a wire JSON value, re-validating. A malformed or
    /// dangerous operation is rejected here, before it can touch a CRDT.
    pub fn from_json(value: Value) -> Result<Self> {
        let op: Self = serde_json::from_value(value).map_err(|e| ProtoError::InvalidOperation {
            reason: format!("malformed operation: {e}"),
        })?;
        op.validate()?;
        Ok(op)
    }
}
