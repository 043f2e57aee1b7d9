//! Last-Writer-Wins CRDTs for shared room state.
//!
//! Replicas converge without coordination because conflict resolution is a
//! strict total order over `(timestamp, origin)`: a higher timestamp wins,
//! and equal timestamps fall back to the lexicographically greater origin.
//! Origins are unique per node, so the order has no ties.
//!
//! ## Types
//!
//! - [`LwwRegister`] - single-cell register (topic-like values)
//! - [`LwwMap`] - nested, path-addressed map with tombstones; the primary
//!   data model for rooms

mod map;
mod register;

pub use map::{LwwMap, MapSnapshot, SnapshotEntry, SnapshotTombstone};
pub use register::LwwRegister;

/// Does `(t1, o1)` strictly beat `(t2, o2)` in the resolution order?
#[inline]
#[must_use]
pub fn beats(t1: f64, o1: &str, t2: f64, o2: &str) -> bool {
    t1 > t2 || (t1 == t2 && o1 > o2)
}
