//! Version vectors: per-origin high-water marks for partial sync.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Maps each origin node id to the highest operation timestamp observed
/// from it. Used by sync requests to ask only for what is missing.
///
/// The only invariant is per-origin monotonicity: [`VersionVector::update`]
/// and [`VersionVector::merge`] never move an entry backwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
    entries: HashMap<String, f64>,
}

impl VersionVector {
    /// Create an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation from `origin` at `timestamp` (monotonic max).
    pub fn update(&mut self, origin: &str, timestamp: f64) {
        let slot = self.entries.entry(origin.to_string()).or_insert(0.0);
        if timestamp > *slot {
            *slot = timestamp;
        }
    }

    /// Pointwise max with another vector.
    pub fn merge(&mut self, other: &Self) {
        for (origin, &timestamp) in &other.entries {
            self.update(origin, timestamp);
        }
    }

    /// Highest timestamp observed from `origin`, or 0.0 if never seen.
    #[must_use]
    pub fn get(&self, origin: &str) -> f64 {
        self.entries.get(origin).copied().unwrap_or(0.0)
    }

    /// Number of origins tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no origin has been observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy out as a plain map (wire form).
    #[must_use]
    pub fn to_map(&self) -> HashMap<String, f64> {
        self.entries.clone()
    }

    /// Build from a plain map (wire form). Non-finite stamps are dropped.
    #[must_use]
    pub fn from_map(map: HashMap<String, f64>) -> Self {
        let entries = map.into_iter().filter(|(_, t)| t.is_finite()).collect();
        Self { entries }
    }
}
