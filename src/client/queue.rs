//! Offline operation queue.
//!
//! Operations emitted while disconnected are queued here and replayed in
//! FIFO order after reconnect. The queue persists through the pluggable
//! [`Storage`] under an explicit namespace; a missing or failing backend
//! degrades the queue to memory-only, never to an error the caller sees.
//!
//! The persisted form is untrusted: every entry is structurally checked
//! and its operation re-decoded at load time, and stale or corrupt entries
//! are dropped and the file rewritten.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use collab_proto::{now_seconds, Operation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::storage::Storage;

/// Hard cap on queued entries; the oldest is dropped on overflow.
pub const MAX_QUEUE_ENTRIES: usize = 1000;

/// Entries older than this are pruned at load and on [`OfflineQueue::prune_old`].
pub const MAX_ENTRY_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// One queued operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOp {
    /// Room the operation targets.
    pub room_id: String,
    /// The operation itself.
    pub op: Operation,
    /// When it was enqueued, seconds since epoch.
    pub queued_at: f64,
}

/// Durable FIFO of pending operations, one per client.
pub struct OfflineQueue {
    namespace: String,
    storage: Option<Arc<dyn Storage>>,
    items: VecDeque<QueuedOp>,
}

impl OfflineQueue {
    /// Load the queue for `namespace`, validating every persisted entry.
    pub async fn load(storage: Option<Arc<dyn Storage>>, namespace: impl Into<String>) -> Self {
        let mut queue =
            Self { namespace: namespace.into(), storage, items: VecDeque::new() };

        let Some(storage) = queue.storage.clone() else { return queue };
        let blob = match storage.load(&queue.key()).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return queue,
            Err(e) => {
                warn!(error = %e, "offline queue load failed, continuing in memory");
                return queue;
            }
        };

        let raw: Vec<Value> = match serde_json::from_slice(&blob) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "offline queue file corrupt, discarding");
                queue.persist().await;
                return queue;
            }
        };

        let now = now_seconds();
        let total = raw.len();
        for entry in raw {
            if let Some(item) = validate_entry(entry, now) {
                queue.items.push_back(item);
            }
        }
        while queue.items.len() > MAX_QUEUE_ENTRIES {
            queue.items.pop_front();
        }

        let dropped = total - queue.items.len();
        if dropped > 0 {
            warn!(dropped, kept = queue.items.len(), "discarded bad or stale queue entries");
            queue.persist().await;
        }
        queue
    }

    fn key(&self) -> String {
        format!("{}/offline-queue", self.namespace)
    }

    /// Write the current queue. Storage failures are logged; the in-memory
    /// queue stays authoritative.
    async fn persist(&self) {
        let Some(storage) = &self.storage else { return };
        let blob = match serde_json::to_vec(&self.items) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "cannot serialize offline queue");
                return;
            }
        };
        if let Err(e) = storage.save(&self.key(), &blob).await {
            warn!(error = %e, "offline queue write failed, continuing in memory");
        }
    }

    /// Append an operation. On overflow the oldest entry is dropped.
    pub async fn enqueue(&mut self, room_id: impl Into<String>, op: Operation) {
        self.items.push_back(QueuedOp {
            room_id: room_id.into(),
            op,
            queued_at: now_seconds(),
        });
        while self.items.len() > MAX_QUEUE_ENTRIES {
            let dropped = self.items.pop_front();
            debug!(op_id = ?dropped.map(|q| q.op.id), "offline queue full, dropped oldest");
        }
        self.persist().await;
    }

    /// The oldest entry, if any.
    #[must_use]
    pub fn peek(&self) -> Option<&QueuedOp> {
        self.items.front()
    }

    /// Copy of every entry, FIFO order.
    #[must_use]
    pub fn peek_all(&self) -> Vec<QueuedOp> {
        self.items.iter().cloned().collect()
    }

    /// Remove and return every entry for `room_id`, preserving order.
    pub async fn drain(&mut self, room_id: &str) -> Vec<QueuedOp> {
        let mut drained = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if item.room_id == room_id {
                drained.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        if !drained.is_empty() {
            self.persist().await;
        }
        drained
    }

    /// Remove and return everything, FIFO order.
    pub async fn drain_all(&mut self) -> Vec<QueuedOp> {
        let drained: Vec<QueuedOp> = self.items.drain(..).collect();
        if !drained.is_empty() {
            self.persist().await;
        }
        drained
    }

    /// Drop every entry for `room_id`.
    pub async fn clear(&mut self, room_id: &str) {
        let before = self.items.len();
        self.items.retain(|item| item.room_id != room_id);
        if self.items.len() != before {
            self.persist().await;
        }
    }

    /// Drop everything.
    pub async fn clear_all(&mut self) {
        if !self.items.is_empty() {
            self.items.clear();
            self.persist().await;
        }
    }

    /// Total queued entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// Queued entries for one room.
    #[must_use]
    pub fn size_for_room(&self, room_id: &str) -> usize {
        self.items.iter().filter(|item| item.room_id == room_id).count()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop entries older than `max_age`. Returns how many were dropped.
    pub async fn prune_old(&mut self, max_age: Duration) -> usize {
        let cutoff = now_seconds() - max_age.as_secs_f64();
        let before = self.items.len();
        self.items.retain(|item| item.queued_at >= cutoff);
        let dropped = before - self.items.len();
        if dropped > 0 {
            debug!(dropped, "pruned stale offline queue entries");
            self.persist().await;
        }
        dropped
    }
}

/// Structural check plus operation decode for one persisted entry.
fn validate_entry(raw: Value, now: f64) -> Option<QueuedOp> {
    let obj = raw.as_object()?;
    let room_id = obj.get("room_id")?.as_str()?;
    if room_id.is_empty() {
        return None;
    }
    let queued_at = obj.get("queued_at")?.as_f64()?;
    if !queued_at.is_finite() || now - queued_at > MAX_ENTRY_AGE.as_secs_f64() {
        return None;
    }
    let op = Operation::from_json(obj.get("op")?.clone()).ok()?;
    Some(QueuedOp { room_id: room_id.to_string(), op, queued_at })
}
