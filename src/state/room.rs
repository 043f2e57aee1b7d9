//! Room - authoritative owner of one shared state document.
//!
//! A room holds the broker-side LWW map, the ordered member list, transient
//! presence, registered functions, and the subscriber set used to fan
//! messages out to connected members. All mutation goes through the methods
//! here; sessions hold `Arc<Room>` back-references only.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use collab_proto::{
    now_seconds, LwwMap, MapSnapshot, Operation, ServerMessage, UserInfo, VersionVector,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::Principal;
use crate::error::HandlerError;
use crate::perm::PermissionManager;

/// Node id the broker's replicas attribute nothing to: the broker never
/// originates operations, it only validates and replays.
const BROKER_NODE_ID: &str = "broker";

/// One connected member's delivery handle.
pub struct Subscriber {
    /// The member's user id (several connections may share one).
    pub user_id: String,
    /// Outbound queue of that connection.
    pub tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Why a function call did not produce a result.
#[derive(Debug, Error)]
pub enum CallFailure {
    #[error("no function named {0}")]
    NotFound(String),

    #[error("function {0} requires an authenticated caller")]
    AuthRequired(String),

    #[error("missing permission {0}")]
    PermissionDenied(String),

    #[error("function timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),
}

/// Everything a function handler gets to see.
pub struct FunctionContext {
    /// The room the call targets.
    pub room: Arc<Room>,
    /// The authenticated caller.
    pub caller: Principal,
    /// Arbitrary JSON arguments from the wire.
    pub args: Value,
}

/// A server-registered function.
#[async_trait]
pub trait RoomFunction: Send + Sync {
    /// Invoke the function. Runs under the broker's `function_timeout`.
    async fn call(&self, ctx: FunctionContext) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RoomFunction for FnHandler<F>
where
    F: Fn(FunctionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, ctx: FunctionContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// A registered function plus its authorization requirements.
pub struct FunctionEntry {
    handler: Arc<dyn RoomFunction>,
    /// Guests may not call this function.
    pub requires_auth: bool,
    /// Permissions the caller must hold (checked when a manager is
    /// configured).
    pub required_permissions: Vec<String>,
}

impl FunctionEntry {
    /// Wrap a handler with no requirements.
    pub fn new(handler: Arc<dyn RoomFunction>) -> Self {
        Self { handler, requires_auth: false, required_permissions: Vec::new() }
    }

    /// Wrap an async closure with no requirements.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(Arc::new(FnHandler(f)))
    }

    /// Require a non-guest caller.
    #[must_use]
    pub fn requires_auth(mut self, yes: bool) -> Self {
        self.requires_auth = yes;
        self
    }

    /// Require the caller to hold every listed permission.
    #[must_use]
    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.required_permissions = permissions;
        self
    }
}

/// A named bucket of shared state, membership, presence, and functions.
pub struct Room {
    /// Room id.
    pub id: String,
    crdt: Mutex<LwwMap>,
    version: Mutex<VersionVector>,
    members: RwLock<Vec<Principal>>,
    presence: RwLock<HashMap<String, Value>>,
    functions: RwLock<HashMap<String, Arc<FunctionEntry>>>,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    created_at: f64,
    updated_at: Mutex<f64>,
}

impl Room {
    /// Create an empty room.
    pub fn new(id: impl Into<String>) -> Self {
        let now = now_seconds();
        Self {
            id: id.into(),
            crdt: Mutex::new(LwwMap::new(BROKER_NODE_ID)),
            version: Mutex::new(VersionVector::new()),
            members: RwLock::new(Vec::new()),
            presence: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            created_at: now,
            updated_at: Mutex::new(now),
        }
    }

    /// Rebuild a room from a persisted snapshot.
    pub fn restore(id: impl Into<String>, snapshot: &MapSnapshot) -> Result<Self, HandlerError> {
        let room = Self::new(id);
        let map = LwwMap::from_snapshot(BROKER_NODE_ID, snapshot)?;
        {
            let mut version = room.version.lock();
            for op in map.log() {
                version.update(&op.origin, op.timestamp);
            }
        }
        *room.crdt.lock() = map;
        Ok(room)
    }

    /// Creation time, seconds since epoch.
    #[must_use]
    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    /// Last mutation time, seconds since epoch.
    #[must_use]
    pub fn updated_at(&self) -> f64 {
        *self.updated_at.lock()
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Validate and apply an operation, returning the canonical form for
    /// rebroadcast and whether it changed state (`false` = duplicate id).
    ///
    /// `server_timestamp` substitutes the broker clock for the emitter's
    /// when server-timestamp mode is on.
    pub fn apply_operation(
        &self,
        mut op: Operation,
        server_timestamp: Option<f64>,
    ) -> Result<(Operation, bool), HandlerError> {
        if let Some(ts) = server_timestamp {
            op.timestamp = ts;
        }
        let applied = self.crdt.lock().apply(&op)?;
        if applied {
            self.version.lock().update(&op.origin, op.timestamp);
            *self.updated_at.lock() = now_seconds();
        } else {
            debug!(room = %self.id, op_id = %op.id, "duplicate operation re-applied as no-op");
        }
        Ok((op, applied))
    }

    /// The materialized room value.
    #[must_use]
    pub fn value(&self) -> Value {
        self.crdt.lock().value()
    }

    /// Serialize the room state.
    #[must_use]
    pub fn snapshot(&self) -> MapSnapshot {
        self.crdt.lock().snapshot()
    }

    /// Snapshot plus operations newer than `since` (all of them when
    /// `since` is absent), for answering sync requests.
    #[must_use]
    pub fn sync_since(&self, since: Option<&VersionVector>) -> (MapSnapshot, Vec<Operation>) {
        let crdt = self.crdt.lock();
        let operations = match since {
            Some(vector) => crdt.log_since(vector),
            None => crdt.log().to_vec(),
        };
        (crdt.snapshot(), operations)
    }

    /// The room's version vector.
    #[must_use]
    pub fn version(&self) -> VersionVector {
        self.version.lock().clone()
    }

    // ------------------------------------------------------------------
    // Membership & presence
    // ------------------------------------------------------------------

    /// Add a member connection. Returns the initial state, the member list
    /// after the join, and whether the user is new to the room (first
    /// connection of that user id).
    pub fn join(
        &self,
        principal: &Principal,
        conn_id: u64,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> (MapSnapshot, Vec<UserInfo>, bool) {
        self.subscribers
            .write()
            .insert(conn_id, Subscriber { user_id: principal.id.clone(), tx });

        let newly_added = {
            let mut members = self.members.write();
            if members.iter().any(|m| m.id == principal.id) {
                false
            } else {
                members.push(principal.clone());
                true
            }
        };

        (self.snapshot(), self.users(), newly_added)
    }

    /// Drop a member connection. When it was the user's last connection in
    /// this room, the member and their presence are removed and the
    /// departed user id is returned for a `user_left` broadcast.
    pub fn leave(&self, conn_id: u64) -> Option<String> {
        let subscriber = self.subscribers.write().remove(&conn_id)?;
        let user_id = subscriber.user_id;

        let still_here =
            self.subscribers.read().values().any(|s| s.user_id == user_id);
        if still_here {
            return None;
        }

        self.members.write().retain(|m| m.id != user_id);
        self.presence.write().remove(&user_id);
        Some(user_id)
    }

    /// Current members in join order.
    #[must_use]
    pub fn users(&self) -> Vec<UserInfo> {
        self.members.read().iter().map(Principal::user_info).collect()
    }

    /// Is `user_id` currently a member?
    #[must_use]
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.read().iter().any(|m| m.id == user_id)
    }

    /// Number of live subscriber connections.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Shallow-merge `patch` into the member's presence entry. Non-object
    /// patches replace the entry wholesale.
    pub fn update_presence(&self, user_id: &str, patch: &Value) {
        let mut presence = self.presence.write();
        let slot = presence.entry(user_id.to_string()).or_insert(Value::Null);
        match (slot.as_object_mut(), patch.as_object()) {
            (Some(existing), Some(incoming)) => {
                for (key, value) in incoming {
                    existing.insert(key.clone(), value.clone());
                }
            }
            _ => *slot = patch.clone(),
        }
    }

    /// A member's current presence entry.
    #[must_use]
    pub fn presence_of(&self, user_id: &str) -> Option<Value> {
        self.presence.read().get(user_id).cloned()
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    /// Register (or replace) a function under `name`.
    pub fn register_function(&self, name: impl Into<String>, entry: FunctionEntry) {
        self.functions.write().insert(name.into(), Arc::new(entry));
    }

    /// Authorization check, then invoke under `limit`.
    pub async fn call(
        self: &Arc<Self>,
        name: &str,
        caller: &Principal,
        args: Value,
        perms: Option<&Arc<dyn PermissionManager>>,
        limit: Duration,
    ) -> Result<Value, CallFailure> {
        let entry = self
            .functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CallFailure::NotFound(name.to_string()))?;

        if entry.requires_auth && caller.is_guest() {
            return Err(CallFailure::AuthRequired(name.to_string()));
        }
        if let Some(perms) = perms {
            for permission in &entry.required_permissions {
                if !perms.check(caller, &self.id, permission).await {
                    return Err(CallFailure::PermissionDenied(permission.clone()));
                }
            }
        }

        let ctx =
            FunctionContext { room: Arc::clone(self), caller: caller.clone(), args };
        match tokio::time::timeout(limit, entry.handler.call(ctx)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(CallFailure::Failed(e.to_string())),
            Err(_) => Err(CallFailure::Timeout(limit)),
        }
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    fn deliver(subscriber: &Subscriber, msg: &ServerMessage) {
        if subscriber.tx.send(msg.clone()).is_err() {
            // Connection is tearing down; its cleanup will unsubscribe.
            warn!(user_id = %subscriber.user_id, "dropping message for closed connection");
        }
    }

    /// Send to every subscriber connection, including the sender's.
    pub fn broadcast(&self, msg: &ServerMessage) {
        for subscriber in self.subscribers.read().values() {
            Self::deliver(subscriber, msg);
        }
    }

    /// Send to every subscriber connection except `conn_id`.
    pub fn broadcast_except(&self, conn_id: u64, msg: &ServerMessage) {
        for (id, subscriber) in self.subscribers.read().iter() {
            if *id != conn_id {
                Self::deliver(subscriber, msg);
            }
        }
    }

    /// Send to every connection of one member. Returns the number of
    /// connections reached.
    pub fn send_to_user(&self, user_id: &str, msg: &ServerMessage) -> usize {
        let mut delivered = 0;
        for subscriber in self.subscribers.read().values() {
            if subscriber.user_id == user_id {
                Self::deliver(subscriber, msg);
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_proto::OpKind;
    use serde_json::json;

    fn member(id: &str) -> Principal {
        Principal::new(id)
    }

    fn subscribe(
        room: &Room,
        id: &str,
        conn_id: u64,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        room.join(&member(id), conn_id, tx);
        rx
    }

    fn op(origin: &str, timestamp: f64, path: &[&str], value: Value) -> Operation {
        let mut op = Operation::set(
            origin,
            path.iter().map(|s| s.to_string()).collect(),
            value,
        )
        .unwrap();
        op.timestamp = timestamp;
        op
    }

    #[test]
    fn test_apply_operation_updates_state_and_version() {
        let room = Room::new("lobby");
        let (canonical, applied) =
            room.apply_operation(op("a", 5.0, &["x"], json!(1)), None).unwrap();
        assert!(applied);
        assert_eq!(canonical.timestamp, 5.0);
        assert_eq!(room.value(), json!({"x": 1}));
        assert_eq!(room.version().get("a"), 5.0);
    }

    #[test]
    fn test_server_timestamp_substitution() {
        let room = Room::new("lobby");
        let (canonical, _) =
            room.apply_operation(op("a", 5.0, &["x"], json!(1)), Some(99.5)).unwrap();
        assert_eq!(canonical.timestamp, 99.5);
        assert_eq!(room.version().get("a"), 99.5);
    }

    #[test]
    fn test_duplicate_operation_is_noop_but_returned() {
        let room = Room::new("lobby");
        let first = op("a", 5.0, &["x"], json!(1));
        room.apply_operation(first.clone(), None).unwrap();
        let (_, applied) = room.apply_operation(first, None).unwrap();
        assert!(!applied);
        assert_eq!(room.value(), json!({"x": 1}));
    }

    #[test]
    fn test_join_dedups_by_user_id() {
        let room = Room::new("lobby");
        let _rx1 = subscribe(&room, "alice", 1);
        let (_, users, newly) = {
            let (tx, _rx) = mpsc::unbounded_channel();
            room.join(&member("alice"), 2, tx);
            let (tx2, _rx2) = mpsc::unbounded_channel();
            room.join(&member("bob"), 3, tx2)
        };
        assert!(newly);
        assert_eq!(users.len(), 2);
        assert_eq!(room.subscriber_count(), 3);
    }

    #[test]
    fn test_leave_removes_member_only_on_last_connection() {
        let room = Room::new("lobby");
        let _rx1 = subscribe(&room, "alice", 1);
        let _rx2 = subscribe(&room, "alice", 2);
        room.update_presence("alice", &json!({"cursor": [0, 0]}));

        assert_eq!(room.leave(1), None);
        assert!(room.is_member("alice"));
        assert!(room.presence_of("alice").is_some());

        assert_eq!(room.leave(2).as_deref(), Some("alice"));
        assert!(!room.is_member("alice"));
        assert!(room.presence_of("alice").is_none());
    }

    #[test]
    fn test_presence_shallow_merge() {
        let room = Room::new("lobby");
        room.update_presence("alice", &json!({"cursor": [1, 2], "color": "red"}));
        room.update_presence("alice", &json!({"cursor": [3, 4]}));
        assert_eq!(
            room.presence_of("alice").unwrap(),
            json!({"cursor": [3, 4], "color": "red"})
        );

        // A non-object patch replaces wholesale.
        room.update_presence("alice", &json!("away"));
        assert_eq!(room.presence_of("alice").unwrap(), json!("away"));
    }

    #[test]
    fn test_broadcast_reaches_all_but_except_skips_sender() {
        let room = Room::new("lobby");
        let mut rx1 = subscribe(&room, "alice", 1);
        let mut rx2 = subscribe(&room, "bob", 2);

        room.broadcast(&ServerMessage::Pong);
        assert_eq!(rx1.try_recv().unwrap(), ServerMessage::Pong);
        assert_eq!(rx2.try_recv().unwrap(), ServerMessage::Pong);

        room.broadcast_except(1, &ServerMessage::Pong);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), ServerMessage::Pong);
    }

    #[test]
    fn test_send_to_user_hits_every_connection_of_that_user() {
        let room = Room::new("lobby");
        let mut rx1 = subscribe(&room, "alice", 1);
        let mut rx2 = subscribe(&room, "alice", 2);
        let mut rx3 = subscribe(&room, "bob", 3);

        let delivered = room.send_to_user("alice", &ServerMessage::Pong);
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_dispatch_and_errors() {
        let room = Arc::new(Room::new("lobby"));
        room.register_function(
            "echo",
            FunctionEntry::from_fn(|ctx| async move { Ok(ctx.args) }),
        );
        room.register_function(
            "secure",
            FunctionEntry::from_fn(|_ctx| async move { Ok(json!("ok")) })
                .requires_auth(true),
        );

        let caller = member("alice");
        let result = room
            .call("echo", &caller, json!({"x": 1}), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 1}));

        assert!(matches!(
            room.call("nope", &caller, json!(null), None, Duration::from_secs(1)).await,
            Err(CallFailure::NotFound(_))
        ));

        let guest = Principal {
            id: "g".into(),
            name: None,
            roles: vec![crate::auth::GUEST_ROLE.into()],
        };
        assert!(matches!(
            room.call("secure", &guest, json!(null), None, Duration::from_secs(1)).await,
            Err(CallFailure::AuthRequired(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout() {
        let room = Arc::new(Room::new("lobby"));
        room.register_function(
            "slow",
            FunctionEntry::from_fn(|_ctx| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!("too late"))
            }),
        );

        let result = room
            .call("slow", &member("a"), json!(null), None, Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(CallFailure::Timeout(_))));
    }

    #[test]
    fn test_restore_round_trip() {
        let room = Room::new("lobby");
        room.apply_operation(op("a", 1.0, &["doc"], json!({"title": "t"})), None).unwrap();
        let snap = room.snapshot();

        let restored = Room::restore("lobby", &snap).unwrap();
        assert_eq!(restored.value(), room.value());
        assert_eq!(restored.version().get("a"), 1.0);
    }

    #[test]
    fn test_sync_since_filters() {
        let room = Room::new("lobby");
        room.apply_operation(op("a", 1.0, &["x"], json!(1)), None).unwrap();
        room.apply_operation(op("a", 5.0, &["x"], json!(2)), None).unwrap();

        let mut since = VersionVector::new();
        since.update("a", 1.0);
        let (_, ops) = room.sync_since(Some(&since));
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].timestamp, 5.0);

        let (_, all) = room.sync_since(None);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_unsupported_kind_rejected_without_state_damage() {
        let room = Room::new("lobby");
        room.apply_operation(op("a", 1.0, &["x"], json!(1)), None).unwrap();

        // Hand-build an op that claims an unsupported shape: a delete
        // carrying a value fails validation inside the CRDT.
        let mut bad = op("a", 2.0, &["x"], json!(2));
        bad.kind = OpKind::Delete;
        assert!(room.apply_operation(bad, None).is_err());
        assert_eq!(room.value(), json!({"x": 1}));
    }
}
