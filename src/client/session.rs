//! Client session engine.
//!
//! Owns the WebSocket connection lifecycle (auth-first handshake,
//! keepalive pings, exponential-backoff reconnect), a reference-counted
//! room registry with one local CRDT replica per room, the offline
//! operation queue, function-call correlation, and the listener sets.
//!
//! All state lives behind short-lived sync locks; the driver task is the
//! only place that touches the socket, so per-socket FIFO ordering holds
//! for both directions.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use collab_proto::{
    codec, ClientMessage, ErrorCode, LwwMap, Operation, ProtoError, ServerMessage, UserInfo,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::queue::OfflineQueue;
use crate::client::screenshare::{
    MediaSource, PeerConnector, ScreenShareCoordinator, SignalFn,
};
use crate::storage::Storage;

/// Function-call and connect timeout, mirroring the broker default.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Keepalive ping interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Reconnect attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Ws, WsMessage>;
type WsSource = SplitStream<Ws>;
type ReadySender = oneshot::Sender<Result<String, ClientError>>;

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("not joined to room {0}")]
    NotJoined(String),

    #[error("timed out")]
    Timeout,

    #[error("call failed: {0}")]
    CallFailed(String),

    #[error("disconnected")]
    Disconnected,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Supplies the auth token at (re)connect time, so rotated credentials are
/// picked up without rebuilding the client.
pub trait TokenProvider: Send + Sync {
    /// The token to present.
    fn token(&self) -> String;
}

/// A fixed token.
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn token(&self) -> String {
        self.0.clone()
    }
}

/// Client construction parameters.
pub struct ClientConfig {
    /// WebSocket URL, e.g. `ws://host:8900/ws`. The token is never put in
    /// the URL; it travels in the first message.
    pub url: String,
    /// Credential source.
    pub token: Arc<dyn TokenProvider>,
    /// Optional descriptor for this participant, used as the local
    /// identity fallback (presence keys, screen-share self id) until the
    /// broker assigns a user id at authentication.
    pub user: Option<UserInfo>,
    /// Offline queue persistence, if any.
    pub storage: Option<Arc<dyn Storage>>,
    /// Namespace scoping this client's queue in storage.
    pub queue_namespace: String,
}

impl ClientConfig {
    /// Minimal config: a URL and a token source, memory-only queue.
    pub fn new(url: impl Into<String>, token: Arc<dyn TokenProvider>) -> Self {
        Self {
            url: url.into(),
            token,
            user: None,
            storage: None,
            queue_namespace: "collabkit".to_string(),
        }
    }

    /// Persist the offline queue through `storage` under `namespace`.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn Storage>, namespace: impl Into<String>) -> Self {
        self.storage = Some(storage);
        self.queue_namespace = namespace.into();
        self
    }

    /// Describe this participant ahead of authentication.
    #[must_use]
    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }
}

/// Connection lifecycle events delivered to connection listeners.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Authenticated and live.
    Connected {
        /// Assigned user id.
        user_id: String,
    },
    /// The transport dropped; reconnect may follow.
    Disconnected,
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// The client gave up (auth rejected or attempts exhausted).
    Failed {
        /// Why.
        reason: String,
    },
    /// The broker sent a wire error.
    ServerError {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
        /// Room concerned, when applicable.
        room_id: Option<String>,
    },
}

/// A state change visible to state listeners.
#[derive(Debug, Clone)]
pub struct StateEvent {
    /// The room.
    pub room_id: String,
    /// Path that changed; empty for whole-state replacement after sync.
    pub path: Vec<String>,
    /// New value at the path, `None` for deletes.
    pub value: Option<Value>,
    /// Node id of the write's origin.
    pub origin: String,
}

/// A presence change visible to presence listeners.
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    /// The room.
    pub room_id: String,
    /// Whose presence changed.
    pub user_id: String,
    /// The patch as received.
    pub data: Value,
}

/// Handle for removing a listener.
pub type ListenerId = u64;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Disconnected,
    Connecting,
    Connected,
}

struct RoomEntry {
    refcount: usize,
    crdt: LwwMap,
    members: Vec<UserInfo>,
    presence: HashMap<String, Value>,
    state_listeners: HashMap<ListenerId, Callback<StateEvent>>,
    presence_listeners: HashMap<ListenerId, Callback<PresenceEvent>>,
    op_listeners: HashMap<ListenerId, Callback<Operation>>,
}

impl RoomEntry {
    fn new(node_id: &str) -> Self {
        Self {
            refcount: 0,
            crdt: LwwMap::new(node_id),
            members: Vec::new(),
            presence: HashMap::new(),
            state_listeners: HashMap::new(),
            presence_listeners: HashMap::new(),
            op_listeners: HashMap::new(),
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    node_id: String,
    user_id: Mutex<Option<String>>,
    status: Mutex<Status>,
    rooms: Mutex<HashMap<String, RoomEntry>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, ClientError>>>>,
    queue: tokio::sync::Mutex<OfflineQueue>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    intentional: AtomicBool,
    conn_listeners: Mutex<HashMap<ListenerId, Callback<ConnectionEvent>>>,
    listener_seq: AtomicU64,
    screenshare: Mutex<HashMap<String, Arc<Mutex<ScreenShareCoordinator>>>>,
}

/// Invoke listeners outside any lock; one panicking listener never stops
/// the rest.
fn notify_all<E>(callbacks: Vec<Callback<E>>, event: &E) {
    for cb in callbacks {
        if catch_unwind(AssertUnwindSafe(|| cb(event))).is_err() {
            warn!("listener panicked, continuing dispatch");
        }
    }
}

fn shallow_merge(slot: &mut Value, patch: &Value) {
    match (slot.as_object_mut(), patch.as_object()) {
        (Some(existing), Some(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key.clone(), value.clone());
            }
        }
        _ => *slot = patch.clone(),
    }
}

impl ClientInner {
    fn next_listener_id(&self) -> ListenerId {
        self.listener_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn is_connected(&self) -> bool {
        *self.status.lock() == Status::Connected
    }

    fn conn_callbacks(&self) -> Vec<Callback<ConnectionEvent>> {
        self.conn_listeners.lock().values().cloned().collect()
    }

    fn notify_conn(&self, event: &ConnectionEvent) {
        notify_all(self.conn_callbacks(), event);
    }

    fn state_callbacks(&self, room_id: &str) -> Vec<Callback<StateEvent>> {
        self.rooms
            .lock()
            .get(room_id)
            .map(|r| r.state_listeners.values().cloned().collect())
            .unwrap_or_default()
    }

    fn presence_callbacks(&self, room_id: &str) -> Vec<Callback<PresenceEvent>> {
        self.rooms
            .lock()
            .get(room_id)
            .map(|r| r.presence_listeners.values().cloned().collect())
            .unwrap_or_default()
    }

    fn op_callbacks(&self, room_id: &str) -> Vec<Callback<Operation>> {
        self.rooms
            .lock()
            .get(room_id)
            .map(|r| r.op_listeners.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Try to hand a message to the driver. `false` means not connected.
    fn try_send(&self, msg: ClientMessage) -> bool {
        match self.cmd_tx.lock().as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    fn reject_pending(&self) {
        let pending: Vec<_> = {
            let mut map = self.pending.lock();
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(ClientError::Disconnected));
        }
    }

    fn coordinator(&self, room_id: &str) -> Option<Arc<Mutex<ScreenShareCoordinator>>> {
        self.screenshare.lock().get(room_id).cloned()
    }

    /// Local identity: the broker-assigned user id once authenticated,
    /// the configured user descriptor before that, the node id as a last
    /// resort.
    fn self_identity(&self) -> String {
        if let Some(user_id) = self.user_id.lock().clone() {
            return user_id;
        }
        if let Some(user) = &self.config.user {
            return user.id.clone();
        }
        self.node_id.clone()
    }

    fn member_ids(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .lock()
            .get(room_id)
            .map(|r| r.members.iter().map(|u| u.id.clone()).collect())
            .unwrap_or_default()
    }
}

/// The client session: local CRDT mirrors, offline queue, reconnect loop.
pub struct CollabClient {
    inner: Arc<ClientInner>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CollabClient {
    /// Build a client, loading (and validating) any persisted offline
    /// queue for the configured namespace.
    pub async fn new(config: ClientConfig) -> Self {
        let queue =
            OfflineQueue::load(config.storage.clone(), config.queue_namespace.clone()).await;
        let inner = Arc::new(ClientInner {
            config,
            node_id: Uuid::new_v4().to_string(),
            user_id: Mutex::new(None),
            status: Mutex::new(Status::Disconnected),
            rooms: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            queue: tokio::sync::Mutex::new(queue),
            cmd_tx: Mutex::new(None),
            intentional: AtomicBool::new(false),
            conn_listeners: Mutex::new(HashMap::new()),
            listener_seq: AtomicU64::new(1),
            screenshare: Mutex::new(HashMap::new()),
        });
        Self { inner, driver: Mutex::new(None) }
    }

    /// This client's CRDT node id (operation origin).
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// The user id assigned at authentication, once connected.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.inner.user_id.lock().clone()
    }

    /// Is the session live?
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the transport and authenticate. Resolves with the assigned
    /// user id; afterwards the driver keeps the session alive through
    /// reconnects until [`Self::disconnect`].
    pub async fn connect(&self) -> Result<String, ClientError> {
        if let Some(user_id) = self.user_id() {
            if self.is_connected() {
                return Ok(user_id);
            }
        }
        self.inner.intentional.store(false, Ordering::SeqCst);
        if let Some(stale) = self.driver.lock().take() {
            stale.abort();
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(drive(inner, ready_tx));
        *self.driver.lock() = Some(handle);

        match tokio::time::timeout(CALL_TIMEOUT, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Intentional disconnect: suppresses reconnect and rejects pending
    /// calls.
    pub async fn disconnect(&self) {
        self.inner.intentional.store(true, Ordering::SeqCst);
        *self.inner.cmd_tx.lock() = None;
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
        *self.inner.status.lock() = Status::Disconnected;
        self.inner.reject_pending();
        self.inner.notify_conn(&ConnectionEvent::Disconnected);
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    /// Join a room. Reference-counted: only the first join sends the wire
    /// `join`; while offline the registry entry alone is created and the
    /// join goes out on (re)connect.
    pub fn join(&self, room_id: &str) {
        let first = {
            let mut rooms = self.inner.rooms.lock();
            let entry = rooms
                .entry(room_id.to_string())
                .or_insert_with(|| RoomEntry::new(&self.inner.node_id));
            entry.refcount += 1;
            entry.refcount == 1
        };
        if first {
            self.inner.try_send(ClientMessage::Join { room_id: room_id.to_string() });
        }
    }

    /// Leave a room. Only the last leave sends the wire `leave` and drops
    /// the local replica.
    pub fn leave(&self, room_id: &str) {
        let last = {
            let mut rooms = self.inner.rooms.lock();
            match rooms.get_mut(room_id) {
                Some(entry) => {
                    entry.refcount = entry.refcount.saturating_sub(1);
                    if entry.refcount == 0 {
                        rooms.remove(room_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if last {
            self.inner.screenshare.lock().remove(room_id);
            self.inner.try_send(ClientMessage::Leave { room_id: room_id.to_string() });
        }
    }

    /// Rooms currently held in the registry.
    #[must_use]
    pub fn joined_rooms(&self) -> Vec<String> {
        self.inner.rooms.lock().keys().cloned().collect()
    }

    /// Current member list of a room.
    #[must_use]
    pub fn members(&self, room_id: &str) -> Vec<UserInfo> {
        self.inner
            .rooms
            .lock()
            .get(room_id)
            .map(|r| r.members.clone())
            .unwrap_or_default()
    }

    /// Current presence map of a room.
    #[must_use]
    pub fn presence(&self, room_id: &str) -> HashMap<String, Value> {
        self.inner
            .rooms
            .lock()
            .get(room_id)
            .map(|r| r.presence.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Write a value into the room's shared state. The local replica
    /// applies synchronously (listeners fire before this returns); the
    /// operation is forwarded to the broker or queued offline.
    pub async fn set_at(
        &self,
        room_id: &str,
        path: Vec<String>,
        value: Value,
    ) -> Result<(), ClientError> {
        let op = {
            let mut rooms = self.inner.rooms.lock();
            let entry = rooms
                .get_mut(room_id)
                .ok_or_else(|| ClientError::NotJoined(room_id.to_string()))?;
            entry.crdt.set(path.clone(), value.clone())?
        };
        notify_all(
            self.inner.state_callbacks(room_id),
            &StateEvent {
                room_id: room_id.to_string(),
                path,
                value: Some(value),
                origin: self.inner.node_id.clone(),
            },
        );
        self.forward_or_enqueue(room_id, op).await;
        Ok(())
    }

    /// Delete a path from the room's shared state. Symmetric to
    /// [`Self::set_at`].
    pub async fn delete_at(&self, room_id: &str, path: Vec<String>) -> Result<(), ClientError> {
        let op = {
            let mut rooms = self.inner.rooms.lock();
            let entry = rooms
                .get_mut(room_id)
                .ok_or_else(|| ClientError::NotJoined(room_id.to_string()))?;
            entry.crdt.delete(path.clone())?
        };
        notify_all(
            self.inner.state_callbacks(room_id),
            &StateEvent {
                room_id: room_id.to_string(),
                path,
                value: None,
                origin: self.inner.node_id.clone(),
            },
        );
        self.forward_or_enqueue(room_id, op).await;
        Ok(())
    }

    /// Read from the local replica's materialized value.
    #[must_use]
    pub fn get_at(&self, room_id: &str, path: &[String]) -> Option<Value> {
        self.inner.rooms.lock().get(room_id).and_then(|r| r.crdt.get(path))
    }

    async fn forward_or_enqueue(&self, room_id: &str, op: Operation) {
        let sent = self
            .inner
            .try_send(ClientMessage::Operation { room_id: room_id.to_string(), op: op.clone() });
        if !sent {
            debug!(room = room_id, op_id = %op.id, "offline, queueing operation");
            self.inner.queue.lock().await.enqueue(room_id, op).await;
        }
    }

    /// Entries currently in the offline queue.
    pub async fn offline_queue_size(&self) -> usize {
        self.inner.queue.lock().await.size()
    }

    // ------------------------------------------------------------------
    // Presence & calls
    // ------------------------------------------------------------------

    /// Publish a presence patch: stored locally, presence listeners fire,
    /// and the patch goes to the broker when connected. Presence is
    /// transient; it is never queued offline.
    pub fn update_presence(&self, room_id: &str, data: Value) -> Result<(), ClientError> {
        let user_id = self.inner.self_identity();
        {
            let mut rooms = self.inner.rooms.lock();
            let entry = rooms
                .get_mut(room_id)
                .ok_or_else(|| ClientError::NotJoined(room_id.to_string()))?;
            let slot = entry.presence.entry(user_id.clone()).or_insert(Value::Null);
            shallow_merge(slot, &data);
        }
        notify_all(
            self.inner.presence_callbacks(room_id),
            &PresenceEvent { room_id: room_id.to_string(), user_id, data: data.clone() },
        );
        self.inner.try_send(ClientMessage::Presence { room_id: room_id.to_string(), data });
        Ok(())
    }

    /// Invoke a server-registered function and await its result.
    /// Correlation is by a generated call id; the call times out after
    /// [`CALL_TIMEOUT`] and is rejected on disconnect.
    pub async fn call(
        &self,
        room_id: &str,
        function_name: &str,
        args: Value,
    ) -> Result<Value, ClientError> {
        if !self.inner.rooms.lock().contains_key(room_id) {
            return Err(ClientError::NotJoined(room_id.to_string()));
        }
        let call_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(call_id.clone(), tx);

        let sent = self.inner.try_send(ClientMessage::Call {
            room_id: room_id.to_string(),
            call_id: call_id.clone(),
            function_name: function_name.to_string(),
            args,
        });
        if !sent {
            self.inner.pending.lock().remove(&call_id);
            return Err(ClientError::NotConnected);
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().remove(&call_id);
                Err(ClientError::Timeout)
            }
        }
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Listen for connection lifecycle events.
    pub fn on_connection(
        &self,
        cb: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.inner.next_listener_id();
        self.inner.conn_listeners.lock().insert(id, Arc::new(cb));
        id
    }

    /// Remove a connection listener.
    pub fn off_connection(&self, id: ListenerId) {
        self.inner.conn_listeners.lock().remove(&id);
    }

    /// Listen for state changes in a room. The registry entry is created
    /// on demand so listeners can attach before the first join.
    pub fn on_state(
        &self,
        room_id: &str,
        cb: impl Fn(&StateEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.inner.next_listener_id();
        let mut rooms = self.inner.rooms.lock();
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RoomEntry::new(&self.inner.node_id))
            .state_listeners
            .insert(id, Arc::new(cb));
        id
    }

    /// Remove a state listener.
    pub fn off_state(&self, room_id: &str, id: ListenerId) {
        if let Some(entry) = self.inner.rooms.lock().get_mut(room_id) {
            entry.state_listeners.remove(&id);
        }
    }

    /// Listen for presence changes in a room.
    pub fn on_presence(
        &self,
        room_id: &str,
        cb: impl Fn(&PresenceEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.inner.next_listener_id();
        let mut rooms = self.inner.rooms.lock();
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RoomEntry::new(&self.inner.node_id))
            .presence_listeners
            .insert(id, Arc::new(cb));
        id
    }

    /// Remove a presence listener.
    pub fn off_presence(&self, room_id: &str, id: ListenerId) {
        if let Some(entry) = self.inner.rooms.lock().get_mut(room_id) {
            entry.presence_listeners.remove(&id);
        }
    }

    /// Listen for remote operations applied to a room.
    pub fn on_operation(
        &self,
        room_id: &str,
        cb: impl Fn(&Operation) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.inner.next_listener_id();
        let mut rooms = self.inner.rooms.lock();
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RoomEntry::new(&self.inner.node_id))
            .op_listeners
            .insert(id, Arc::new(cb));
        id
    }

    /// Remove an operation listener.
    pub fn off_operation(&self, room_id: &str, id: ListenerId) {
        if let Some(entry) = self.inner.rooms.lock().get_mut(room_id) {
            entry.op_listeners.remove(&id);
        }
    }

    // ------------------------------------------------------------------
    // Screen share
    // ------------------------------------------------------------------

    /// Attach a screen-share coordinator to a room. Signaling rides this
    /// client's socket; broker share/RTC messages for the room are routed
    /// into the coordinator.
    pub fn attach_screenshare(
        &self,
        room_id: &str,
        media: Arc<dyn MediaSource>,
        connector: Arc<dyn PeerConnector>,
    ) -> Arc<Mutex<ScreenShareCoordinator>> {
        let self_id = self.inner.self_identity();
        let weak = Arc::downgrade(&self.inner);
        let signal: SignalFn = Arc::new(move |msg| {
            if let Some(inner) = weak.upgrade() {
                if !inner.try_send(msg) {
                    warn!("dropping signaling message while disconnected");
                }
            }
        });
        let coordinator = Arc::new(Mutex::new(ScreenShareCoordinator::new(
            room_id, self_id, media, connector, signal,
        )));
        self.inner
            .screenshare
            .lock()
            .insert(room_id.to_string(), Arc::clone(&coordinator));
        coordinator
    }
}

// ----------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------

enum SessionEnd {
    Intentional,
    Dropped { authenticated: bool },
    AuthRejected(String),
}

async fn drive(inner: Arc<ClientInner>, ready_tx: ReadySender) {
    let mut ready = Some(ready_tx);
    let mut attempt: u32 = 0;
    loop {
        if inner.intentional.load(Ordering::SeqCst) {
            break;
        }
        *inner.status.lock() = Status::Connecting;

        match tokio_tungstenite::connect_async(inner.config.url.as_str()).await {
            Ok((ws, _resp)) => match run_session(&inner, ws, &mut ready).await {
                SessionEnd::Intentional => break,
                SessionEnd::AuthRejected(reason) => {
                    // Bad credentials will not improve by retrying.
                    inner.notify_conn(&ConnectionEvent::Failed { reason: reason.clone() });
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(ClientError::AuthenticationFailed(reason)));
                    }
                    break;
                }
                SessionEnd::Dropped { authenticated } => {
                    if authenticated {
                        attempt = 0;
                    }
                }
            },
            Err(e) => {
                debug!(error = %e, "connect failed");
            }
        }

        if inner.intentional.load(Ordering::SeqCst) {
            break;
        }
        attempt += 1;
        if attempt > MAX_RECONNECT_ATTEMPTS {
            let reason = "reconnect attempts exhausted".to_string();
            inner.notify_conn(&ConnectionEvent::Failed { reason: reason.clone() });
            if let Some(tx) = ready.take() {
                let _ = tx.send(Err(ClientError::Transport(reason)));
            }
            break;
        }
        inner.notify_conn(&ConnectionEvent::Reconnecting { attempt });
        // min(2^attempt seconds, 30s): 2s, 4s, 8s, 16s, then the ceiling.
        let delay = Duration::from_secs(1u64 << attempt.min(5)).min(MAX_BACKOFF);
        tokio::time::sleep(delay).await;
    }
    *inner.status.lock() = Status::Disconnected;
}

async fn send_client(sink: &mut WsSink, msg: &ClientMessage) -> Result<(), ()> {
    let text = codec::encode_client(msg).map_err(|e| {
        warn!(kind = msg.kind(), error = %e, "cannot encode outbound message");
    })?;
    sink.send(WsMessage::Text(text)).await.map_err(|_| ())
}

async fn run_session(inner: &Arc<ClientInner>, ws: Ws, ready: &mut Option<ReadySender>) -> SessionEnd {
    let (mut sink, mut source) = ws.split();

    // Auth is always the first message on the wire.
    let token = inner.config.token.token();
    if send_client(&mut sink, &ClientMessage::Auth { token }).await.is_err() {
        return SessionEnd::Dropped { authenticated: false };
    }

    let user_id = loop {
        let frame = match tokio::time::timeout(CALL_TIMEOUT, source.next()).await {
            Ok(frame) => frame,
            Err(_) => return SessionEnd::Dropped { authenticated: false },
        };
        match frame {
            Some(Ok(WsMessage::Text(text))) => match codec::decode_server(&text) {
                Ok(ServerMessage::Authenticated { user_id }) => break user_id,
                Ok(ServerMessage::Error {
                    code: ErrorCode::AuthenticationFailed,
                    message,
                    ..
                }) => return SessionEnd::AuthRejected(message),
                Ok(other) => debug!(kind = other.kind(), "message before authenticated"),
                Err(e) => warn!(error = %e, "undecodable message during handshake"),
            },
            Some(Ok(WsMessage::Ping(payload))) => {
                if sink.send(WsMessage::Pong(payload)).await.is_err() {
                    return SessionEnd::Dropped { authenticated: false };
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                return SessionEnd::Dropped { authenticated: false }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "read error during handshake");
                return SessionEnd::Dropped { authenticated: false };
            }
        }
    };

    *inner.user_id.lock() = Some(user_id.clone());
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    *inner.cmd_tx.lock() = Some(cmd_tx);
    *inner.status.lock() = Status::Connected;
    info!(user_id = %user_id, "session established");
    inner.notify_conn(&ConnectionEvent::Connected { user_id: user_id.clone() });
    if let Some(tx) = ready.take() {
        let _ = tx.send(Ok(user_id));
    }

    let end = session_loop(inner, &mut sink, &mut source, cmd_rx).await;

    *inner.cmd_tx.lock() = None;
    *inner.status.lock() = Status::Disconnected;
    inner.reject_pending();
    inner.notify_conn(&ConnectionEvent::Disconnected);
    end
}

async fn session_loop(
    inner: &Arc<ClientInner>,
    sink: &mut WsSink,
    source: &mut WsSource,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientMessage>,
) -> SessionEnd {
    let dropped = SessionEnd::Dropped { authenticated: true };

    // Rejoin every registered room, then replay queued operations for
    // those rooms in enqueue order. Queued entries for rooms no longer in
    // the registry stay queued rather than being fired at a room the
    // broker would reject us from.
    let rooms: Vec<String> = {
        let registry = inner.rooms.lock();
        registry
            .iter()
            .filter(|(_, entry)| entry.refcount > 0)
            .map(|(id, _)| id.clone())
            .collect()
    };
    for room_id in &rooms {
        if send_client(sink, &ClientMessage::Join { room_id: room_id.clone() }).await.is_err() {
            return dropped;
        }
    }
    {
        let mut queue = inner.queue.lock().await;
        for room_id in &rooms {
            for item in queue.drain(room_id).await {
                let msg =
                    ClientMessage::Operation { room_id: item.room_id, op: item.op };
                if send_client(sink, &msg).await.is_err() {
                    return dropped;
                }
            }
        }
    }

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_INTERVAL,
        PING_INTERVAL,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match codec::decode_server(&text) {
                    Ok(msg) => handle_server(inner, msg),
                    Err(e) => warn!(code = e.error_code(), "dropping undecodable server message"),
                },
                Some(Ok(WsMessage::Ping(payload))) => {
                    if sink.send(WsMessage::Pong(payload)).await.is_err() {
                        return dropped;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("server closed the connection");
                    return dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "read error");
                    return dropped;
                }
            },

            cmd = cmd_rx.recv() => match cmd {
                Some(msg) => {
                    if send_client(sink, &msg).await.is_err() {
                        return dropped;
                    }
                }
                None => return SessionEnd::Intentional,
            },

            _ = ping.tick() => {
                if send_client(sink, &ClientMessage::Ping).await.is_err() {
                    return dropped;
                }
            }
        }
    }
}

/// Apply one broker message to local state and fire listeners.
fn handle_server(inner: &Arc<ClientInner>, msg: ServerMessage) {
    match msg {
        ServerMessage::Authenticated { .. } | ServerMessage::Pong => {}

        ServerMessage::Joined { room_id, state, users, .. } => {
            merge_snapshot(inner, &room_id, &state);
            if let Some(entry) = inner.rooms.lock().get_mut(&room_id) {
                entry.members = users;
            }
        }

        ServerMessage::Sync { room_id, state, operations } => {
            merge_snapshot(inner, &room_id, &state);
            let mut applied_any = false;
            if let Some(entry) = inner.rooms.lock().get_mut(&room_id) {
                for op in &operations {
                    applied_any |= entry.crdt.apply(op).unwrap_or(false);
                }
            }
            if applied_any {
                emit_full_state(inner, &room_id);
            }
        }

        ServerMessage::Operation { room_id, op, .. } => {
            // Our own operations already applied locally at emit time.
            if op.origin == inner.node_id {
                return;
            }
            let applied = match inner.rooms.lock().get_mut(&room_id) {
                Some(entry) => entry.crdt.apply(&op).unwrap_or_else(|e| {
                    warn!(code = e.error_code(), "rejecting inbound operation");
                    false
                }),
                None => false,
            };
            if applied {
                notify_all(
                    inner.state_callbacks(&room_id),
                    &StateEvent {
                        room_id: room_id.clone(),
                        path: op.path.clone(),
                        value: op.value.clone(),
                        origin: op.origin.clone(),
                    },
                );
                notify_all(inner.op_callbacks(&room_id), &op);
            }
        }

        ServerMessage::CallResult { call_id, success, result, error, .. } => {
            let waiter = inner.pending.lock().remove(&call_id);
            if let Some(tx) = waiter {
                let outcome = if success {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    Err(ClientError::CallFailed(
                        error.unwrap_or_else(|| "unknown".to_string()),
                    ))
                };
                let _ = tx.send(outcome);
            }
        }

        ServerMessage::Presence { room_id, user_id, data } => {
            if let Some(entry) = inner.rooms.lock().get_mut(&room_id) {
                let slot = entry.presence.entry(user_id.clone()).or_insert(Value::Null);
                shallow_merge(slot, &data);
            }
            notify_all(
                inner.presence_callbacks(&room_id),
                &PresenceEvent { room_id, user_id, data },
            );
        }

        ServerMessage::UserJoined { room_id, user } => {
            if let Some(entry) = inner.rooms.lock().get_mut(&room_id) {
                if !entry.members.iter().any(|m| m.id == user.id) {
                    entry.members.push(user.clone());
                }
            }
            if let Some(coordinator) = inner.coordinator(&room_id) {
                if let Err(e) = coordinator.lock().member_joined(&user.id) {
                    warn!(error = %e, "offer to joining member failed");
                }
            }
        }

        ServerMessage::UserLeft { room_id, user_id } => {
            if let Some(entry) = inner.rooms.lock().get_mut(&room_id) {
                entry.members.retain(|m| m.id != user_id);
                entry.presence.remove(&user_id);
            }
            if let Some(coordinator) = inner.coordinator(&room_id) {
                coordinator.lock().member_left(&user_id);
            }
        }

        ServerMessage::Error { code, message, room_id } => {
            debug!(?code, message, "server error");
            inner.notify_conn(&ConnectionEvent::ServerError { code, message, room_id });
        }

        ServerMessage::ScreenshareStarted { room_id, user_id } => {
            if let Some(coordinator) = inner.coordinator(&room_id) {
                let members = inner.member_ids(&room_id);
                if let Err(e) = coordinator.lock().handle_started(&user_id, &members) {
                    warn!(error = %e, "screenshare start handling failed");
                }
            }
        }

        ServerMessage::ScreenshareStopped { room_id, user_id } => {
            if let Some(coordinator) = inner.coordinator(&room_id) {
                coordinator.lock().handle_stopped(&user_id);
            }
        }

        ServerMessage::RtcOffer { room_id, from_user_id, sdp } => {
            if let Some(coordinator) = inner.coordinator(&room_id) {
                if let Err(e) = coordinator.lock().handle_offer(&from_user_id, &sdp) {
                    warn!(error = %e, "offer handling failed");
                }
            }
        }

        ServerMessage::RtcAnswer { room_id, from_user_id, sdp } => {
            if let Some(coordinator) = inner.coordinator(&room_id) {
                if let Err(e) = coordinator.lock().handle_answer(&from_user_id, &sdp) {
                    warn!(error = %e, "answer handling failed");
                }
            }
        }

        ServerMessage::RtcIceCandidate { room_id, from_user_id, candidate } => {
            if let Some(coordinator) = inner.coordinator(&room_id) {
                if let Err(e) = coordinator.lock().handle_ice(&from_user_id, &candidate) {
                    warn!(error = %e, "ice handling failed");
                }
            }
        }

        ServerMessage::RemoteControlRequest { room_id, from_user_id } => {
            if let Some(coordinator) = inner.coordinator(&room_id) {
                coordinator.lock().handle_control_request(&from_user_id);
            }
        }

        ServerMessage::RemoteControlResponse { room_id, from_user_id, approved } => {
            if let Some(coordinator) = inner.coordinator(&room_id) {
                coordinator.lock().handle_control_response(&from_user_id, approved);
            }
        }
    }
}

/// Replace a room's replica with the authoritative snapshot merged with
/// whatever the local replica already had (offline writes included).
fn merge_snapshot(inner: &Arc<ClientInner>, room_id: &str, state: &collab_proto::MapSnapshot) {
    {
        let mut rooms = inner.rooms.lock();
        let Some(entry) = rooms.get_mut(room_id) else { return };
        match LwwMap::from_snapshot(&inner.node_id, state) {
            Ok(mut fresh) => {
                if let Err(e) = fresh.merge(&entry.crdt) {
                    warn!(code = e.error_code(), "local replay into snapshot failed");
                }
                entry.crdt = fresh;
            }
            Err(e) => {
                warn!(code = e.error_code(), "rejecting tampered snapshot");
                return;
            }
        }
    }
    emit_full_state(inner, room_id);
}

fn emit_full_state(inner: &Arc<ClientInner>, room_id: &str) {
    let value = inner.rooms.lock().get(room_id).map(|entry| entry.crdt.value());
    if let Some(value) = value {
        notify_all(
            inner.state_callbacks(room_id),
            &StateEvent {
                room_id: room_id.to_string(),
                path: Vec::new(),
                value: Some(value),
                origin: "sync".to_string(),
            },
        );
    }
}
