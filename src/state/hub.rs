//! Hub - shared broker state.
//!
//! Owns the room registry, the pluggable providers, and cross-connection
//! bookkeeping (per-user connection counts, the monotonic server clock,
//! the shutdown signal). One Hub per broker process; connections hold it
//! behind an `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use collab_proto::MapSnapshot;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::auth::AuthProvider;
use crate::config::BrokerConfig;
use crate::error::HandlerError;
use crate::network::AuthGuard;
use crate::perm::PermissionManager;
use crate::state::{FunctionEntry, Room};
use crate::storage::Storage;

/// Monotonic wall-clock seconds for server-timestamp mode.
///
/// Never returns the same value twice and never goes backwards, even when
/// the wall clock does; origin uniqueness keeps the CRDT order total
/// regardless.
#[derive(Debug, Default)]
pub struct ServerClock {
    last_micros: AtomicU64,
}

impl ServerClock {
    /// The next strictly increasing timestamp, in seconds.
    pub fn now_seconds(&self) -> f64 {
        let wall = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut prev = self.last_micros.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self.last_micros.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next as f64 / 1_000_000.0,
                Err(observed) => prev = observed,
            }
        }
    }
}

/// Construction parameters for [`Hub`].
pub struct HubParams {
    /// Broker behavior knobs.
    pub config: BrokerConfig,
    /// Token validator.
    pub auth: Arc<dyn AuthProvider>,
    /// Optional permission manager; absent means allow-everything.
    pub perms: Option<Arc<dyn PermissionManager>>,
    /// Optional snapshot persistence.
    pub storage: Option<Arc<dyn Storage>>,
}

/// Shared broker state.
pub struct Hub {
    config: BrokerConfig,
    rooms: DashMap<String, Arc<Room>>,
    auth: Arc<dyn AuthProvider>,
    perms: Option<Arc<dyn PermissionManager>>,
    storage: Option<Arc<dyn Storage>>,
    /// Per-IP auth failure lockout.
    pub auth_guard: AuthGuard,
    user_conns: DashMap<String, usize>,
    conn_seq: AtomicU64,
    clock: ServerClock,
    shutdown_tx: broadcast::Sender<()>,
}

impl Hub {
    /// Build a hub.
    pub fn new(params: HubParams) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: params.config,
            rooms: DashMap::new(),
            auth: params.auth,
            perms: params.perms,
            storage: params.storage,
            auth_guard: AuthGuard::default(),
            user_conns: DashMap::new(),
            conn_seq: AtomicU64::new(1),
            clock: ServerClock::default(),
            shutdown_tx,
        }
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The auth provider.
    #[must_use]
    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    /// The permission manager, if configured.
    #[must_use]
    pub fn perms(&self) -> Option<&Arc<dyn PermissionManager>> {
        self.perms.as_ref()
    }

    /// A fresh connection id.
    pub fn next_conn_id(&self) -> u64 {
        self.conn_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// The broker's monotonic clock, for server-timestamp mode.
    pub fn clock_now(&self) -> f64 {
        self.clock.now_seconds()
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    /// Look up an existing room.
    #[must_use]
    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(&r))
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Fetch a room, creating it on first join when `auto_create_rooms`
    /// allows. A persisted snapshot, when present, seeds the new room.
    pub async fn get_or_create_room(&self, room_id: &str) -> Result<Arc<Room>, HandlerError> {
        if let Some(room) = self.room(room_id) {
            return Ok(room);
        }
        if !self.config.auto_create_rooms {
            return Err(HandlerError::RoomNotFound(room_id.to_string()));
        }

        let restored = match &self.storage {
            Some(storage) => match storage.load(&room_key(room_id)).await {
                Ok(Some(blob)) => match serde_json::from_slice::<MapSnapshot>(&blob)
                    .map_err(|e| HandlerError::Internal(format!("corrupt room snapshot: {e}")))
                    .and_then(|snap| Room::restore(room_id, &snap))
                {
                    Ok(room) => {
                        info!(room = %room_id, "restored room from storage");
                        Some(room)
                    }
                    Err(e) => {
                        warn!(room = %room_id, error = %e, "discarding unreadable room snapshot");
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    warn!(room = %room_id, error = %e, "storage load failed, starting empty");
                    None
                }
            },
            None => None,
        };

        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(restored.unwrap_or_else(|| Room::new(room_id))));
        Ok(Arc::clone(&room))
    }

    /// Persist a room snapshot. Failures are logged, never fatal.
    pub async fn persist_room(&self, room: &Room) {
        let Some(storage) = &self.storage else { return };
        let snapshot = room.snapshot();
        let blob = match serde_json::to_vec(&snapshot) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(room = %room.id, error = %e, "cannot serialize room snapshot");
                return;
            }
        };
        if let Err(e) = storage.save(&room_key(&room.id), &blob).await {
            warn!(room = %room.id, error = %e, "room snapshot write failed");
        }
    }

    /// Register a function on a room, creating the room if needed
    /// (regardless of `auto_create_rooms`; registration is server-side
    /// setup, not a client join).
    pub fn register_function(
        &self,
        room_id: &str,
        name: impl Into<String>,
        entry: FunctionEntry,
    ) {
        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(room_id)));
        room.register_function(name, entry);
    }

    // ------------------------------------------------------------------
    // Connection accounting
    // ------------------------------------------------------------------

    /// Count a new connection for `user_id`. Returns `false` when the user
    /// is already at `max_connections_per_user`.
    pub fn try_register_user_conn(&self, user_id: &str) -> bool {
        let mut count = self.user_conns.entry(user_id.to_string()).or_insert(0);
        if *count >= self.config.max_connections_per_user {
            return false;
        }
        *count += 1;
        true
    }

    /// Release a connection slot for `user_id`.
    pub fn unregister_user_conn(&self, user_id: &str) {
        if let Some(mut count) = self.user_conns.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                drop(count);
                self.user_conns.remove_if(user_id, |_, c| *c == 0);
            }
        }
    }

    /// Live connections for `user_id`.
    #[must_use]
    pub fn user_conn_count(&self, user_id: &str) -> usize {
        self.user_conns.get(user_id).map(|c| *c).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Signal every task to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

fn room_key(room_id: &str) -> String {
    format!("rooms/{room_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AnonymousProvider;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn hub_with(config: BrokerConfig, storage: Option<Arc<dyn Storage>>) -> Hub {
        Hub::new(HubParams {
            config,
            auth: Arc::new(AnonymousProvider),
            perms: None,
            storage,
        })
    }

    #[tokio::test]
    async fn test_auto_create_rooms() {
        let hub = hub_with(BrokerConfig::default(), None);
        assert!(hub.room("lobby").is_none());
        let room = hub.get_or_create_room("lobby").await.unwrap();
        assert_eq!(room.id, "lobby");
        assert_eq!(hub.room_count(), 1);

        // Second fetch returns the same room.
        let again = hub.get_or_create_room("lobby").await.unwrap();
        assert!(Arc::ptr_eq(&room, &again));
    }

    #[tokio::test]
    async fn test_room_not_found_when_auto_create_disabled() {
        let config = BrokerConfig { auto_create_rooms: false, ..Default::default() };
        let hub = hub_with(config, None);
        assert!(matches!(
            hub.get_or_create_room("lobby").await,
            Err(HandlerError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_persist_and_restore_room() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = hub_with(BrokerConfig::default(), Some(Arc::clone(&storage)));

        let room = hub.get_or_create_room("doc").await.unwrap();
        let op = collab_proto::Operation::set("a", vec!["title".into()], json!("hello")).unwrap();
        room.apply_operation(op, None).unwrap();
        hub.persist_room(&room).await;

        // A fresh hub sharing the storage sees the state.
        let hub2 = hub_with(BrokerConfig::default(), Some(storage));
        let restored = hub2.get_or_create_room("doc").await.unwrap();
        assert_eq!(restored.value(), json!({"title": "hello"}));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.save("rooms/doc", b"{definitely not json").await.unwrap();

        let hub = hub_with(BrokerConfig::default(), Some(storage));
        let room = hub.get_or_create_room("doc").await.unwrap();
        assert_eq!(room.value(), json!({}));
    }

    #[test]
    fn test_connection_accounting_enforces_cap() {
        let config = BrokerConfig { max_connections_per_user: 2, ..Default::default() };
        let hub = hub_with(config, None);

        assert!(hub.try_register_user_conn("alice"));
        assert!(hub.try_register_user_conn("alice"));
        assert!(!hub.try_register_user_conn("alice"));
        assert_eq!(hub.user_conn_count("alice"), 2);

        hub.unregister_user_conn("alice");
        assert!(hub.try_register_user_conn("alice"));
    }

    #[test]
    fn test_server_clock_strictly_increases() {
        let clock = ServerClock::default();
        let mut last = 0.0;
        for _ in 0..1000 {
            let now = clock.now_seconds();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn test_register_function_creates_room_eagerly() {
        let config = BrokerConfig { auto_create_rooms: false, ..Default::default() };
        let hub = hub_with(config, None);
        hub.register_function(
            "tools",
            "noop",
            crate::state::FunctionEntry::from_fn(|_ctx| async move { Ok(json!(null)) }),
        );
        assert!(hub.room("tools").is_some());
    }
}
