//! Client session engine.
//!
//! Contains the connection lifecycle and room registry
//! ([`CollabClient`]), the durable offline queue, and the screen-share
//! coordinator.

mod queue;
mod screenshare;
mod session;

pub use queue::{OfflineQueue, QueuedOp, MAX_ENTRY_AGE, MAX_QUEUE_ENTRIES};
pub use screenshare::{
    Annotation, DataChannel, MediaSource, MediaStreamHandle, PeerConnector, PeerHandle, Point,
    ScreenShareCoordinator, ShareError, SharePacket, ShareRole, SignalFn, ANNOTATION_CHANNEL,
};
pub use session::{
    ClientConfig, ClientError, CollabClient, ConnectionEvent, ListenerId, PresenceEvent,
    StateEvent, StaticToken, TokenProvider, CALL_TIMEOUT, MAX_BACKOFF, MAX_RECONNECT_ATTEMPTS,
    PING_INTERVAL,
};
