//! Screen-share coordinator.
//!
//! A per-room role state machine (idle / sharer / viewer) that drives
//! WebRTC signaling over the broker socket. Media itself belongs to the
//! host platform: the coordinator only sees opaque stream handles through
//! the [`MediaSource`] and [`PeerConnector`] traits, and never inspects
//! SDP or ICE payloads.
//!
//! Transitions are driven by local commands and broker messages; the only
//! time-dependent behavior is flushing ICE candidates buffered before the
//! remote description was set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use collab_proto::{now_seconds, ClientMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Label of the single ordered data channel the sharer opens per peer.
pub const ANNOTATION_CHANNEL: &str = "annotations";

/// Coordinator failures.
#[derive(Debug, Error)]
pub enum ShareError {
    #[error("not currently sharing")]
    NotSharing,

    #[error("no active share to view")]
    NoActiveShare,

    #[error("media acquisition failed: {0}")]
    Media(String),

    #[error("peer failure: {0}")]
    Peer(String),

    #[error("data channel failure: {0}")]
    Channel(String),

    #[error("annotation point outside the unit viewport: ({x}, {y})")]
    PointOutOfRange { x: f64, y: f64 },
}

/// Role within the room's share, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareRole {
    /// Not participating.
    #[default]
    Idle,
    /// Broadcasting this client's screen.
    Sharer,
    /// Receiving another member's screen.
    Viewer,
}

/// Opaque handle to a host-platform media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStreamHandle {
    /// Host-assigned identifier.
    pub id: String,
}

/// Host hook that acquires the capture stream.
pub trait MediaSource: Send + Sync {
    /// Acquire a screen-capture stream.
    fn acquire_stream(&self) -> Result<MediaStreamHandle, ShareError>;
}

/// Host hook that builds peer connections.
pub trait PeerConnector: Send + Sync {
    /// Create a peer connection toward `remote_user_id`.
    fn create_peer(&self, remote_user_id: &str) -> Box<dyn PeerHandle>;
}

/// One WebRTC peer connection, as much of it as the coordinator needs.
pub trait PeerHandle: Send {
    /// Produce a local offer SDP.
    fn create_offer(&mut self) -> Result<Value, ShareError>;
    /// Produce a local answer SDP for `offer`.
    fn create_answer(&mut self, offer: &Value) -> Result<Value, ShareError>;
    /// Install the remote description.
    fn set_remote_description(&mut self, sdp: &Value) -> Result<(), ShareError>;
    /// Install one remote ICE candidate.
    fn add_ice_candidate(&mut self, candidate: &Value) -> Result<(), ShareError>;
    /// Attach the outgoing media stream (sharer side).
    fn attach_stream(&mut self, stream: &MediaStreamHandle) -> Result<(), ShareError>;
    /// Swap the outgoing video track without renegotiating.
    fn replace_track(&mut self, stream: &MediaStreamHandle) -> Result<(), ShareError>;
    /// Open a data channel (sharer side).
    fn open_data_channel(&mut self, label: &str) -> Result<Box<dyn DataChannel>, ShareError>;
    /// The received remote stream, once media arrived (viewer side).
    fn remote_stream(&self) -> Option<MediaStreamHandle>;
    /// Tear the connection down.
    fn close(&mut self);
}

/// A data channel carrying annotation traffic.
pub trait DataChannel: Send {
    /// Send one serialized packet.
    fn send(&mut self, payload: &str) -> Result<(), ShareError>;
}

/// Sink for outbound signaling messages, wired to the client session.
pub type SignalFn = Arc<dyn Fn(ClientMessage) + Send + Sync>;

/// A normalized point in the shared viewport, both coordinates in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
}

/// A drawn annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Fresh id per annotation.
    pub id: Uuid,
    /// Drawing member's user id.
    pub author: String,
    /// RGB color string, e.g. `"#ff0066"`.
    pub color: String,
    /// Stroke points, normalized to the shared viewport.
    pub points: Vec<Point>,
    /// Creation time, seconds since epoch.
    pub timestamp: f64,
}

/// Packets riding the annotation data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SharePacket {
    /// A new annotation stroke.
    Annotation {
        /// The stroke.
        annotation: Annotation,
    },
    /// A cursor position update.
    Cursor {
        /// Whose cursor.
        user_id: String,
        /// Horizontal position in [0, 1].
        x: f64,
        /// Vertical position in [0, 1].
        y: f64,
        /// Send time, seconds since epoch.
        timestamp: f64,
    },
    /// Wipe all annotations.
    ClearAnnotations {
        /// Who cleared.
        user_id: String,
    },
}

impl SharePacket {
    /// Decode a packet received on a data channel.
    pub fn decode(payload: &str) -> Result<Self, ShareError> {
        serde_json::from_str(payload)
            .map_err(|e| ShareError::Channel(format!("bad packet: {e}")))
    }

    fn encode(&self) -> Result<String, ShareError> {
        serde_json::to_string(self)
            .map_err(|e| ShareError::Channel(format!("cannot encode packet: {e}")))
    }
}

struct PeerLink {
    handle: Box<dyn PeerHandle>,
    data: Option<Box<dyn DataChannel>>,
    pending_ice: Vec<Value>,
    remote_set: bool,
}

impl PeerLink {
    fn new(handle: Box<dyn PeerHandle>) -> Self {
        Self { handle, data: None, pending_ice: Vec::new(), remote_set: false }
    }

    /// Install the remote description and flush any ICE candidates that
    /// arrived before it.
    fn set_remote(&mut self, sdp: &Value) -> Result<(), ShareError> {
        self.handle.set_remote_description(sdp)?;
        self.remote_set = true;
        for candidate in self.pending_ice.drain(..) {
            self.handle.add_ice_candidate(&candidate)?;
        }
        Ok(())
    }
}

/// Per-room screen-share state machine.
pub struct ScreenShareCoordinator {
    room_id: String,
    self_id: String,
    role: ShareRole,
    sharer_id: Option<String>,
    local_stream: Option<MediaStreamHandle>,
    peers: HashMap<String, PeerLink>,
    /// ICE candidates from users we have no peer for yet.
    orphan_ice: HashMap<String, Vec<Value>>,
    /// Viewer user ids with an unanswered control request (sharer side).
    pending_control: HashSet<String>,
    /// The single viewer currently granted control (sharer side).
    granted_control: Option<String>,
    /// Whether we currently hold control of the sharer's machine
    /// (viewer side).
    has_control: bool,
    media: Arc<dyn MediaSource>,
    connector: Arc<dyn PeerConnector>,
    signal: SignalFn,
}

impl ScreenShareCoordinator {
    /// Build a coordinator for one room.
    pub fn new(
        room_id: impl Into<String>,
        self_id: impl Into<String>,
        media: Arc<dyn MediaSource>,
        connector: Arc<dyn PeerConnector>,
        signal: SignalFn,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            self_id: self_id.into(),
            role: ShareRole::Idle,
            sharer_id: None,
            local_stream: None,
            peers: HashMap::new(),
            orphan_ice: HashMap::new(),
            pending_control: HashSet::new(),
            granted_control: None,
            has_control: false,
            media,
            connector,
            signal,
        }
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> ShareRole {
        self.role
    }

    /// The active sharer's user id, if a share is running.
    #[must_use]
    pub fn sharer_id(&self) -> Option<&str> {
        self.sharer_id.as_deref()
    }

    /// Number of live peer connections.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The received remote stream (viewer side).
    #[must_use]
    pub fn remote_stream(&self) -> Option<MediaStreamHandle> {
        self.sharer_id
            .as_ref()
            .and_then(|sharer| self.peers.get(sharer))
            .and_then(|link| link.handle.remote_stream())
    }

    /// Viewers awaiting a control decision (sharer side).
    #[must_use]
    pub fn pending_control(&self) -> Vec<String> {
        self.pending_control.iter().cloned().collect()
    }

    /// The viewer currently granted control, if any.
    #[must_use]
    pub fn granted_control(&self) -> Option<&str> {
        self.granted_control.as_deref()
    }

    /// Do we hold control of the sharer's machine (viewer side)?
    #[must_use]
    pub fn has_control(&self) -> bool {
        self.has_control
    }

    fn emit(&self, msg: ClientMessage) {
        (self.signal)(msg);
    }

    // ------------------------------------------------------------------
    // Local commands
    // ------------------------------------------------------------------

    /// Begin sharing. When a share is already running from this client the
    /// captured stream is swapped onto every existing peer connection;
    /// otherwise the role flips to sharer and offer creation is deferred
    /// until the broker echoes `screenshare_started`.
    pub fn start_sharing(&mut self) -> Result<(), ShareError> {
        let stream = self.media.acquire_stream()?;

        if self.role == ShareRole::Sharer {
            for link in self.peers.values_mut() {
                link.handle.replace_track(&stream)?;
            }
            self.local_stream = Some(stream);
            return Ok(());
        }

        self.role = ShareRole::Sharer;
        self.sharer_id = Some(self.self_id.clone());
        self.local_stream = Some(stream);
        self.emit(ClientMessage::ScreenshareStart { room_id: self.room_id.clone() });
        Ok(())
    }

    /// Stop sharing: tear down every peer and announce the stop.
    pub fn stop_sharing(&mut self) -> Result<(), ShareError> {
        if self.role != ShareRole::Sharer {
            return Err(ShareError::NotSharing);
        }
        self.teardown();
        self.emit(ClientMessage::ScreenshareStop { room_id: self.room_id.clone() });
        Ok(())
    }

    /// Ask the sharer for remote control (viewer side).
    pub fn request_control(&mut self) -> Result<(), ShareError> {
        let sharer = self.sharer_id.clone().ok_or(ShareError::NoActiveShare)?;
        self.emit(ClientMessage::RemoteControlRequest {
            room_id: self.room_id.clone(),
            target_user_id: sharer,
        });
        Ok(())
    }

    /// Answer a viewer's control request (sharer side). At most one viewer
    /// holds control; granting replaces nobody, it just records the grant.
    pub fn respond_control(&mut self, viewer: &str, approve: bool) {
        self.pending_control.remove(viewer);
        if approve {
            self.granted_control = Some(viewer.to_string());
        }
        self.emit(ClientMessage::RemoteControlResponse {
            room_id: self.room_id.clone(),
            target_user_id: viewer.to_string(),
            approved: approve,
        });
    }

    /// Withdraw a previously granted control (sharer side).
    pub fn revoke_control(&mut self) {
        if let Some(viewer) = self.granted_control.take() {
            self.emit(ClientMessage::RemoteControlResponse {
                room_id: self.room_id.clone(),
                target_user_id: viewer,
                approved: false,
            });
        }
    }

    /// Send an annotation stroke on every data channel.
    pub fn send_annotation(
        &mut self,
        color: impl Into<String>,
        points: Vec<Point>,
    ) -> Result<Annotation, ShareError> {
        for p in &points {
            if !(0.0..=1.0).contains(&p.x) || !(0.0..=1.0).contains(&p.y) {
                return Err(ShareError::PointOutOfRange { x: p.x, y: p.y });
            }
        }
        let annotation = Annotation {
            id: Uuid::new_v4(),
            author: self.self_id.clone(),
            color: color.into(),
            points,
            timestamp: now_seconds(),
        };
        self.send_packet(&SharePacket::Annotation { annotation: annotation.clone() })?;
        Ok(annotation)
    }

    /// Send a cursor position on every data channel.
    pub fn send_cursor(&mut self, x: f64, y: f64) -> Result<(), ShareError> {
        if !(0.0..=1.0).contains(&x) || !(0.0..=1.0).contains(&y) {
            return Err(ShareError::PointOutOfRange { x, y });
        }
        self.send_packet(&SharePacket::Cursor {
            user_id: self.self_id.clone(),
            x,
            y,
            timestamp: now_seconds(),
        })
    }

    /// Wipe annotations on every data channel.
    pub fn clear_annotations(&mut self) -> Result<(), ShareError> {
        self.send_packet(&SharePacket::ClearAnnotations { user_id: self.self_id.clone() })
    }

    fn send_packet(&mut self, packet: &SharePacket) -> Result<(), ShareError> {
        let payload = packet.encode()?;
        let mut sent = 0;
        for link in self.peers.values_mut() {
            if let Some(channel) = link.data.as_mut() {
                if let Err(e) = channel.send(&payload) {
                    warn!(error = %e, "data channel send failed");
                } else {
                    sent += 1;
                }
            }
        }
        if sent == 0 {
            return Err(ShareError::Channel("no open data channel".into()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Broker events
    // ------------------------------------------------------------------

    /// `screenshare_started` arrived. When it echoes our own start, create
    /// a peer connection and offer per current member; otherwise become a
    /// viewer of `user_id`.
    pub fn handle_started(
        &mut self,
        user_id: &str,
        members: &[String],
    ) -> Result<(), ShareError> {
        if user_id == self.self_id {
            for member in members {
                if member != &self.self_id {
                    self.offer_to(member)?;
                }
            }
            return Ok(());
        }
        if self.role == ShareRole::Idle {
            self.role = ShareRole::Viewer;
            self.sharer_id = Some(user_id.to_string());
        }
        Ok(())
    }

    /// `screenshare_stopped` arrived.
    pub fn handle_stopped(&mut self, user_id: &str) {
        if self.sharer_id.as_deref() == Some(user_id) && user_id != self.self_id {
            self.teardown();
        }
    }

    /// A relayed offer arrived (viewer side): build the peer, answer, and
    /// flush any early ICE.
    pub fn handle_offer(&mut self, from: &str, sdp: &Value) -> Result<(), ShareError> {
        let mut link = PeerLink::new(self.connector.create_peer(from));
        link.set_remote(sdp)?;
        if let Some(early) = self.orphan_ice.remove(from) {
            for candidate in early {
                link.handle.add_ice_candidate(&candidate)?;
            }
        }
        let answer = link.handle.create_answer(sdp)?;
        self.peers.insert(from.to_string(), link);
        self.emit(ClientMessage::RtcAnswer {
            room_id: self.room_id.clone(),
            target_user_id: from.to_string(),
            sdp: answer,
        });
        Ok(())
    }

    /// A relayed answer arrived (sharer side).
    pub fn handle_answer(&mut self, from: &str, sdp: &Value) -> Result<(), ShareError> {
        let Some(link) = self.peers.get_mut(from) else {
            debug!(from, "answer for unknown peer, dropping");
            return Ok(());
        };
        link.set_remote(sdp)
    }

    /// A relayed ICE candidate arrived. Candidates that beat the remote
    /// description are buffered and flushed on the first description.
    pub fn handle_ice(&mut self, from: &str, candidate: &Value) -> Result<(), ShareError> {
        match self.peers.get_mut(from) {
            Some(link) if link.remote_set => link.handle.add_ice_candidate(candidate),
            Some(link) => {
                link.pending_ice.push(candidate.clone());
                Ok(())
            }
            None => {
                self.orphan_ice.entry(from.to_string()).or_default().push(candidate.clone());
                Ok(())
            }
        }
    }

    /// A relayed control request arrived (sharer side).
    pub fn handle_control_request(&mut self, from: &str) {
        if self.role == ShareRole::Sharer {
            self.pending_control.insert(from.to_string());
        }
    }

    /// A relayed control response arrived (viewer side).
    pub fn handle_control_response(&mut self, _from: &str, approved: bool) {
        self.has_control = approved;
    }

    /// The host reports a data channel opened by the sharer (viewer side).
    pub fn data_channel_opened(&mut self, from: &str, channel: Box<dyn DataChannel>) {
        if let Some(link) = self.peers.get_mut(from) {
            link.data = Some(channel);
        } else {
            debug!(from, "data channel for unknown peer, dropping");
        }
    }

    /// A member joined the room. A live sharer offers to them immediately.
    pub fn member_joined(&mut self, user_id: &str) -> Result<(), ShareError> {
        if self.role == ShareRole::Sharer && user_id != self.self_id {
            self.offer_to(user_id)?;
        }
        Ok(())
    }

    /// A member left: drop their peer connection and any control state.
    /// A departing sharer resets every viewer to idle.
    pub fn member_left(&mut self, user_id: &str) {
        if let Some(mut link) = self.peers.remove(user_id) {
            link.handle.close();
        }
        self.orphan_ice.remove(user_id);
        self.pending_control.remove(user_id);
        if self.granted_control.as_deref() == Some(user_id) {
            self.granted_control = None;
        }
        if self.sharer_id.as_deref() == Some(user_id) && self.role == ShareRole::Viewer {
            self.teardown();
        }
    }

    // ------------------------------------------------------------------

    /// Create a peer connection, data channel, and offer toward `member`.
    fn offer_to(&mut self, member: &str) -> Result<(), ShareError> {
        if self.peers.contains_key(member) {
            return Ok(());
        }
        let mut link = PeerLink::new(self.connector.create_peer(member));
        if let Some(stream) = &self.local_stream {
            link.handle.attach_stream(stream)?;
        }
        link.data = Some(link.handle.open_data_channel(ANNOTATION_CHANNEL)?);
        let offer = link.handle.create_offer()?;
        if let Some(early) = self.orphan_ice.remove(member) {
            link.pending_ice.extend(early);
        }
        self.peers.insert(member.to_string(), link);
        self.emit(ClientMessage::RtcOffer {
            room_id: self.room_id.clone(),
            target_user_id: member.to_string(),
            sdp: offer,
        });
        Ok(())
    }

    /// Drop every peer and reset to idle.
    fn teardown(&mut self) {
        for (_, mut link) in self.peers.drain() {
            link.handle.close();
        }
        self.orphan_ice.clear();
        self.pending_control.clear();
        self.granted_control = None;
        self.has_control = false;
        self.local_stream = None;
        self.sharer_id = None;
        self.role = ShareRole::Idle;
    }
}
