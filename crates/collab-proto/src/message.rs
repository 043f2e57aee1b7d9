//! Wire message schema: one JSON envelope per message with a required
//! `type` discriminator.
//!
//! Client-to-broker and broker-to-client envelopes are distinct enums so
//! each side can only emit what the protocol allows it to. Relayed WebRTC
//! payloads (SDP, ICE) are opaque JSON the broker never inspects.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::MapSnapshot;
use crate::op::Operation;

/// Wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Token rejected, auth required, or auth attempts exhausted.
    AuthenticationFailed,
    /// The principal may not perform the action.
    PermissionDenied,
    /// The room does not exist and auto-create is disabled.
    RoomNotFound,
    /// Malformed or oversize envelope.
    InvalidMessage,
    /// Operation failed structural or CRDT validation.
    InvalidOperation,
    /// No function registered under the requested name.
    FunctionNotFound,
    /// A function handler failed or timed out.
    FunctionError,
    /// Token bucket empty.
    RateLimited,
    /// Anything the broker cannot blame on the client.
    InternalError,
}

impl ErrorCode {
    /// The wire string for this code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::InvalidOperation => "INVALID_OPERATION",
            Self::FunctionNotFound => "FUNCTION_NOT_FOUND",
            Self::FunctionError => "FUNCTION_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// A user as seen by other room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Stable user id assigned by the auth provider.
    pub id: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Roles granted by the auth provider.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

/// Messages a client sends to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every connection. The token never appears in the URL.
    Auth {
        /// Opaque credential handed to the auth provider.
        token: String,
    },
    /// Join a room (created on first join when the broker allows it).
    Join {
        /// Target room.
        room_id: String,
    },
    /// Leave a room.
    Leave {
        /// Target room.
        room_id: String,
    },
    /// A CRDT mutation for a room.
    Operation {
        /// Target room.
        room_id: String,
        /// The mutation.
        op: Operation,
    },
    /// Request state plus operations newer than a version vector.
    SyncRequest {
        /// Target room.
        room_id: String,
        /// Per-origin high-water marks; absent means "everything".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<HashMap<String, f64>>,
    },
    /// Invoke a server-registered function.
    Call {
        /// Target room.
        room_id: String,
        /// Client-generated correlation id.
        call_id: String,
        /// Registered function name.
        function_name: String,
        /// Arbitrary JSON arguments.
        #[serde(default)]
        args: Value,
    },
    /// Publish a transient presence patch.
    Presence {
        /// Target room.
        room_id: String,
        /// Shallow-merged into the sender's presence entry.
        data: Value,
    },
    /// Liveness probe; answered with `pong`.
    Ping,
    /// Announce intent to share this client's screen.
    ScreenshareStart {
        /// Target room.
        room_id: String,
    },
    /// Stop sharing.
    ScreenshareStop {
        /// Target room.
        room_id: String,
    },
    /// Relay an SDP offer to one member. Payload is opaque to the broker.
    RtcOffer {
        /// Target room.
        room_id: String,
        /// Member to deliver to.
        target_user_id: String,
        /// Opaque SDP payload.
        sdp: Value,
    },
    /// Relay an SDP answer to one member.
    RtcAnswer {
        /// Target room.
        room_id: String,
        /// Member to deliver to.
        target_user_id: String,
        /// Opaque SDP payload.
        sdp: Value,
    },
    /// Relay an ICE candidate to one member. Exempt from rate limiting.
    RtcIceCandidate {
        /// Target room.
        room_id: String,
        /// Member to deliver to.
        target_user_id: String,
        /// Opaque candidate payload.
        candidate: Value,
    },
    /// Ask the sharer for remote control.
    RemoteControlRequest {
        /// Target room.
        room_id: String,
        /// The sharer.
        target_user_id: String,
    },
    /// Grant, deny, or revoke a control request.
    RemoteControlResponse {
        /// Target room.
        room_id: String,
        /// The requesting viewer.
        target_user_id: String,
        /// Granted or not.
        approved: bool,
    },
}

impl ClientMessage {
    /// The room this message addresses, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::Auth { .. } | Self::Ping => None,
            Self::Join { room_id }
            | Self::Leave { room_id }
            | Self::Operation { room_id, .. }
            | Self::SyncRequest { room_id, .. }
            | Self::Call { room_id, .. }
            | Self::Presence { room_id, .. }
            | Self::ScreenshareStart { room_id }
            | Self::ScreenshareStop { room_id }
            | Self::RtcOffer { room_id, .. }
            | Self::RtcAnswer { room_id, .. }
            | Self::RtcIceCandidate { room_id, .. }
            | Self::RemoteControlRequest { room_id, .. }
            | Self::RemoteControlResponse { room_id, .. } => Some(room_id),
        }
    }

    /// Messages exempt from the per-connection rate limiter: auth (gated by
    /// the per-IP lockout instead) and ICE candidates (bursty by nature).
    #[must_use]
    pub fn rate_limit_exempt(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::RtcIceCandidate { .. })
    }

    /// A short kind label for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Operation { .. } => "operation",
            Self::SyncRequest { .. } => "sync_request",
            Self::Call { .. } => "call",
            Self::Presence { .. } => "presence",
            Self::Ping => "ping",
            Self::ScreenshareStart { .. } => "screenshare_start",
            Self::ScreenshareStop { .. } => "screenshare_stop",
            Self::RtcOffer { .. } => "rtc_offer",
            Self::RtcAnswer { .. } => "rtc_answer",
            Self::RtcIceCandidate { .. } => "rtc_ice_candidate",
            Self::RemoteControlRequest { .. } => "remote_control_request",
            Self::RemoteControlResponse { .. } => "remote_control_response",
        }
    }
}

/// Messages the broker sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Auth accepted; carries the assigned user id.
    Authenticated {
        /// The principal's user id.
        user_id: String,
    },
    /// Join accepted; carries initial state and the member list.
    Joined {
        /// The room joined.
        room_id: String,
        /// The joining principal's user id.
        user_id: String,
        /// Authoritative state snapshot.
        state: MapSnapshot,
        /// Current members, join order.
        users: Vec<UserInfo>,
    },
    /// An operation applied to the room, rebroadcast to every member.
    /// Clients ignore operations whose origin is their own node id.
    Operation {
        /// The room.
        room_id: String,
        /// User id of the emitter.
        user_id: String,
        /// The canonical operation (timestamp may be server-substituted).
        op: Operation,
    },
    /// Answer to a sync request.
    Sync {
        /// The room.
        room_id: String,
        /// Authoritative state snapshot.
        state: MapSnapshot,
        /// Operations newer than the requested vector.
        operations: Vec<Operation>,
    },
    /// Result of a function call, delivered only to the caller.
    CallResult {
        /// The room.
        room_id: String,
        /// Correlation id from the call.
        call_id: String,
        /// Whether the handler completed successfully.
        success: bool,
        /// Handler return value on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Failure or timeout description.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A member's presence patch.
    Presence {
        /// The room.
        room_id: String,
        /// Whose presence changed.
        user_id: String,
        /// The patch as sent.
        data: Value,
    },
    /// A member joined.
    UserJoined {
        /// The room.
        room_id: String,
        /// The new member.
        user: UserInfo,
    },
    /// A member left.
    UserLeft {
        /// The room.
        room_id: String,
        /// The departed member's user id.
        user_id: String,
    },
    /// A typed error. The connection usually stays open.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
        /// The room concerned, when applicable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    /// Answer to `ping`.
    Pong,
    /// A member started sharing. Echoed to the sharer as well.
    ScreenshareStarted {
        /// The room.
        room_id: String,
        /// The sharer.
        user_id: String,
    },
    /// A member stopped sharing.
    ScreenshareStopped {
        /// The room.
        room_id: String,
        /// The former sharer.
        user_id: String,
    },
    /// Relayed SDP offer.
    RtcOffer {
        /// The room.
        room_id: String,
        /// Originating member.
        from_user_id: String,
        /// Opaque SDP payload.
        sdp: Value,
    },
    /// Relayed SDP answer.
    RtcAnswer {
        /// The room.
        room_id: String,
        /// Originating member.
        from_user_id: String,
        /// Opaque SDP payload.
        sdp: Value,
    },
    /// Relayed ICE candidate.
    RtcIceCandidate {
        /// The room.
        room_id: String,
        /// Originating member.
        from_user_id: String,
        /// Opaque candidate payload.
        candidate: Value,
    },
    /// Relayed control request.
    RemoteControlRequest {
        /// The room.
        room_id: String,
        /// The requesting viewer.
        from_user_id: String,
    },
    /// Relayed control response.
    RemoteControlResponse {
        /// The room.
        room_id: String,
        /// The sharer answering.
        from_user_id: String,
        /// Granted or not.
        approved: bool,
    },
}

impl ServerMessage {
    /// Build a typed error message.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>, room_id: Option<String>) -> Self {
        Self::Error { code, message: message.into(), room_id }
    }

    /// A short kind label for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::Joined { .. } => "joined",
            Self::Operation { .. } => "operation",
            Self::Sync { .. } => "sync",
            Self::CallResult { .. } => "call_result",
            Self::Presence { .. } => "presence",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
            Self::ScreenshareStarted { .. } => "screenshare_started",
            Self::ScreenshareStopped { .. } => "screenshare_stopped",
            Self::RtcOffer { .. } => "rtc_offer",
            Self::RtcAnswer { .. } => "rtc_answer",
            Self::RtcIceCandidate { .. } => "rtc_ice_candidate",
            Self::RemoteControlRequest { .. } => "remote_control_request",
            Self::RemoteControlResponse { .. } => "remote_control_response",
        }
    }
}
