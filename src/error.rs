//! Unified error handling for the broker.
//!
//! Handler errors carry enough context to build the wire `error` reply and
//! a static code for log labeling. The connection loop decides, per
//! variant, whether to drop the message, answer, or escalate to close.

use collab_proto::{ErrorCode, ProtoError, ServerMessage};
use thiserror::Error;

/// Errors that can occur while dispatching a client message.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("not a member of room {0}")]
    NotInRoom(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("no function named {0}")]
    FunctionNotFound(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("too many connections for user {0}")]
    TooManyConnections(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Get a static error code string for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::PermissionDenied(_) => "permission_denied",
            Self::RoomNotFound(_) => "room_not_found",
            Self::NotInRoom(_) => "not_in_room",
            Self::InvalidMessage(_) => "invalid_message",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::FunctionNotFound(_) => "function_not_found",
            Self::RateLimited => "rate_limited",
            Self::TooManyConnections(_) => "too_many_connections",
            Self::Proto(e) => e.error_code(),
            Self::Internal(_) => "internal_error",
        }
    }

    /// The wire code for this error.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            Self::PermissionDenied(_) | Self::NotInRoom(_) => ErrorCode::PermissionDenied,
            Self::RoomNotFound(_) => ErrorCode::RoomNotFound,
            Self::InvalidMessage(_) => ErrorCode::InvalidMessage,
            Self::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Self::FunctionNotFound(_) => ErrorCode::FunctionNotFound,
            Self::RateLimited | Self::TooManyConnections(_) => ErrorCode::RateLimited,
            Self::Proto(e) => match e {
                ProtoError::InvalidOperation { .. }
                | ProtoError::UnsupportedOp { .. }
                | ProtoError::DangerousKey { .. }
                | ProtoError::EmptyPathSegment { .. }
                | ProtoError::DepthExceeded { .. }
                | ProtoError::ValueTooLarge { .. } => ErrorCode::InvalidOperation,
                ProtoError::MessageTooLong { .. }
                | ProtoError::InvalidFunctionName { .. }
                | ProtoError::InvalidMessage { .. }
                | ProtoError::Json(_) => ErrorCode::InvalidMessage,
                _ => ErrorCode::InternalError,
            },
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Convert to a wire error reply.
    pub fn to_server_message(&self, room_id: Option<String>) -> ServerMessage {
        ServerMessage::error(self.wire_code(), self.to_string(), room_id)
    }

    /// Does this error count as a size/rate strike? Enough strikes close
    /// the connection.
    pub fn is_strike(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Proto(ProtoError::MessageTooLong { .. })
        )
    }
}

/// Result type for message dispatch.
pub type HandlerResult = Result<(), HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(HandlerError::RateLimited.error_code(), "rate_limited");
        assert_eq!(
            HandlerError::FunctionNotFound("f".into()).error_code(),
            "function_not_found"
        );
        assert_eq!(
            HandlerError::Proto(ProtoError::DangerousKey { key: "__proto__".into() })
                .error_code(),
            "dangerous_key"
        );
    }

    #[test]
    fn test_wire_code_mapping() {
        assert_eq!(
            HandlerError::NotInRoom("r".into()).wire_code(),
            ErrorCode::PermissionDenied
        );
        assert_eq!(
            HandlerError::Proto(ProtoError::DangerousKey { key: "constructor".into() })
                .wire_code(),
            ErrorCode::InvalidOperation
        );
        assert_eq!(
            HandlerError::Proto(ProtoError::MessageTooLong { actual: 2, limit: 1 }).wire_code(),
            ErrorCode::InvalidMessage
        );
    }

    #[test]
    fn test_strike_classification() {
        assert!(HandlerError::RateLimited.is_strike());
        assert!(
            HandlerError::Proto(ProtoError::MessageTooLong { actual: 2, limit: 1 }).is_strike()
        );
        assert!(!HandlerError::RoomNotFound("r".into()).is_strike());
    }

    #[test]
    fn test_to_server_message_carries_room() {
        let msg = HandlerError::RoomNotFound("lobby".into()).to_server_message(Some("lobby".into()));
        match msg {
            ServerMessage::Error { code, room_id, .. } => {
                assert_eq!(code, ErrorCode::RoomNotFound);
                assert_eq!(room_id.as_deref(), Some("lobby"));
            }
            other => panic!("expected error message, got {other:?}"),
        }
    }
}
