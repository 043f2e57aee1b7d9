//! Error types for the CollabKit protocol library.
//!
//! Every decode and validation path returns a typed error so callers can
//! decide whether to drop a message, answer with a wire error, or close
//! the connection. Nothing in this crate silently swallows a fault.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtoError`].
pub type Result<T, E = ProtoError> = std::result::Result<T, E>;

/// Protocol-level errors: validation, codec, and CRDT apply failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// A path segment or object key matches a blocked sentinel
    /// (`__proto__` and friends).
    #[error("dangerous key rejected: {key:?}")]
    DangerousKey {
        /// The offending key.
        key: String,
    },

    /// A path segment is empty.
    #[error("empty path segment at index {index}")]
    EmptyPathSegment {
        /// Position of the empty segment within the path.
        index: usize,
    },

    /// A value nests deeper than the allowed limit.
    #[error("value nesting too deep: {depth} (limit: {limit})")]
    DepthExceeded {
        /// Observed nesting depth.
        depth: usize,
        /// Maximum allowed depth.
        limit: usize,
    },

    /// A single value exceeds the serialized size cap.
    #[error("value too large: {actual} bytes (limit: {limit})")]
    ValueTooLarge {
        /// Serialized value size.
        actual: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// A whole message exceeds the wire size cap.
    #[error("message too long: {actual} bytes (limit: {limit})")]
    MessageTooLong {
        /// Actual message length.
        actual: usize,
        /// Maximum allowed length.
        limit: usize,
    },

    /// A function name does not match `^[A-Za-z_][A-Za-z0-9_]*$`.
    #[error("invalid function name: {name:?}")]
    InvalidFunctionName {
        /// The rejected name.
        name: String,
    },

    /// A CRDT received an operation kind it does not support.
    #[error("unsupported operation kind: {kind}")]
    UnsupportedOp {
        /// The unsupported kind, as its wire string.
        kind: String,
    },

    /// An envelope failed structural validation.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// Human-readable reason.
        reason: String,
    },

    /// An operation failed structural validation.
    #[error("invalid operation: {reason}")]
    InvalidOperation {
        /// Human-readable reason.
        reason: String,
    },

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtoError {
    /// Get a static error code string for log and metric labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DangerousKey { .. } => "dangerous_key",
            Self::EmptyPathSegment { .. } => "empty_path_segment",
            Self::DepthExceeded { .. } => "depth_exceeded",
            Self::ValueTooLarge { .. } => "value_too_large",
            Self::MessageTooLong { .. } => "message_too_long",
            Self::InvalidFunctionName { .. } => "invalid_function_name",
            Self::UnsupportedOp { .. } => "unsupported_op",
            Self::InvalidMessage { .. } => "invalid_message",
            Self::InvalidOperation { .. } => "invalid_operation",
            Self::Json(_) => "json_error",
        }
    }
}
