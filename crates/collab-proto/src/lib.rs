//! # collab-proto
//!
//! The CRDT and wire-protocol engine shared by the CollabKit broker and
//! client: structural validation hardened against prototype-pollution
//! attacks, immutable operations, version vectors, Last-Writer-Wins
//! register and map CRDTs, and the bounded JSON wire codec.
//!
//! ## Design
//!
//! - Conflict resolution is a strict total order over `(timestamp, origin)`;
//!   replicas converge regardless of delivery order.
//! - Every ingress path validates: constructors, wire decode, and CRDT
//!   apply all reject dangerous keys and malformed structure with typed
//!   errors.
//! - Timestamps are advisory wall-clock seconds; a broker may substitute
//!   its own monotonic clock without breaking the order, because origins
//!   stay unique.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod codec;
pub mod crdt;
pub mod error;
pub mod message;
pub mod op;
pub mod validate;
pub mod version;

pub use self::codec::{
    decode_client, decode_client_bounded, decode_server, encode_client, encode_server,
};
pub use self::crdt::{beats, LwwMap, LwwRegister, MapSnapshot, SnapshotEntry, SnapshotTombstone};
pub use self::error::{ProtoError, Result};
pub use self::message::{ClientMessage, ErrorCode, ServerMessage, UserInfo};
pub use self::op::{now_seconds, OpKind, Operation};
pub use self::validate::{
    check_function_name, check_path, check_value, check_value_size, is_blocked_key, BLOCKED_KEYS,
    MAX_MESSAGE_SIZE, MAX_NESTING_DEPTH, MAX_VALUE_SIZE,
};
pub use self::version::VersionVector;
