//! CollabKit - real-time collaboration toolkit.
//!
//! Many clients connect to a central broker and mutate shared per-room
//! state whose concurrent writes merge automatically through the LWW CRDTs
//! in [`collab_proto`]. Clients also exchange transient presence, invoke
//! server-registered functions, and relay WebRTC signaling for
//! peer-to-peer screen sharing.
//!
//! The crate ships both halves of the system:
//!
//! - the broker: [`state::Hub`], [`network::Gateway`], and the
//!   per-connection session machine in [`network::Connection`], run as the
//!   `collabkitd` binary;
//! - the client engine: [`client::CollabClient`] with its offline queue
//!   and the [`client::ScreenShareCoordinator`].

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod perm;
pub mod state;
pub mod storage;

pub use collab_proto as proto;
