//! Default value functions for configuration.
//!
//! Separated into its own module for clarity and reuse.

use std::net::SocketAddr;

/// Returns `true` (for serde defaults).
pub fn default_true() -> bool {
    true
}

pub fn default_server_name() -> String {
    "collabkit".to_string()
}

pub fn default_listen() -> SocketAddr {
    "127.0.0.1:8900".parse().expect("static address parses")
}

// =============================================================================
// Broker Defaults
// =============================================================================

pub fn default_ws_path() -> String {
    "/ws".to_string()
}

/// Messages per second per connection.
pub fn default_rate_limit() -> f32 {
    100.0
}

/// 1 MiB wire cap, mirrored from the protocol crate.
pub fn default_max_message_size() -> usize {
    collab_proto::MAX_MESSAGE_SIZE
}

/// Idle seconds before the broker pings a quiet connection.
pub fn default_message_timeout_secs() -> u64 {
    60
}

/// Hard cap on a function handler's runtime, in seconds.
pub fn default_function_timeout_secs() -> u64 {
    30
}

pub fn default_max_connections_per_user() -> usize {
    10
}
