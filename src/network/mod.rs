//! Network module.
//!
//! Contains the Gateway (TCP listener) and the per-connection session
//! handler, plus the rate-limiting primitives.

mod connection;
mod gateway;
mod limit;

pub use connection::Connection;
pub use gateway::Gateway;
pub use limit::{AuthGuard, RateLimiter};
