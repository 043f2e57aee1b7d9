//! Per-connection session state.

use std::collections::HashSet;
use std::time::Instant;

use crate::auth::Principal;
use crate::network::RateLimiter;

/// Size/rate violations tolerated before the connection is closed.
pub const MAX_STRIKES: u32 = 3;

/// Everything the broker tracks for one authenticated connection.
pub struct SessionState {
    /// Connection id assigned at accept.
    pub conn_id: u64,
    /// The authenticated participant.
    pub principal: Principal,
    /// Rooms this connection has joined.
    pub joined: HashSet<String>,
    /// Per-connection token bucket.
    pub limiter: RateLimiter,
    /// Last message receipt, for idle-ping decisions.
    pub last_seen: Instant,
    strikes: u32,
}

impl SessionState {
    /// Create session state for a freshly authenticated connection.
    pub fn new(conn_id: u64, principal: Principal, rate_limit: f32) -> Self {
        Self {
            conn_id,
            principal,
            joined: HashSet::new(),
            // Burst capacity equals the rate: a full second of traffic.
            limiter: RateLimiter::new(rate_limit, rate_limit),
            last_seen: Instant::now(),
            strikes: 0,
        }
    }

    /// Record message receipt.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Record a size or rate violation. Returns `true` when the connection
    /// should now be closed.
    pub fn strike(&mut self) -> bool {
        self.strikes += 1;
        self.strikes >= MAX_STRIKES
    }

    /// Violations recorded so far.
    #[must_use]
    pub fn strikes(&self) -> u32 {
        self.strikes
    }
}
