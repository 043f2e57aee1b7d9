//! Flood and brute-force protection primitives.
//!
//! Two mechanisms guard the broker:
//!
//! - a token-bucket [`RateLimiter`] per connection, where tokens refill
//!   continuously at the configured rate and each message costs one;
//! - a windowed per-IP [`AuthGuard`] that blocks an address for five
//!   minutes after five authentication failures within five minutes.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Per-connection token bucket.
///
/// The bucket starts full at `capacity` tokens and earns `rate` tokens per
/// second continuously. A plain message costs one token; a send that the
/// bucket cannot cover is refused outright and consumes nothing, so a
/// flooding connection pays no penalty beyond the refusal itself.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Bucket earning `rate` tokens per second, holding at most `capacity`.
    pub fn new(rate: f32, capacity: f32) -> Self {
        Self {
            rate: f64::from(rate),
            capacity: f64::from(capacity),
            tokens: f64::from(capacity),
            refilled_at: Instant::now(),
        }
    }

    /// Credit tokens earned since the last settlement, clamped at capacity.
    fn refill(&mut self) {
        let earned = self.refilled_at.elapsed().as_secs_f64() * self.rate;
        self.tokens = self.capacity.min(self.tokens + earned);
        self.refilled_at = Instant::now();
    }

    /// Spend one token for a message. Refused sends consume nothing.
    pub fn can_send(&mut self) -> bool {
        self.charge(1.0)
    }

    /// Spend `cost` tokens if the bucket covers the whole amount.
    pub fn charge(&mut self, cost: f64) -> bool {
        self.refill();
        if self.tokens < cost {
            return false;
        }
        self.tokens -= cost;
        true
    }
}

/// Failures allowed inside the window before an IP is blocked.
const AUTH_MAX_FAILURES: usize = 5;
/// Failure-counting window.
const AUTH_WINDOW: Duration = Duration::from_secs(5 * 60);
/// How long a blocked IP stays blocked.
const AUTH_BLOCK: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default)]
struct AttemptState {
    failures: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Per-IP authentication lockout.
#[derive(Debug, Default)]
pub struct AuthGuard {
    attempts: Mutex<HashMap<IpAddr, AttemptState>>,
}

impl AuthGuard {
    /// Is `ip` currently blocked from authenticating?
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let mut attempts = self.attempts.lock();
        let Some(state) = attempts.get_mut(&ip) else { return false };
        match state.blocked_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Block elapsed; start the IP fresh.
                attempts.remove(&ip);
                false
            }
            None => false,
        }
    }

    /// Record a failed attempt. Returns `true` when this failure tripped
    /// the lockout.
    pub fn record_failure(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut attempts = self.attempts.lock();
        let state = attempts.entry(ip).or_default();

        state.failures.push_back(now);
        while let Some(&oldest) = state.failures.front() {
            if now.duration_since(oldest) > AUTH_WINDOW {
                state.failures.pop_front();
            } else {
                break;
            }
        }

        if state.failures.len() >= AUTH_MAX_FAILURES {
            state.blocked_until = Some(now + AUTH_BLOCK);
            debug!(ip = %ip, "auth lockout tripped");
            true
        } else {
            false
        }
    }

    /// Record a successful authentication, clearing the IP's history.
    pub fn record_success(&self, ip: IpAddr) {
        self.attempts.lock().remove(&ip);
    }

    /// Drop stale entries. Called from the broker's maintenance task.
    pub fn prune(&self) {
        let now = Instant::now();
        self.attempts.lock().retain(|_, state| {
            let blocked = state.blocked_until.is_some_and(|until| now < until);
            let recent = state
                .failures
                .back()
                .is_some_and(|&last| now.duration_since(last) <= AUTH_WINDOW);
            blocked || recent
        });
    }
}
