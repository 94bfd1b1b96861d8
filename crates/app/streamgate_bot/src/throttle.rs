//! Per-user rate limiting for inbound chat traffic.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Minimum spacing between requests from one user.
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Tracks the last accepted request per user.
pub struct RateLimiter {
    min_interval: Duration,
    last_seen: DashMap<i64, Instant>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_MIN_INTERVAL)
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_seen: DashMap::new(),
        }
    }

    /// Returns false when the user is sending too fast. Accepted requests
    /// move the user's slot forward; rejected ones do not.
    pub fn check(&self, user_id: i64) -> bool {
        let now = Instant::now();
        let mut allowed = true;
        self.last_seen
            .entry(user_id)
            .and_modify(|last| {
                if now.duration_since(*last) < self.min_interval {
                    allowed = false;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        allowed
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
