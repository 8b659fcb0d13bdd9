//! Per-pid sliding-window rate limiting.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default cap: requests per window per pid.
pub const RATE_LIMIT: usize = 100;

/// Default window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter keyed by peer pid.
///
/// Each pid keeps at most `limit` timestamps, so memory stays O(limit) per
/// active pid. Idle buckets are dropped by [`cleanup`](Self::cleanup), which
/// the daemon runs on a timer.
pub struct RateLimiter {
    buckets: Mutex<HashMap<i32, VecDeque<Instant>>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    /// Admits or rejects one request from `pid`, recording it if admitted.
    pub fn allow(&self, pid: i32) -> bool {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window);

        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let bucket = buckets.entry(pid).or_default();

        let in_window = match cutoff {
            Some(cutoff) => bucket.iter().filter(|t| **t > cutoff).count(),
            // Process younger than the window: everything recorded counts.
            None => bucket.len(),
        };
        if in_window >= self.limit {
            return false;
        }

        bucket.push_back(now);
        if bucket.len() > self.limit {
            bucket.pop_front();
        }
        true
    }

    /// Drops buckets whose most recent request is older than the window.
    pub fn cleanup(&self) {
        let cutoff = Instant::now().checked_sub(self.window);
        let Some(cutoff) = cutoff else {
            return;
        };

        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        buckets.retain(|_, bucket| bucket.back().is_some_and(|t| *t > cutoff));
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT, RATE_LIMIT_WINDOW)
    }
}
