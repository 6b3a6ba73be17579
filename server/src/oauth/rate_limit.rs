//! Fixed-window rate limiting for the OAuth endpoints, keyed by remote IP.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

pub const DEFAULT_LIMIT: u32 = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<(IpAddr, &'static str), (Instant, u32)>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT, DEFAULT_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record one hit for `(ip, endpoint)`; false means the caller is over
    /// the limit for the current window.
    pub fn check(&self, ip: IpAddr, endpoint: &'static str) -> bool {
        let now = Instant::now();
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        };
        let entry = buckets.entry((ip, endpoint)).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1 <= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn allows_up_to_the_limit_then_blocks() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check(ip(1), "token"));
        assert!(limiter.check(ip(1), "token"));
        assert!(limiter.check(ip(1), "token"));
        assert!(!limiter.check(ip(1), "token"));
    }

    #[test]
    fn buckets_are_per_ip_and_endpoint() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check(ip(1), "token"));
        assert!(limiter.check(ip(2), "token"));
        assert!(limiter.check(ip(1), "authorize"));
        assert!(!limiter.check(ip(1), "token"));
    }

    #[test]
    fn window_resets_the_count() {
        let limiter = RateLimiter::new(1, Duration::from_millis(0));
        assert!(limiter.check(ip(1), "token"));
        assert!(limiter.check(ip(1), "token"));
    }
}
