//! Sliding-window limiter for login attempts.
//!
//! Each key keeps the instants of its recent attempts; attempts older than
//! the window fall off before the count is checked.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    window: Duration,
    /// key → attempt timestamps inside the window.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Record an attempt for `key` if it is allowed.
    ///
    /// Returns `false` when the key is over its limit; the rejected attempt
    /// is not recorded.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Drop keys with no attempts left in the window.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Login attempts per remote IP.
#[derive(Debug)]
pub struct LoginRateLimit {
    limiter: RateLimiter,
}

impl LoginRateLimit {
    /// `per_minute == 0` disables limiting.
    pub fn per_minute(per_minute: u32) -> Option<Self> {
        (per_minute > 0).then(|| Self {
            limiter: RateLimiter::new(per_minute, Duration::from_secs(60)),
        })
    }

    pub fn check(&mut self, ip: &IpAddr) -> bool {
        self.limiter.check_and_record(&ip.to_string())
    }

    pub fn gc(&mut self) {
        self.limiter.gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_within_window() {
        let mut rl = RateLimiter::new(3, Duration::from_secs(60));
        assert!(rl.check_and_record("a"));
        assert!(rl.check_and_record("a"));
        assert!(rl.check_and_record("a"));
        assert!(!rl.check_and_record("a"));
        // other keys are independent
        assert!(rl.check_and_record("b"));
    }

    #[test]
    fn window_expiry_frees_slots() {
        let mut rl = RateLimiter::new(1, Duration::from_millis(20));
        assert!(rl.check_and_record("a"));
        assert!(!rl.check_and_record("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(rl.check_and_record("a"));
    }

    #[test]
    fn gc_drops_idle_keys() {
        let mut rl = RateLimiter::new(5, Duration::from_millis(10));
        rl.check_and_record("a");
        rl.check_and_record("b");
        assert_eq!(rl.tracked_keys(), 2);
        std::thread::sleep(Duration::from_millis(20));
        rl.gc();
        assert_eq!(rl.tracked_keys(), 0);
    }

    #[test]
    fn login_limit_per_ip() {
        assert!(LoginRateLimit::per_minute(0).is_none());
        let mut limit = LoginRateLimit::per_minute(2).unwrap();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limit.check(&ip));
        assert!(limit.check(&ip));
        assert!(!limit.check(&ip));
        assert!(limit.check(&"10.0.0.2".parse().unwrap()));
    }
}
