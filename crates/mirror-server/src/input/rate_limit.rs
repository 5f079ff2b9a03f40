//! Sliding-window rate limiting for input actions.
//!
//! Each key keeps the timestamps of its recent actions; an action is allowed
//! while fewer than `max_actions` fall inside the window.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A rate limiter with one sliding window per key.
#[derive(Debug)]
pub struct RateLimiter {
    max_actions: u32,
    window: Duration,
    entries: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_actions: u32, window: Duration) -> Self {
        Self {
            max_actions,
            window,
            entries: HashMap::new(),
        }
    }

    /// Check if an action is allowed for the given key, and record it if so.
    pub fn check_and_record(&mut self, key: &str, now: Instant) -> bool {
        if !self.check(key, now) {
            return false;
        }
        self.record(key, now);
        true
    }

    /// Check without recording.
    pub fn check(&self, key: &str, now: Instant) -> bool {
        match self.entries.get(key) {
            Some(actions) => {
                let active = actions.iter().filter(|t| self.live(**t, now)).count();
                (active as u32) < self.max_actions
            }
            None => self.max_actions > 0,
        }
    }

    pub fn record(&mut self, key: &str, now: Instant) {
        let window = self.window;
        let actions = self.entries.entry(key.to_string()).or_default();
        while actions
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            actions.pop_front();
        }
        actions.push_back(now);
    }

    /// Drop keys with no action inside the window.
    pub fn gc(&mut self, now: Instant) {
        let window = self.window;
        self.entries.retain(|_, actions| {
            actions.retain(|t| now.saturating_duration_since(*t) < window);
            !actions.is_empty()
        });
    }

    fn live(&self, at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(at) < self.window
    }
}

/// Why an action was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    PerSecond(u32),
    PerMinute(u32),
}

/// Per-second and per-minute limits applied together.
#[derive(Debug)]
pub struct ActionLimits {
    per_second: RateLimiter,
    per_minute: RateLimiter,
    max_per_second: u32,
    max_per_minute: u32,
}

impl ActionLimits {
    pub fn new(max_per_second: u32, max_per_minute: u32) -> Self {
        Self {
            per_second: RateLimiter::new(max_per_second, Duration::from_secs(1)),
            per_minute: RateLimiter::new(max_per_minute, Duration::from_secs(60)),
            max_per_second,
            max_per_minute,
        }
    }

    /// Record an action unless either window is full. A refused action is
    /// not counted.
    pub fn admit(&mut self, key: &str, now: Instant) -> Result<(), LimitExceeded> {
        if !self.per_second.check(key, now) {
            return Err(LimitExceeded::PerSecond(self.max_per_second));
        }
        if !self.per_minute.check(key, now) {
            return Err(LimitExceeded::PerMinute(self.max_per_minute));
        }
        self.per_second.record(key, now);
        self.per_minute.record(key, now);
        Ok(())
    }

    pub fn gc(&mut self, now: Instant) {
        self.per_second.gc(now);
        self.per_minute.gc(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit() {
        let mut rl = RateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();
        assert!(rl.check_and_record("ip1", now));
        assert!(rl.check_and_record("ip1", now));
        assert!(rl.check_and_record("ip1", now));
        assert!(!rl.check_and_record("ip1", now));
    }

    #[test]
    fn different_keys_independent() {
        let mut rl = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(rl.check_and_record("a", now));
        assert!(rl.check_and_record("b", now));
        assert!(!rl.check_and_record("a", now));
    }

    #[test]
    fn window_slides() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(rl.check_and_record("k", t0));
        assert!(rl.check_and_record("k", t0 + Duration::from_millis(500)));
        assert!(!rl.check_and_record("k", t0 + Duration::from_millis(900)));
        // The first action has left the window.
        assert!(rl.check_and_record("k", t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn gc_drops_idle_keys() {
        let mut rl = RateLimiter::new(5, Duration::from_secs(1));
        let t0 = Instant::now();
        rl.record("k", t0);
        rl.gc(t0 + Duration::from_secs(2));
        assert!(rl.entries.is_empty());
    }

    #[test]
    fn per_second_limit_hits_first() {
        let mut limits = ActionLimits::new(2, 1000);
        let now = Instant::now();
        assert!(limits.admit("m", now).is_ok());
        assert!(limits.admit("m", now).is_ok());
        assert_eq!(limits.admit("m", now), Err(LimitExceeded::PerSecond(2)));
    }

    #[test]
    fn per_minute_limit() {
        let mut limits = ActionLimits::new(50, 3);
        let t0 = Instant::now();
        for i in 0..3 {
            assert!(limits.admit("m", t0 + Duration::from_secs(i * 2)).is_ok());
        }
        assert_eq!(
            limits.admit("m", t0 + Duration::from_secs(10)),
            Err(LimitExceeded::PerMinute(3))
        );
    }

    #[test]
    fn refused_actions_are_not_counted() {
        let mut limits = ActionLimits::new(1, 2);
        let t0 = Instant::now();
        assert!(limits.admit("m", t0).is_ok());
        assert!(limits.admit("m", t0).is_err());
        assert!(limits.admit("m", t0).is_err());
        assert!(limits.admit("m", t0 + Duration::from_secs(1)).is_ok());
    }
}
