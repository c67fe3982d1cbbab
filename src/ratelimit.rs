//! # Rate Limiter
//! Per-scope admission control over a fixed one-minute window.
//!
//! This is advisory backpressure, not a distributed quota: the in-memory
//! implementation is enough for a single process. A multi-process deployment
//! should put a shared-store implementation behind the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Admission decision for one action in one scope.
pub trait RateLimiter: Send + Sync {
    /// Returns `true` and counts the action when under `per_minute_limit`
    /// for the current minute window, `false` once the window is full.
    fn allow(&self, key: &str, per_minute_limit: u32) -> bool;
}

#[derive(Debug, Default)]
struct WindowState {
    /// Minutes since the epoch for the window the counter belongs to.
    minute: i64,
    count: u32,
}

/// Fixed-window counter keyed by an arbitrary scope string (callers use
/// `"{scope}:{action}"`). The counter resets whenever the current minute
/// differs from the stored one.
#[derive(Debug, Default)]
pub struct MinuteWindowLimiter {
    inner: Mutex<HashMap<String, WindowState>>,
}

impl MinuteWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Testable core: same as `allow` but with an explicit clock.
    pub fn allow_at(&self, key: &str, per_minute_limit: u32, now: DateTime<Utc>) -> bool {
        if per_minute_limit == 0 {
            return false;
        }
        let minute = now.timestamp() / 60;
        let mut map = self.inner.lock().expect("rate limiter mutex poisoned");
        let state = map.entry(key.to_string()).or_default();
        if state.minute != minute {
            state.minute = minute;
            state.count = 0;
        }
        if state.count >= per_minute_limit {
            return false;
        }
        state.count += 1;
        true
    }
}

impl RateLimiter for MinuteWindowLimiter {
    fn allow(&self, key: &str, per_minute_limit: u32) -> bool {
        self.allow_at(key, per_minute_limit, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn denies_at_limit_and_resets_next_minute() {
        let limiter = MinuteWindowLimiter::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 10).unwrap();

        for _ in 0..30 {
            assert!(limiter.allow_at("s1:respond", 30, t0));
        }
        // 31st call in the same minute is denied
        assert!(!limiter.allow_at("s1:respond", 30, t0 + Duration::seconds(5)));

        // window rolls over, counting restarts
        let t1 = t0 + Duration::seconds(60);
        assert!(limiter.allow_at("s1:respond", 30, t1));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = MinuteWindowLimiter::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert!(limiter.allow_at("s1:delete", 1, t0));
        assert!(!limiter.allow_at("s1:delete", 1, t0));
        assert!(limiter.allow_at("s2:delete", 1, t0));
    }

    #[test]
    fn zero_limit_always_denies() {
        let limiter = MinuteWindowLimiter::new();
        assert!(!limiter.allow_at("s1:flag", 0, Utc::now()));
    }
}
