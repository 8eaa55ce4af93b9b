//! Per-user submission rate limiter
//!
//! A rolling counter per key: the first submission opens a window, every
//! submission inside it counts, and the counter resets once the window has
//! elapsed.

use crate::UserId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Submissions allowed per window
    pub max_submissions: u32,
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_submissions: 30,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    pub fn with_max_submissions(mut self, max: u32) -> Self {
        self.max_submissions = max;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Keyed rolling-window counter store
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<UserId, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Count one submission for `user`. Returns `false` when the user has
    /// already used up the current window.
    pub fn try_acquire(&self, user: &UserId) -> bool {
        self.try_acquire_at(user, Instant::now())
    }

    pub fn try_acquire_at(&self, user: &UserId, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(user.clone()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(window.started) >= self.config.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= self.config.max_submissions {
            return false;
        }
        window.count += 1;
        true
    }

    /// Submissions left in the user's current window
    pub fn remaining(&self, user: &UserId) -> u32 {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        match windows.get(user) {
            Some(w) if w.started.elapsed() < self.config.window => {
                self.config.max_submissions.saturating_sub(w.count)
            }
            _ => self.config.max_submissions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            RateLimiterConfig::default()
                .with_max_submissions(max)
                .with_window(Duration::from_secs(window_secs)),
        )
    }

    #[test]
    fn test_default_config() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.max_submissions, 30);
        assert_eq!(config.window, Duration::from_secs(60));
    }

    #[test]
    fn test_limit_within_window() {
        let limiter = limiter(3, 60);
        let alice = UserId::new("alice");
        let now = Instant::now();

        assert!(limiter.try_acquire_at(&alice, now));
        assert!(limiter.try_acquire_at(&alice, now));
        assert!(limiter.try_acquire_at(&alice, now + Duration::from_secs(10)));
        assert!(!limiter.try_acquire_at(&alice, now + Duration::from_secs(59)));
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let limiter = limiter(1, 60);
        let alice = UserId::new("alice");
        let now = Instant::now();

        assert!(limiter.try_acquire_at(&alice, now));
        assert!(!limiter.try_acquire_at(&alice, now + Duration::from_secs(30)));
        assert!(limiter.try_acquire_at(&alice, now + Duration::from_secs(60)));
    }

    #[test]
    fn test_users_are_counted_separately() {
        let limiter = limiter(1, 60);
        let now = Instant::now();
        assert!(limiter.try_acquire_at(&UserId::new("alice"), now));
        assert!(limiter.try_acquire_at(&UserId::new("bob"), now));
        assert!(!limiter.try_acquire_at(&UserId::new("alice"), now));
    }

    #[test]
    fn test_remaining() {
        let limiter = limiter(5, 60);
        let alice = UserId::new("alice");
        assert_eq!(limiter.remaining(&alice), 5);
        limiter.try_acquire(&alice);
        limiter.try_acquire(&alice);
        assert_eq!(limiter.remaining(&alice), 3);
    }
}
