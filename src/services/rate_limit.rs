//! Fixed-window per-user request governor gating every pipeline entry
//! point.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-user window state, created lazily on first request.
#[derive(Debug, Clone)]
struct WindowEntry {
    window_start_utc: DateTime<Utc>,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Rejected,
}

impl RateLimitDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

/// Fixed-window counter per user id.
///
/// The window lookup, reset, and increment all happen under one lock, so
/// two concurrent requests for the same user cannot both claim the final
/// slot of a window.
pub struct RateLimiter {
    window: Duration,
    max_per_window: u32,
    entries: Mutex<HashMap<String, WindowEntry>>,
}

impl RateLimiter {
    pub fn new(window_seconds: u64, max_per_window: u32) -> Self {
        Self {
            window: Duration::seconds(window_seconds as i64),
            max_per_window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `user_id` and decide whether it may proceed.
    pub fn check(&self, user_id: &str) -> RateLimitDecision {
        self.check_at(user_id, Utc::now())
    }

    /// Clock-injected core of [`check`](Self::check).
    fn check_at(&self, user_id: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match entries.get_mut(user_id) {
            Some(entry) if now - entry.window_start_utc < self.window => {
                entry.count += 1;
                if entry.count <= self.max_per_window {
                    RateLimitDecision::Allowed
                } else {
                    RateLimitDecision::Rejected
                }
            }
            _ => {
                entries.insert(
                    user_id.to_string(),
                    WindowEntry {
                        window_start_utc: now,
                        count: 1,
                    },
                );
                RateLimitDecision::Allowed
            }
        }
    }
}
