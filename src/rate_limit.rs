use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::quota::Clock;

type WindowMap = HashMap<String, Vec<DateTime<Utc>>>;

pub const ANONYMOUS_REQUESTS_PER_WINDOW: usize = 5;
pub const ANONYMOUS_WINDOW_MINUTES: i64 = 60;
pub const AUTHENTICATED_REQUESTS_PER_WINDOW: usize = 50;
pub const AUTHENTICATED_WINDOW_MINUTES: i64 = 15;

const SLOW_DOWN_WINDOW_MINUTES: i64 = 15;
const SLOW_DOWN_DELAY_AFTER: usize = 5;
const SLOW_DOWN_STEP_MS: u64 = 500;
const SLOW_DOWN_MAX_DELAY_MS: u64 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: usize },
    Limited { retry_after_seconds: u64 },
}

/// Keyed sliding-window request counter. Every admitted request leaves a
/// timestamp; a key is limited while `max_requests` timestamps are younger
/// than the window.
pub struct SlidingWindowLimiter {
    hits: Mutex<WindowMap>,
    clock: Arc<dyn Clock>,
    max_requests: usize,
    window: chrono::Duration,
}

impl SlidingWindowLimiter {
    pub fn new(clock: Arc<dyn Clock>, max_requests: usize, window: chrono::Duration) -> Self {
        Self {
            hits: Mutex::new(HashMap::new()),
            clock,
            max_requests,
            window,
        }
    }

    pub fn anonymous(clock: Arc<dyn Clock>) -> Self {
        Self::new(
            clock,
            ANONYMOUS_REQUESTS_PER_WINDOW,
            chrono::Duration::minutes(ANONYMOUS_WINDOW_MINUTES),
        )
    }

    pub fn authenticated(clock: Arc<dyn Clock>) -> Self {
        Self::new(
            clock,
            AUTHENTICATED_REQUESTS_PER_WINDOW,
            chrono::Duration::minutes(AUTHENTICATED_WINDOW_MINUTES),
        )
    }

    pub fn check(&self, key: &str) -> RateDecision {
        let now = self.clock.now();
        let window_start = now - self.window;

        let Ok(mut hits) = self.hits.lock() else {
            warn!(key, "Rate limiter lock poisoned, allowing request");
            return RateDecision::Allowed { remaining: 0 };
        };

        let entries = hits.entry(key.to_string()).or_default();
        entries.retain(|timestamp| *timestamp > window_start);

        if entries.len() >= self.max_requests {
            let reset_at = entries
                .first()
                .map(|oldest| *oldest + self.window)
                .unwrap_or(now + self.window);
            return RateDecision::Limited {
                retry_after_seconds: (reset_at - now).num_seconds().max(1) as u64,
            };
        }

        entries.push(now);
        RateDecision::Allowed {
            remaining: self.max_requests - entries.len(),
        }
    }

    /// Forgets keys with no timestamps left inside the window.
    pub fn prune(&self) {
        let window_start = self.clock.now() - self.window;
        if let Ok(mut hits) = self.hits.lock() {
            hits.retain(|_, timestamps| {
                timestamps.retain(|timestamp| *timestamp > window_start);
                !timestamps.is_empty()
            });
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.hits.lock().map(|hits| hits.len()).unwrap_or(0)
    }
}

/// Delays, rather than rejects, bursts on the download routes: after
/// `delay_after` requests in the window each extra request waits one more step.
pub struct SlowDown {
    hits: Mutex<WindowMap>,
    clock: Arc<dyn Clock>,
    window: chrono::Duration,
    delay_after: usize,
    step: Duration,
    max_delay: Duration,
}

impl SlowDown {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            hits: Mutex::new(HashMap::new()),
            clock,
            window: chrono::Duration::minutes(SLOW_DOWN_WINDOW_MINUTES),
            delay_after: SLOW_DOWN_DELAY_AFTER,
            step: Duration::from_millis(SLOW_DOWN_STEP_MS),
            max_delay: Duration::from_millis(SLOW_DOWN_MAX_DELAY_MS),
        }
    }

    /// Records a hit for `key` and returns how long the request should wait.
    pub fn register(&self, key: &str) -> Duration {
        let now = self.clock.now();
        let window_start = now - self.window;

        let Ok(mut hits) = self.hits.lock() else {
            return Duration::ZERO;
        };

        let entries = hits.entry(key.to_string()).or_default();
        entries.retain(|timestamp| *timestamp > window_start);
        entries.push(now);

        let over = entries.len().saturating_sub(self.delay_after) as u32;
        (self.step * over).min(self.max_delay)
    }

    pub fn prune(&self) {
        let window_start = self.clock.now() - self.window;
        if let Ok(mut hits) = self.hits.lock() {
            hits.retain(|_, timestamps| {
                timestamps.retain(|timestamp| *timestamp > window_start);
                !timestamps.is_empty()
            });
        }
    }
}
