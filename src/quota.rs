//! Anonymous download quota.
//!
//! Each anonymous identity key gets [`ANONYMOUS_DOWNLOAD_LIMIT`] downloads per
//! rolling window that starts at its first request. State is process-local and
//! lost on restart; a multi-instance deployment would need a shared counter.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const ANONYMOUS_DOWNLOAD_LIMIT: u32 = 5;
pub const QUOTA_WINDOW_SECONDS: i64 = 60 * 60;

/// Source of "now" for the window arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy)]
struct AnonymousQuotaEntry {
    window_start: DateTime<Utc>,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub admitted: bool,
    pub used: u32,
    pub remaining: u32,
}

pub struct QuotaTracker {
    entries: Mutex<HashMap<String, AnonymousQuotaEntry>>,
    clock: Arc<dyn Clock>,
    limit: u32,
    window: chrono::Duration,
}

impl QuotaTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            limit: ANONYMOUS_DOWNLOAD_LIMIT,
            window: chrono::Duration::seconds(QUOTA_WINDOW_SECONDS),
        }
    }

    /// Atomically checks the caller's window and consumes one download if any
    /// remain. Never fails: a poisoned lock admits the request.
    pub fn check_and_consume(&self, identity_key: &str) -> QuotaDecision {
        let now = self.clock.now();
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => {
                warn!(
                    identity_key,
                    "Quota tracker lock poisoned, admitting request without accounting"
                );
                return QuotaDecision {
                    admitted: true,
                    used: 0,
                    remaining: self.limit,
                };
            }
        };

        let entry = entries
            .entry(identity_key.to_string())
            .or_insert(AnonymousQuotaEntry {
                window_start: now,
                count: 0,
            });

        if now - entry.window_start >= self.window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= self.limit {
            return QuotaDecision {
                admitted: false,
                used: entry.count,
                remaining: 0,
            };
        }

        entry.count += 1;
        QuotaDecision {
            admitted: true,
            used: entry.count,
            remaining: self.limit - entry.count,
        }
    }

    /// Drops entries whose window went stale more than a window ago. Returns
    /// how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let Ok(mut entries) = self.entries.lock() else {
            warn!("Quota tracker lock poisoned, skipping sweep");
            return 0;
        };

        let before = entries.len();
        entries.retain(|_, entry| now - entry.window_start <= self.window);
        before - entries.len()
    }

    pub fn tracked_identities(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}

/// Runs [`QuotaTracker::sweep`] plus any extra cleanup every `every`.
pub fn spawn_sweeper<F>(tracker: Arc<QuotaTracker>, every: Duration, mut extra: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = tracker.sweep();
            extra();
            debug!(
                removed,
                remaining = tracker.tracked_identities(),
                "Swept stale anonymous quota entries"
            );
        }
    })
}
