//! Sliding-window throttle for status polling.
//!
//! Each job carries a [`PollWindow`]. The first poll, or the first poll after
//! the window has elapsed, opens a new window with a count of one. Inside a
//! window polls are counted, and once the count exceeds the tolerance further
//! polls are throttled without touching the window.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

pub const DEFAULT_RETRY_AFTER_SECS: u64 = 1;
pub const DEFAULT_REQUEST_TOLERANCE: u32 = 10;

/// Poll bookkeeping stored on the job record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollWindow {
    /// Time of the first accepted poll in the current window.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    /// Accepted polls in the current window.
    #[serde(default)]
    pub requests: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// Answer 202 with `Retry-After`.
    Accepted,
    /// Answer 429; the window is unchanged.
    Throttled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRateLimiter {
    retry_after_secs: u64,
    tolerance: u32,
}

impl Default for PollRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_AFTER_SECS, DEFAULT_REQUEST_TOLERANCE)
    }
}

impl PollRateLimiter {
    pub fn new(retry_after_secs: u64, tolerance: u32) -> Self {
        Self {
            retry_after_secs,
            tolerance,
        }
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_secs
    }

    pub fn tolerance(&self) -> u32 {
        self.tolerance
    }

    fn window_length(&self) -> Duration {
        Duration::seconds(i64::try_from(self.retry_after_secs).unwrap_or(i64::MAX))
    }

    /// Applies one poll at `now` to `window`.
    pub fn register(&self, window: &mut PollWindow, now: OffsetDateTime) -> PollDecision {
        let expired = match window.started_at {
            None => true,
            Some(start) => now >= start.saturating_add(self.window_length()),
        };

        if expired {
            window.started_at = Some(now);
            window.requests = 1;
            PollDecision::Accepted
        } else if window.requests > self.tolerance {
            PollDecision::Throttled
        } else {
            window.requests += 1;
            PollDecision::Accepted
        }
    }
}
