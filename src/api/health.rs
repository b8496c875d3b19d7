//! Shared health state for the /health endpoint.
//! Updated by the feed poller after every cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::PollSummary;

/// Poll counters plus the most recent cycle summary. Poller writes, API reads.
#[derive(Default)]
pub struct HealthState {
    /// Cycles that ran to completion, gated ones included.
    pub polls_ok: AtomicU64,
    /// Cycles that failed (feed unreachable, bad payload, database down).
    pub polls_failed: AtomicU64,
    /// Millisecond timestamp of the last completed cycle (0 = none).
    pub last_poll_at_ms: AtomicU64,
    last_summary: Mutex<Option<PollSummary>>,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_summary: Option<PollSummary>,
    pub last_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_poll(&self, summary: &PollSummary, at: DateTime<Utc>) {
        self.polls_ok.fetch_add(1, Ordering::Relaxed);
        self.last_poll_at_ms
            .store(u64::try_from(at.timestamp_millis()).unwrap_or(0), Ordering::Relaxed);
        if let Ok(mut s) = self.last_summary.lock() {
            *s = Some(summary.clone());
        }
    }

    pub fn record_failure(&self, error: &str) {
        self.polls_failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut e) = self.last_error.lock() {
            *e = Some(error.to_string());
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let ms = self.last_poll_at_ms.load(Ordering::Relaxed);
        HealthSnapshot {
            polls_ok: self.polls_ok.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            last_poll_at: i64::try_from(ms)
                .ok()
                .filter(|ms| *ms > 0)
                .and_then(DateTime::<Utc>::from_timestamp_millis),
            last_summary: self.last_summary.lock().ok().and_then(|s| s.clone()),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn snapshot_reflects_last_poll() {
        let health = HealthState::new();
        assert!(health.snapshot().last_poll_at.is_none());

        let at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap();
        let summary = PollSummary { events: 3, changed: 2, ..PollSummary::default() };
        health.record_poll(&summary, at);
        health.record_failure("feed returned HTTP 503");

        let snap = health.snapshot();
        assert_eq!(snap.polls_ok, 1);
        assert_eq!(snap.polls_failed, 1);
        assert_eq!(snap.last_poll_at, Some(at));
        assert_eq!(snap.last_summary, Some(summary));
        assert_eq!(snap.last_error.as_deref(), Some("feed returned HTTP 503"));
    }
}
