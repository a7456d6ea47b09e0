//! Abuse circuit breaker.
//!
//! Tracks provider abuse signals per job in a rolling window. The
//! breaker itself only answers "did this signal trip the breaker"; the
//! pause escalation (cooldown pause, then permanent pause) is driven by
//! the dispatcher, which owns the registry and notifier handles.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Rolling-window abuse signal counter, keyed by job.
pub struct AbuseBreaker {
    window: Duration,
    threshold: usize,
    signals: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl AbuseBreaker {
    pub fn new(window_secs: i64, threshold: usize) -> Self {
        Self {
            window: Duration::seconds(window_secs),
            threshold: threshold.max(1),
            signals: Mutex::new(HashMap::new()),
        }
    }

    /// Record one abuse signal; returns `true` when the signal count
    /// within the window reaches the threshold.
    ///
    /// A trip drains the job's window so the breach is reported exactly
    /// once; signals arriving while the job is paused start a fresh
    /// count.
    pub fn record(&self, job_id: &str, now: DateTime<Utc>) -> bool {
        let mut signals = self.signals.lock().expect("breaker lock poisoned");
        let window = signals.entry(job_id.to_string()).or_default();

        window.push_back(now);
        let cutoff = now - self.window;
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }

        if window.len() >= self.threshold {
            window.clear();
            true
        } else {
            false
        }
    }

    /// Drop a job's window, e.g. when the job reaches a terminal state.
    pub fn clear(&self, job_id: &str) {
        self.signals
            .lock()
            .expect("breaker lock poisoned")
            .remove(job_id);
    }
}
