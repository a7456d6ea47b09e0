//! Engine tuning knobs.

use serde::{Deserialize, Serialize};

/// Dispatch engine configuration.
///
/// Defaults suit a mid-size channel; deployments override per config
/// file. Rate controller tuning lives in
/// [`courier_rate::RateConfig`], not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Entries claimed per dispatch cycle from the current group.
    pub batch_size: usize,
    /// Cap on straggler entries backfilled from earlier groups per cycle.
    pub straggler_batch_limit: usize,
    /// Upper bound on concurrent in-flight sends within a batch.
    pub max_concurrency: usize,
    /// Total delivery attempts per entry, including the first.
    pub max_attempts: i64,
    /// Seconds an entry may sit in flight before the sweeper resets it.
    pub stuck_timeout_secs: i64,
    /// Interval between recovery sweeps, in seconds.
    pub sweep_interval_secs: u64,
    /// Length of the abuse signal window, in seconds.
    pub abuse_window_secs: i64,
    /// Abuse signals within the window that trip the breaker.
    pub abuse_threshold: usize,
    /// Cooldown before a first-breach job auto-resumes, in seconds.
    pub abuse_cooldown_secs: i64,
    /// Stuck fraction below which a group may be left behind.
    pub advance_stuck_tolerance: f64,
    /// Completed fraction above which a group may be left behind.
    pub advance_complete_threshold: f64,
    /// Poll delay after a cycle that found work, in milliseconds.
    pub poll_active_ms: u64,
    /// Poll delay after an idle cycle, in milliseconds.
    pub poll_idle_ms: u64,
    /// Interval between scans for newly registered channels, in seconds.
    pub channel_rescan_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            straggler_batch_limit: 50,
            max_concurrency: 32,
            max_attempts: 3,
            stuck_timeout_secs: 120,
            sweep_interval_secs: 60,
            abuse_window_secs: 600,
            abuse_threshold: 30,
            abuse_cooldown_secs: 1800,
            advance_stuck_tolerance: 0.01,
            advance_complete_threshold: 0.99,
            poll_active_ms: 250,
            poll_idle_ms: 5000,
            channel_rescan_secs: 10,
        }
    }
}
