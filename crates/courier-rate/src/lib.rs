//! Per-channel adaptive rate control.
//!
//! Each channel carries an in-memory [`RateState`]: the current
//! permitted rate plus two real rolling windows of recent outcomes
//! (success timestamps and rate-limit-error timestamps). The controller
//! adjusts the rate AIMD-style:
//!
//! - **Increase** +10% when the rolling error rate is below the
//!   threshold and enough samples have accrued, capped at `max_rate`.
//! - **Decrease** −20% after three *consecutive* rate-limit rejections
//!   (generic errors do not count toward the streak), floored at
//!   `min_rate`.
//! - **Halve** when the abuse circuit breaker trips.
//! - **Daily reset**: the first touch of a channel on a new calendar
//!   day reseeds the rate at 90% of the previous day's final stable
//!   rate; within a day, the rate carries forward across jobs.
//!
//! State is process-local; `current_rate`/`last_stable_rate` are
//! checkpointed to the channel registry on every meaningful change and
//! on a fixed interval, so a restart resumes near the last achieved
//! rate instead of cold-starting.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use courier_database::{queries, AsyncDatabase, Channel, DatabaseResult};
use courier_gateway::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info};

/// Rate controller tuning. These are operationally tuned values, not
/// invariants - every deployment is expected to override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Floor for the channel rate (messages/sec).
    pub min_rate: i64,
    /// Ceiling for the channel rate (messages/sec).
    pub max_rate: i64,
    /// Additive-increase step as a fraction of the current rate.
    pub increase_step: f64,
    /// Multiplicative-decrease step as a fraction of the current rate.
    pub decrease_step: f64,
    /// Length of the rolling outcome windows, in seconds.
    pub window_secs: i64,
    /// Error fraction below which an increase is allowed.
    pub increase_error_threshold: f64,
    /// Minimum outcomes in the window before an increase is considered.
    pub min_sample_size: usize,
    /// Consecutive rate-limit rejections that trigger a decrease.
    pub consecutive_rate_limit_trigger: u32,
    /// Minimum spacing between rate changes, in seconds.
    pub rate_change_cooldown_secs: i64,
    /// Interval between registry checkpoints, in seconds.
    pub flush_interval_secs: i64,
    /// Fraction of the last stable rate used to seed a new day.
    pub daily_reset_factor: f64,
    /// Operator reference timezone as a fixed UTC offset, for the
    /// daily-reset day boundary.
    pub reset_utc_offset_hours: i32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            min_rate: 10,
            max_rate: 1000,
            increase_step: 0.10,
            decrease_step: 0.20,
            window_secs: 300,
            increase_error_threshold: 0.01,
            min_sample_size: 50,
            consecutive_rate_limit_trigger: 3,
            rate_change_cooldown_secs: 10,
            flush_interval_secs: 300,
            daily_reset_factor: 0.9,
            reset_utc_offset_hours: 0,
        }
    }
}

/// In-memory adaptive state for one channel.
#[derive(Debug)]
struct RateState {
    current_rate: i64,
    last_stable_rate: i64,
    /// Timestamps of recent successes, pruned to the window.
    successes: VecDeque<DateTime<Utc>>,
    /// Timestamps of recent rejections, pruned to the window.
    errors: VecDeque<DateTime<Utc>>,
    consecutive_rate_limited: u32,
    last_rate_change_at: Option<DateTime<Utc>>,
    /// Calendar day (in the reference timezone) this state last served.
    last_seen_day: NaiveDate,
    /// Whether the rate changed since the last checkpoint.
    dirty: bool,
    last_flush_at: DateTime<Utc>,
}

impl RateState {
    fn prune(&mut self, window: Duration, now: DateTime<Utc>) {
        let cutoff = now - window;
        while self.successes.front().is_some_and(|t| *t < cutoff) {
            self.successes.pop_front();
        }
        while self.errors.front().is_some_and(|t| *t < cutoff) {
            self.errors.pop_front();
        }
    }

    fn sample_size(&self) -> usize {
        self.successes.len() + self.errors.len()
    }

    fn error_fraction(&self) -> f64 {
        let total = self.sample_size();
        if total == 0 {
            0.0
        } else {
            self.errors.len() as f64 / total as f64
        }
    }
}

/// Per-channel adaptive rate controller.
///
/// Shared across the engine behind an `Arc`; all mutation goes through
/// the internal mutex.
pub struct RateController {
    config: RateConfig,
    states: Mutex<HashMap<String, RateState>>,
}

impl RateController {
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    /// Seed (or refresh) a channel's state from its persisted registry
    /// row, applying the daily reset if the calendar day rolled over.
    ///
    /// Called at the start of every job on the channel; within a day
    /// this is a no-op for an already-tracked channel.
    pub fn touch_channel(&self, channel: &Channel, now: DateTime<Utc>) {
        let day = self.reference_day(now);
        let mut states = self.lock_states();

        let state = states.entry(channel.id.clone()).or_insert_with(|| {
            debug!(
                channel_id = %channel.id,
                current_rate = channel.current_rate,
                "Restoring rate state from registry"
            );
            RateState {
                current_rate: channel.current_rate.max(self.config.min_rate),
                last_stable_rate: channel.last_stable_rate.max(self.config.min_rate),
                successes: VecDeque::new(),
                errors: VecDeque::new(),
                consecutive_rate_limited: 0,
                last_rate_change_at: None,
                last_seen_day: day,
                dirty: false,
                last_flush_at: now,
            }
        });

        if day > state.last_seen_day {
            let seeded = ((state.last_stable_rate as f64 * self.config.daily_reset_factor) as i64)
                .clamp(self.config.min_rate, self.config.max_rate);
            info!(
                channel_id = %channel.id,
                from = state.current_rate,
                to = seeded,
                "Daily rate reset"
            );
            state.current_rate = seeded;
            state.successes.clear();
            state.errors.clear();
            state.consecutive_rate_limited = 0;
            state.last_rate_change_at = None;
            state.last_seen_day = day;
            state.dirty = true;
        }
    }

    /// Current permitted rate for a channel (messages/sec).
    pub fn current_rate(&self, channel_id: &str) -> i64 {
        self.lock_states()
            .get(channel_id)
            .map(|s| s.current_rate)
            .unwrap_or(self.config.min_rate)
    }

    /// Last rate that held without error pressure.
    pub fn last_stable_rate(&self, channel_id: &str) -> i64 {
        self.lock_states()
            .get(channel_id)
            .map(|s| s.last_stable_rate)
            .unwrap_or(self.config.min_rate)
    }

    /// Record a successful send and consider an additive increase.
    pub fn record_success(&self, channel_id: &str, now: DateTime<Utc>) {
        let window = Duration::seconds(self.config.window_secs);
        let mut states = self.lock_states();
        let Some(state) = states.get_mut(channel_id) else {
            return;
        };

        state.successes.push_back(now);
        state.consecutive_rate_limited = 0;
        state.prune(window, now);

        // Clean window with enough evidence: nudge the rate up.
        if state.sample_size() >= self.config.min_sample_size
            && state.error_fraction() < self.config.increase_error_threshold
            && self.cooldown_elapsed(state, now)
            && state.current_rate < self.config.max_rate
        {
            let step = ((state.current_rate as f64 * self.config.increase_step) as i64).max(1);
            let new_rate = (state.current_rate + step).min(self.config.max_rate);
            debug!(
                channel_id = %channel_id,
                from = state.current_rate,
                to = new_rate,
                "Rate increase"
            );
            state.current_rate = new_rate;
            // The rate we just grew past held clean; remember it as stable.
            state.last_stable_rate = new_rate;
            state.last_rate_change_at = Some(now);
            state.dirty = true;
        }
    }

    /// Record a rejected send and consider a multiplicative decrease.
    ///
    /// Only rate-limit rejections extend the consecutive streak; any
    /// other category breaks it (but still lands in the error window).
    pub fn record_rejection(
        &self,
        channel_id: &str,
        category: ErrorCategory,
        now: DateTime<Utc>,
    ) {
        let window = Duration::seconds(self.config.window_secs);
        let mut states = self.lock_states();
        let Some(state) = states.get_mut(channel_id) else {
            return;
        };

        state.errors.push_back(now);
        state.prune(window, now);

        if category == ErrorCategory::RateLimited {
            state.consecutive_rate_limited += 1;
            if state.consecutive_rate_limited >= self.config.consecutive_rate_limit_trigger {
                let new_rate = ((state.current_rate as f64
                    * (1.0 - self.config.decrease_step)) as i64)
                    .max(self.config.min_rate);
                info!(
                    channel_id = %channel_id,
                    from = state.current_rate,
                    to = new_rate,
                    "Rate decrease after consecutive rate limits"
                );
                state.current_rate = new_rate;
                state.consecutive_rate_limited = 0;
                state.last_rate_change_at = Some(now);
                state.dirty = true;
            }
        } else {
            state.consecutive_rate_limited = 0;
        }
    }

    /// Halve the channel rate as part of an abuse pause.
    pub fn apply_abuse_penalty(&self, channel_id: &str, now: DateTime<Utc>) {
        let mut states = self.lock_states();
        let Some(state) = states.get_mut(channel_id) else {
            return;
        };
        let new_rate = (state.current_rate / 2).max(self.config.min_rate);
        info!(
            channel_id = %channel_id,
            from = state.current_rate,
            to = new_rate,
            "Rate halved for abuse pause"
        );
        state.current_rate = new_rate;
        state.last_rate_change_at = Some(now);
        state.dirty = true;
    }

    /// Flush changed (or stale) channel rates to the registry.
    ///
    /// Channels are written when their rate changed since the last
    /// checkpoint or the flush interval elapsed; `force` writes all
    /// tracked channels (used at shutdown).
    pub async fn checkpoint(
        &self,
        db: &AsyncDatabase,
        now: DateTime<Utc>,
        force: bool,
    ) -> DatabaseResult<()> {
        let flush_interval = Duration::seconds(self.config.flush_interval_secs);

        let to_flush: Vec<(String, i64, i64)> = {
            let mut states = self.lock_states();
            states
                .iter_mut()
                .filter(|(_, s)| force || s.dirty || now - s.last_flush_at >= flush_interval)
                .map(|(id, s)| {
                    s.dirty = false;
                    s.last_flush_at = now;
                    (id.clone(), s.current_rate, s.last_stable_rate)
                })
                .collect()
        };

        for (channel_id, current_rate, last_stable_rate) in to_flush {
            let id = channel_id.clone();
            let result = db
                .call(move |conn| {
                    queries::update_channel_rates(conn, &id, current_rate, last_stable_rate)
                })
                .await;

            if let Err(e) = result {
                // The rate change did not land; re-mark the channel so
                // the next checkpoint retries instead of dropping it.
                if let Some(state) = self.lock_states().get_mut(&channel_id) {
                    state.dirty = true;
                }
                return Err(e);
            }
        }

        Ok(())
    }

    fn cooldown_elapsed(&self, state: &RateState, now: DateTime<Utc>) -> bool {
        match state.last_rate_change_at {
            Some(at) => now - at >= Duration::seconds(self.config.rate_change_cooldown_secs),
            None => true,
        }
    }

    fn reference_day(&self, now: DateTime<Utc>) -> NaiveDate {
        (now + Duration::hours(self.config.reset_utc_offset_hours as i64)).date_naive()
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<String, RateState>> {
        self.states.lock().expect("rate state lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_database::NewChannel;

    fn test_channel(rate: i64) -> Channel {
        Channel {
            id: "ch-1".to_string(),
            label: "test".to_string(),
            current_rate: rate,
            last_stable_rate: rate,
            active: true,
            rate_updated_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn controller() -> RateController {
        RateController::new(RateConfig {
            min_sample_size: 10,
            rate_change_cooldown_secs: 0,
            ..Default::default()
        })
    }

    #[test]
    fn test_restore_seeds_from_registry() {
        let controller = controller();
        let now = Utc::now();
        controller.touch_channel(&test_channel(120), now);
        assert_eq!(controller.current_rate("ch-1"), 120);

        // Untracked channels fall back to the floor.
        assert_eq!(controller.current_rate("ch-unknown"), 10);
    }

    #[test]
    fn test_increase_needs_samples_and_clean_window() {
        let controller = controller();
        let now = Utc::now();
        controller.touch_channel(&test_channel(100), now);

        // Too few samples: no change.
        for _ in 0..5 {
            controller.record_success("ch-1", now);
        }
        assert_eq!(controller.current_rate("ch-1"), 100);

        // Enough clean samples: +10%.
        for _ in 0..5 {
            controller.record_success("ch-1", now);
        }
        assert_eq!(controller.current_rate("ch-1"), 110);
        assert_eq!(controller.last_stable_rate("ch-1"), 110);
    }

    #[test]
    fn test_no_increase_when_error_rate_high() {
        let controller = controller();
        let now = Utc::now();
        controller.touch_channel(&test_channel(100), now);

        controller.record_rejection("ch-1", ErrorCategory::Transient, now);
        for _ in 0..20 {
            controller.record_success("ch-1", now);
        }
        // 1 error in 21 samples is ~4.8%, above the 1% threshold.
        assert_eq!(controller.current_rate("ch-1"), 100);
    }

    #[test]
    fn test_decrease_on_three_consecutive_rate_limits() {
        let controller = controller();
        let now = Utc::now();
        controller.touch_channel(&test_channel(100), now);

        controller.record_rejection("ch-1", ErrorCategory::RateLimited, now);
        controller.record_rejection("ch-1", ErrorCategory::RateLimited, now);
        assert_eq!(controller.current_rate("ch-1"), 100);

        controller.record_rejection("ch-1", ErrorCategory::RateLimited, now);
        assert_eq!(controller.current_rate("ch-1"), 80);
        // Stable rate is untouched by a decrease.
        assert_eq!(controller.last_stable_rate("ch-1"), 100);
    }

    #[test]
    fn test_generic_errors_break_the_streak() {
        let controller = controller();
        let now = Utc::now();
        controller.touch_channel(&test_channel(100), now);

        controller.record_rejection("ch-1", ErrorCategory::RateLimited, now);
        controller.record_rejection("ch-1", ErrorCategory::RateLimited, now);
        controller.record_rejection("ch-1", ErrorCategory::Transient, now);
        controller.record_rejection("ch-1", ErrorCategory::RateLimited, now);
        // Streak was reset; never reached three in a row.
        assert_eq!(controller.current_rate("ch-1"), 100);
    }

    #[test]
    fn test_rate_floor_and_ceiling() {
        let controller = controller();
        let now = Utc::now();
        controller.touch_channel(&test_channel(12), now);

        for _ in 0..10 {
            for _ in 0..3 {
                controller.record_rejection("ch-1", ErrorCategory::RateLimited, now);
            }
        }
        assert_eq!(controller.current_rate("ch-1"), 10);

        let controller = self::controller();
        controller.touch_channel(&test_channel(995), now);
        for _ in 0..200 {
            controller.record_success("ch-1", now);
        }
        assert_eq!(controller.current_rate("ch-1"), 1000);
    }

    #[test]
    fn test_windows_prune_old_outcomes() {
        let controller = controller();
        let start = Utc::now();
        controller.touch_channel(&test_channel(100), start);

        controller.record_rejection("ch-1", ErrorCategory::Transient, start);
        for _ in 0..9 {
            controller.record_success("ch-1", start);
        }
        // Error rate 10%: stuck.
        assert_eq!(controller.current_rate("ch-1"), 100);

        // Six minutes later the old error has aged out of the window.
        let later = start + Duration::minutes(6);
        for _ in 0..10 {
            controller.record_success("ch-1", later);
        }
        assert_eq!(controller.current_rate("ch-1"), 110);
    }

    #[test]
    fn test_abuse_penalty_halves_rate() {
        let controller = controller();
        let now = Utc::now();
        controller.touch_channel(&test_channel(100), now);

        controller.apply_abuse_penalty("ch-1", now);
        assert_eq!(controller.current_rate("ch-1"), 50);

        controller.apply_abuse_penalty("ch-1", now);
        controller.apply_abuse_penalty("ch-1", now);
        controller.apply_abuse_penalty("ch-1", now);
        assert_eq!(controller.current_rate("ch-1"), 10);
    }

    #[test]
    fn test_daily_reset_reseeds_at_ninety_percent() {
        let controller = controller();
        let day_one = Utc::now();
        let channel = test_channel(100);
        controller.touch_channel(&channel, day_one);

        // Grow to a higher stable rate during the day.
        for _ in 0..20 {
            controller.record_success("ch-1", day_one);
        }
        let grown = controller.current_rate("ch-1");
        assert!(grown > 100);

        // Same day, next job: rate carries forward.
        controller.touch_channel(&channel, day_one + Duration::hours(1));
        assert_eq!(controller.current_rate("ch-1"), grown);

        // New day: reseed at 90% of the stable rate.
        controller.touch_channel(&channel, day_one + Duration::days(1));
        let expected = (controller.last_stable_rate("ch-1") as f64 * 0.9) as i64;
        assert_eq!(controller.current_rate("ch-1"), expected);
    }

    #[tokio::test]
    async fn test_checkpoint_persists_dirty_channels() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        db.call(|conn| {
            queries::insert_channel(
                conn,
                &NewChannel {
                    id: "ch-1".to_string(),
                    label: "test".to_string(),
                    current_rate: 100,
                },
            )
        })
        .await
        .unwrap();

        let controller = controller();
        let now = Utc::now();
        let channel = db
            .call(|conn| queries::get_channel(conn, "ch-1"))
            .await
            .unwrap()
            .unwrap();
        controller.touch_channel(&channel, now);

        for _ in 0..3 {
            controller.record_rejection("ch-1", ErrorCategory::RateLimited, now);
        }
        assert_eq!(controller.current_rate("ch-1"), 80);

        controller.checkpoint(&db, now, false).await.unwrap();

        let persisted = db
            .call(|conn| queries::get_channel(conn, "ch-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.current_rate, 80);
        assert_eq!(persisted.last_stable_rate, 100);
    }

    #[tokio::test]
    async fn test_checkpoint_retries_after_write_failure() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        db.call(|conn| {
            queries::insert_channel(
                conn,
                &NewChannel {
                    id: "ch-1".to_string(),
                    label: "test".to_string(),
                    current_rate: 100,
                },
            )
        })
        .await
        .unwrap();

        let controller = controller();
        let now = Utc::now();
        let channel = db
            .call(|conn| queries::get_channel(conn, "ch-1"))
            .await
            .unwrap()
            .unwrap();
        controller.touch_channel(&channel, now);
        controller.apply_abuse_penalty("ch-1", now);
        assert_eq!(controller.current_rate("ch-1"), 50);

        // Second registry for the retry; the first is about to go away.
        let good = AsyncDatabase::open_in_memory().await.unwrap();
        good.call(|conn| {
            queries::insert_channel(
                conn,
                &NewChannel {
                    id: "ch-1".to_string(),
                    label: "test".to_string(),
                    current_rate: 100,
                },
            )
        })
        .await
        .unwrap();
        db.clone().close().await.unwrap();

        // The failed flush must not swallow the change: the channel
        // stays dirty and the next non-forced checkpoint writes it.
        // (Same `now`, so the flush interval has not elapsed either.)
        assert!(controller.checkpoint(&db, now, false).await.is_err());
        controller.checkpoint(&good, now, false).await.unwrap();

        let persisted = good
            .call(|conn| queries::get_channel(conn, "ch-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.current_rate, 50);
    }
}
