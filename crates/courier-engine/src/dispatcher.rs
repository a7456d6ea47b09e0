//! Batch dispatch for one job.
//!
//! A dispatch cycle claims a bounded batch for the job's current
//! template group, tops it up with stragglers from groups already left
//! behind, fans the batch out to the gateway at the channel's permitted
//! rate, and commits every outcome back to the queue store. Abuse
//! signals feed the circuit breaker; an auth failure deactivates the
//! whole channel.

use crate::{AbuseBreaker, EngineConfig, EngineError, EngineResult};
use courier_database::{queries, AsyncDatabase, Channel, ClaimScope, Entry, Job, PauseReason};
use courier_gateway::{
    Alert, Clock, ErrorCategory, Notifier, OutboundMessage, RetryDecision, RetryPolicy,
    SendGateway, SendOutcome,
};
use courier_rate::RateController;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

/// What happened to one dispatch cycle, for the coordinator's pacing
/// and pause handling.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Entries that already held a provider id and were confirmed
    /// without a send.
    pub skipped: usize,
    /// The abuse breaker tripped and the job was paused.
    pub abuse_paused: bool,
    /// The channel is (or became) unusable; dispatch must stop.
    pub auth_halted: bool,
}

/// Outcome of one entry within a cycle.
enum Disposition {
    Sent,
    Skipped,
    Retried(ErrorCategory),
    Failed(ErrorCategory),
    AuthHalted,
}

/// Claims, sends, and commits batches for jobs.
pub struct Dispatcher {
    db: AsyncDatabase,
    gateway: Arc<dyn SendGateway>,
    rates: Arc<RateController>,
    breaker: Arc<AbuseBreaker>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(
        db: AsyncDatabase,
        gateway: Arc<dyn SendGateway>,
        rates: Arc<RateController>,
        breaker: Arc<AbuseBreaker>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.max_attempts,
        };
        Self {
            db,
            gateway,
            rates,
            breaker,
            notifier,
            clock,
            retry,
            config,
        }
    }

    /// Run one dispatch cycle for a job.
    ///
    /// Returns without claiming when the channel is inactive. Entry
    /// outcomes are committed individually as the fan-out completes, so
    /// a crash mid-cycle loses at most the in-flight attempts, which
    /// the recovery sweeper later resets.
    pub async fn run_cycle(&self, job: &Job) -> EngineResult<CycleReport> {
        let mut report = CycleReport::default();

        let channel_id = job.channel_id.clone();
        let channel = self
            .db
            .call(move |conn| queries::get_channel(conn, &channel_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Channel {} not found", job.channel_id)))?;

        if !channel.active {
            debug!(channel_id = %channel.id, job_id = %job.id, "Channel inactive; dispatch halted");
            report.auth_halted = true;
            return Ok(report);
        }

        let batch = self.claim(job).await?;
        report.claimed = batch.len();
        if batch.is_empty() {
            return Ok(report);
        }

        // Space the start times so the aggregate send rate stays at the
        // channel's permitted rate; the semaphore bounds concurrency on
        // top of that for slow provider responses.
        let rate = self.rates.current_rate(&channel.id).max(1);
        let pacing = Duration::from_secs_f64(1.0 / rate as f64);
        let semaphore = Arc::new(Semaphore::new(
            self.config.max_concurrency.min(rate as usize).max(1),
        ));

        let mut handles = Vec::with_capacity(batch.len());
        for (i, entry) in batch.into_iter().enumerate() {
            let db = self.db.clone();
            let gateway = Arc::clone(&self.gateway);
            let rates = Arc::clone(&self.rates);
            let clock = Arc::clone(&self.clock);
            let semaphore = Arc::clone(&semaphore);
            let channel_id = channel.id.clone();
            let retry = self.retry;
            let delay = pacing * i as u32;

            handles.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        // The semaphore lives only for this cycle and is
                        // never closed; if that ever changes, leave the
                        // entry in flight for the recovery sweeper.
                        warn!(entry_id = %entry.id, "Dispatch semaphore closed; entry left for recovery");
                        return Ok(Disposition::Skipped);
                    }
                };
                dispatch_one(db, gateway, rates, clock, retry, channel_id, entry).await
            }));
        }

        let mut abuse_signals = 0usize;
        for handle in handles {
            match handle.await? {
                Ok(Disposition::Sent) => report.sent += 1,
                Ok(Disposition::Skipped) => report.skipped += 1,
                Ok(Disposition::Retried(category)) => {
                    report.retried += 1;
                    if category == ErrorCategory::AbuseSignal {
                        abuse_signals += 1;
                    }
                }
                Ok(Disposition::Failed(category)) => {
                    report.failed += 1;
                    if category == ErrorCategory::AbuseSignal {
                        abuse_signals += 1;
                    }
                }
                Ok(Disposition::AuthHalted) => report.auth_halted = true,
                Err(e) => error!(job_id = %job.id, error = %e, "Dispatch task failed"),
            }
        }

        if report.auth_halted {
            let channel_id = channel.id.clone();
            self.db
                .call(move |conn| queries::set_channel_active(conn, &channel_id, false))
                .await?;
            error!(channel_id = %channel.id, "Channel credentials expired; channel deactivated");
            self.notifier
                .notify(Alert::ChannelAuthExpired {
                    channel_id: channel.id.clone(),
                })
                .await;
        }

        let mut breached = false;
        for _ in 0..abuse_signals {
            if self.breaker.record(&job.id, self.clock.now()) {
                breached = true;
            }
        }
        if breached {
            self.escalate_abuse(job, &channel).await?;
            report.abuse_paused = true;
        }

        if let Err(e) = self.rates.checkpoint(&self.db, self.clock.now(), false).await {
            warn!(channel_id = %channel.id, error = %e, "Rate checkpoint failed");
        }

        debug!(
            job_id = %job.id,
            claimed = report.claimed,
            sent = report.sent,
            retried = report.retried,
            failed = report.failed,
            "Dispatch cycle finished"
        );
        Ok(report)
    }

    /// Claim the cycle's batch: current group first, then stragglers
    /// from earlier groups up to the backfill cap.
    async fn claim(&self, job: &Job) -> EngineResult<Vec<Entry>> {
        let now = self.clock.now();
        let mut batch = Vec::new();

        if let Some(group) = job.current_group() {
            let job_id = job.id.clone();
            let group = group.to_string();
            let limit = self.config.batch_size;
            let mut claimed = self
                .db
                .call(move |conn| {
                    queries::claim_batch(conn, &job_id, ClaimScope::Group(&group), limit, now)
                })
                .await?;
            batch.append(&mut claimed);
        }

        let earlier: Vec<String> = job.earlier_groups().to_vec();
        if batch.len() < self.config.batch_size && !earlier.is_empty() {
            let job_id = job.id.clone();
            let limit = self
                .config
                .straggler_batch_limit
                .min(self.config.batch_size - batch.len());
            let mut claimed = self
                .db
                .call(move |conn| {
                    queries::claim_batch(
                        conn,
                        &job_id,
                        ClaimScope::EarlierGroups(&earlier),
                        limit,
                        now,
                    )
                })
                .await?;
            batch.append(&mut claimed);
        }

        Ok(batch)
    }

    /// Pause the job after an abuse breach: cooldown pause with a rate
    /// penalty on the first breach, permanent pause on any later one.
    async fn escalate_abuse(&self, job: &Job, channel: &Channel) -> EngineResult<()> {
        let job_id = job.id.clone();
        let fresh = self
            .db
            .call(move |conn| queries::get_job(conn, &job_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Job {} not found", job.id)))?;

        let now = self.clock.now();
        if fresh.abuse_pause_count == 0 {
            let resume_at = now + chrono::Duration::seconds(self.config.abuse_cooldown_secs);
            let job_id = job.id.clone();
            self.db
                .call(move |conn| {
                    queries::mark_abuse_paused(
                        conn,
                        &job_id,
                        PauseReason::AbuseCooldown,
                        Some(resume_at),
                    )
                })
                .await?;
            self.rates.apply_abuse_penalty(&channel.id, now);
            warn!(job_id = %job.id, resume_at = %resume_at, "Abuse breaker tripped; job paused for cooldown");
            self.notifier
                .notify(Alert::AbusePause {
                    job_id: job.id.clone(),
                    resume_at,
                })
                .await;
        } else {
            let job_id = job.id.clone();
            self.db
                .call(move |conn| {
                    queries::mark_abuse_paused(conn, &job_id, PauseReason::AbuseManualResume, None)
                })
                .await?;
            warn!(job_id = %job.id, "Abuse breaker tripped again; job paused permanently");
            self.notifier
                .notify(Alert::AbusePermanentPause {
                    job_id: job.id.clone(),
                })
                .await;
        }
        Ok(())
    }
}

/// Send one entry and commit its outcome.
async fn dispatch_one(
    db: AsyncDatabase,
    gateway: Arc<dyn SendGateway>,
    rates: Arc<RateController>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    channel_id: String,
    entry: Entry,
) -> EngineResult<Disposition> {
    // A re-claimed entry that already holds a provider id was delivered
    // on an earlier attempt; confirm it instead of sending a duplicate.
    if let Some(external_id) = entry.external_message_id.clone() {
        let entry_id = entry.id.clone();
        db.call(move |conn| queries::commit_success(conn, &entry_id, &external_id))
            .await?;
        return Ok(Disposition::Skipped);
    }

    let outcome = match gateway
        .send(OutboundMessage {
            entry_id: &entry.id,
            channel_id: &channel_id,
            recipient: &entry.recipient,
            payload: &entry.payload,
        })
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(entry_id = %entry.id, error = %e, "Gateway call failed");
            SendOutcome::rejected(ErrorCategory::Transient, "gateway_error")
        }
    };

    let now = clock.now();
    match outcome {
        SendOutcome::Delivered {
            external_message_id,
        } => {
            rates.record_success(&channel_id, now);
            let entry_id = entry.id.clone();
            db.call(move |conn| queries::commit_success(conn, &entry_id, &external_message_id))
                .await?;
            Ok(Disposition::Sent)
        }
        SendOutcome::Rejected { category, code, .. } => {
            rates.record_rejection(&channel_id, category, now);
            let error_code = format!("{}:{}", category.as_str(), code);
            let entry_id = entry.id.clone();

            if category == ErrorCategory::AuthExpired {
                // Channel-level condition; the entry keeps its retry
                // budget and goes back to the queue untouched.
                db.call(move |conn| queries::requeue_entry(conn, &entry_id))
                    .await?;
                return Ok(Disposition::AuthHalted);
            }

            match retry.decide(category, entry.retry_count) {
                RetryDecision::Retry(delay) => {
                    let next = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    db.call(move |conn| queries::commit_retry(conn, &entry_id, &error_code, next))
                        .await?;
                    Ok(Disposition::Retried(category))
                }
                RetryDecision::Fail => {
                    db.call(move |conn| queries::commit_failure(conn, &entry_id, &error_code))
                        .await?;
                    Ok(Disposition::Failed(category))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, Harness};
    use chrono::Duration as ChronoDuration;
    use courier_database::{EntryStatus, JobStatus, NewChannel};

    fn abuse_config() -> EngineConfig {
        EngineConfig {
            abuse_threshold: 3,
            ..EngineConfig::default()
        }
    }

    async fn entry_status(h: &Harness, entry_id: &str) -> (EntryStatus, i64, Option<String>) {
        let entry_id = entry_id.to_string();
        let entry = h
            .db
            .call(move |conn| queries::get_entry(conn, &entry_id))
            .await
            .unwrap()
            .unwrap();
        (entry.status, entry.retry_count, entry.external_message_id)
    }

    #[tokio::test]
    async fn test_cycle_sends_whole_batch() {
        let h = harness(EngineConfig::default()).await;
        let job = h.seed("job-1", &["g0"], 3).await;

        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.sent, 3);
        assert_eq!(report.failed, 0);

        let (status, _, external_id) = entry_status(&h, "e-g0-0").await;
        assert_eq!(status, EntryStatus::Sent);
        assert_eq!(external_id.as_deref(), Some("ext-e-g0-0"));

        let counters = h.counters("job-1").await;
        assert_eq!(counters.sent, 3);
        assert_eq!(counters.pending, 0);
    }

    #[tokio::test]
    async fn test_transient_rejections_retry_then_fail() {
        let h = harness(EngineConfig::default()).await;
        let job = h.seed("job-1", &["g0"], 1).await;
        h.gateway.script(
            "e-g0-0",
            vec![
                SendOutcome::rejected(ErrorCategory::Transient, "503"),
                SendOutcome::rejected(ErrorCategory::Transient, "503"),
                SendOutcome::rejected(ErrorCategory::Transient, "503"),
            ],
        );

        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert_eq!(report.retried, 1);
        let (status, retries, _) = entry_status(&h, "e-g0-0").await;
        assert_eq!(status, EntryStatus::Ready);
        assert_eq!(retries, 1);

        // Backoff not yet elapsed: nothing claimable.
        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert_eq!(report.claimed, 0);

        h.clock.advance(ChronoDuration::seconds(5));
        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert_eq!(report.retried, 1);

        // Third attempt exhausts the budget.
        h.clock.advance(ChronoDuration::seconds(10));
        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert_eq!(report.failed, 1);
        let (status, retries, _) = entry_status(&h, "e-g0-0").await;
        assert_eq!(status, EntryStatus::Failed);
        assert_eq!(retries, 2);
        assert_eq!(h.counters("job-1").await.failed, 1);
    }

    #[tokio::test]
    async fn test_confirmed_entry_is_not_sent_again() {
        let h = harness(EngineConfig::default()).await;
        let job = h.seed("job-1", &["g0"], 1).await;

        // Simulate a crash between provider confirmation and commit: the
        // provider id landed but the entry went back to ready.
        h.db
            .call(|conn| {
                conn.execute(
                    "UPDATE entries SET external_message_id = 'ext-prior' WHERE id = 'e-g0-0'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.sent, 0);
        assert_eq!(h.gateway.total_calls(), 0);

        let (status, _, external_id) = entry_status(&h, "e-g0-0").await;
        assert_eq!(status, EntryStatus::Sent);
        assert_eq!(external_id.as_deref(), Some("ext-prior"));
    }

    #[tokio::test]
    async fn test_cycle_paces_sends_to_channel_rate() {
        let h = harness(EngineConfig::default()).await;
        // Pre-register the channel with a slow rate before the seed's
        // fast default kicks in.
        h.db.call(|conn| {
            queries::insert_channel(
                conn,
                &NewChannel {
                    id: "ch-1".to_string(),
                    label: "slow channel".to_string(),
                    current_rate: 10,
                },
            )
        })
        .await
        .unwrap();
        let job = h.seed("job-1", &["g0"], 13).await;

        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert_eq!(report.sent, 13);

        // At 10/sec, sends a full rate apart must span close to a
        // second, so no rolling one-second window holds more than the
        // permitted rate.
        let mut times = h.gateway.call_times();
        times.sort();
        for (early, late) in times.iter().zip(times.iter().skip(10)) {
            let gap = late.duration_since(*early);
            assert!(
                gap >= Duration::from_millis(900),
                "sends bunched: {} apart in ms",
                gap.as_millis()
            );
        }
    }

    #[tokio::test]
    async fn test_straggler_backfill_from_earlier_group() {
        let h = harness(EngineConfig::default()).await;
        let mut job = h.seed("job-1", &["g0", "g1"], 2).await;

        // Group g0 was left behind with its entries still queued.
        h.db
            .call(|conn| queries::advance_group_index(conn, "job-1", 1))
            .await
            .unwrap();
        job.current_group_index = 1;

        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert_eq!(report.claimed, 4);
        assert_eq!(report.sent, 4);

        let (status, _, _) = entry_status(&h, "e-g0-0").await;
        assert_eq!(status, EntryStatus::Sent);
    }

    #[tokio::test]
    async fn test_auth_expiry_deactivates_channel() {
        let h = harness(EngineConfig::default()).await;
        let job = h.seed("job-1", &["g0"], 1).await;
        h.gateway.script(
            "e-g0-0",
            vec![SendOutcome::rejected(ErrorCategory::AuthExpired, "401")],
        );

        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert!(report.auth_halted);

        // The entry is untouched; the channel is out of service.
        let (status, retries, _) = entry_status(&h, "e-g0-0").await;
        assert_eq!(status, EntryStatus::Ready);
        assert_eq!(retries, 0);

        let channel = h
            .db
            .call(|conn| queries::get_channel(conn, "ch-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(!channel.active);
        assert!(h
            .notifier
            .alerts()
            .iter()
            .any(|a| matches!(a, Alert::ChannelAuthExpired { channel_id } if channel_id == "ch-1")));

        // Further cycles halt before claiming anything.
        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert!(report.auth_halted);
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn test_abuse_breach_pauses_with_cooldown_and_penalty() {
        let h = harness(abuse_config()).await;
        let job = h.seed("job-1", &["g0"], 4).await;
        for id in ["e-g0-0", "e-g0-1", "e-g0-2"] {
            h.gateway.script(
                id,
                vec![SendOutcome::rejected(ErrorCategory::AbuseSignal, "burst")],
            );
        }

        let rate_before = h.rates.current_rate("ch-1");
        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert!(report.abuse_paused);

        let paused = h.job("job-1").await;
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.abuse_pause_count, 1);
        let resume_at = paused.abuse_paused_until.unwrap();
        assert_eq!(
            resume_at,
            h.clock.now() + ChronoDuration::seconds(abuse_config().abuse_cooldown_secs)
        );

        assert_eq!(h.rates.current_rate("ch-1"), rate_before / 2);
        assert!(h
            .notifier
            .alerts()
            .iter()
            .any(|a| matches!(a, Alert::AbusePause { job_id, .. } if job_id == "job-1")));
    }

    #[tokio::test]
    async fn test_second_abuse_breach_is_permanent() {
        let h = harness(abuse_config()).await;
        let job = h.seed("job-1", &["g0"], 3).await;
        for id in ["e-g0-0", "e-g0-1", "e-g0-2"] {
            h.gateway.script(
                id,
                vec![SendOutcome::rejected(ErrorCategory::AbuseSignal, "burst")],
            );
        }

        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert!(report.abuse_paused);

        // Cooldown elapses and the job auto-resumes.
        h.clock.advance(ChronoDuration::seconds(
            abuse_config().abuse_cooldown_secs + 60,
        ));
        let now = h.clock.now();
        let resumed = h
            .db
            .call(move |conn| queries::resume_abuse_paused(conn, now))
            .await
            .unwrap();
        assert_eq!(resumed, vec!["job-1".to_string()]);

        // The provider flags the same pattern again.
        for id in ["e-g0-0", "e-g0-1", "e-g0-2"] {
            h.gateway.script(
                id,
                vec![SendOutcome::rejected(ErrorCategory::AbuseSignal, "burst")],
            );
        }
        let report = h.dispatcher.run_cycle(&job).await.unwrap();
        assert!(report.abuse_paused);

        let paused = h.job("job-1").await;
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.abuse_pause_count, 2);
        assert!(paused.abuse_paused_until.is_none());
        assert!(h
            .notifier
            .alerts()
            .iter()
            .any(|a| matches!(a, Alert::AbusePermanentPause { job_id } if job_id == "job-1")));
    }
}
