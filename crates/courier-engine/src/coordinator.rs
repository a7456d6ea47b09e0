//! Per-channel job coordination.
//!
//! One worker per channel pulls the channel's next eligible job,
//! drives dispatch cycles, advances the job through its template
//! groups, and detects completion. Jobs on a channel run strictly
//! sequentially; a new job starts only after the previous one reached
//! a terminal or paused state with nothing left to claim.

use crate::{AbuseBreaker, CycleReport, Dispatcher, EngineConfig, EngineResult};
use courier_database::{queries, AsyncDatabase, Channel, GroupProgress, Job, JobStatus};
use courier_gateway::Clock;
use courier_rate::RateController;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct JobCoordinator {
    db: AsyncDatabase,
    dispatcher: Arc<Dispatcher>,
    rates: Arc<RateController>,
    breaker: Arc<AbuseBreaker>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl JobCoordinator {
    pub fn new(
        db: AsyncDatabase,
        dispatcher: Arc<Dispatcher>,
        rates: Arc<RateController>,
        breaker: Arc<AbuseBreaker>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            dispatcher,
            rates,
            breaker,
            clock,
            config,
        }
    }

    /// Run the coordinator until shutdown: spawn a worker per channel
    /// and rescan periodically for newly registered channels.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut workers: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut rescan =
            tokio::time::interval(Duration::from_secs(self.config.channel_rescan_secs.max(1)));
        rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_rx = shutdown.clone();
        info!("Job coordinator started");

        loop {
            match self.db.call(queries::list_channels).await {
                Ok(channels) => {
                    workers.retain(|_, handle| !handle.is_finished());
                    for channel in channels {
                        if !workers.contains_key(&channel.id) {
                            let worker = Arc::clone(&self)
                                .run_channel(channel.id.clone(), shutdown.clone());
                            workers.insert(channel.id, tokio::spawn(worker));
                        }
                    }
                }
                Err(e) => error!(error = %e, "Channel scan failed"),
            }

            tokio::select! {
                _ = rescan.tick() => {}
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        for (_, handle) in workers {
            let _ = handle.await;
        }
        if let Err(e) = self.rates.checkpoint(&self.db, self.clock.now(), true).await {
            warn!(error = %e, "Final rate checkpoint failed");
        }
        info!("Job coordinator stopped");
    }

    async fn run_channel(self: Arc<Self>, channel_id: String, mut shutdown: watch::Receiver<bool>) {
        info!(channel_id = %channel_id, "Channel worker started");
        loop {
            let active = match self.step_channel(&channel_id).await {
                Ok(active) => active,
                Err(e) => {
                    error!(channel_id = %channel_id, error = %e, "Channel step failed");
                    false
                }
            };

            let delay = if active {
                Duration::from_millis(self.config.poll_active_ms)
            } else {
                Duration::from_millis(self.config.poll_idle_ms)
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(channel_id = %channel_id, "Channel worker stopped");
    }

    /// One coordination step for a channel: start or continue its next
    /// job, run a dispatch cycle, then advance groups and check
    /// completion. Returns whether the step found work, which drives
    /// the worker's poll pacing.
    pub async fn step_channel(&self, channel_id: &str) -> EngineResult<bool> {
        let id = channel_id.to_string();
        let Some(channel) = self
            .db
            .call(move |conn| queries::get_channel(conn, &id))
            .await?
        else {
            return Ok(false);
        };
        if !channel.active {
            return Ok(false);
        }

        let id = channel_id.to_string();
        let Some(mut job) = self
            .db
            .call(move |conn| queries::next_job_for_channel(conn, &id))
            .await?
        else {
            return Ok(false);
        };

        if job.status == JobStatus::Scheduled {
            job = self.start_job(&channel, job).await?;
        }

        let report: CycleReport = self.dispatcher.run_cycle(&job).await?;
        if report.abuse_paused || report.auth_halted {
            return Ok(false);
        }

        self.advance_groups(&mut job).await?;
        self.try_complete(&job).await?;
        Ok(report.claimed > 0)
    }

    /// Begin a scheduled job: release its entries for dispatch, mark it
    /// running, and seed the channel's rate state (applying the daily
    /// reset when a new calendar day started).
    async fn start_job(&self, channel: &Channel, job: Job) -> EngineResult<Job> {
        let job_id = job.id.clone();
        let started = self
            .db
            .call(move |conn| {
                let released = queries::release_entries(conn, &job_id)?;
                queries::update_job_status(conn, &job_id, JobStatus::Running)?;
                let job = queries::get_job(conn, &job_id)?.ok_or_else(|| {
                    courier_database::DatabaseError::NotFound(format!("Job {} not found", job_id))
                })?;
                Ok((job, released))
            })
            .await?;

        self.rates.touch_channel(channel, self.clock.now());
        info!(
            job_id = %started.0.id,
            channel_id = %channel.id,
            released = started.1,
            groups = started.0.template_groups.len(),
            "Job started"
        );
        Ok(started.0)
    }

    /// Move the job past every group that qualifies: either fully
    /// drained, or complete beyond the threshold with at most a
    /// tolerated sliver stuck in flight. Left-behind entries are picked
    /// up later as stragglers.
    async fn advance_groups(&self, job: &mut Job) -> EngineResult<()> {
        while let Some(group) = job.current_group() {
            let job_id = job.id.clone();
            let group = group.to_string();
            let progress = self
                .db
                .call(move |conn| queries::group_progress(conn, &job_id, &group))
                .await?;
            if !self.may_advance(&progress) {
                break;
            }

            let to_index = job.current_group_index + 1;
            let job_id = job.id.clone();
            let advanced = self
                .db
                .call(move |conn| queries::advance_group_index(conn, &job_id, to_index))
                .await?;
            if !advanced {
                break;
            }
            info!(
                job_id = %job.id,
                to_index,
                done = progress.done,
                stuck = progress.stuck,
                "Advanced to next template group"
            );
            job.current_group_index = to_index;
        }
        Ok(())
    }

    fn may_advance(&self, progress: &GroupProgress) -> bool {
        let remaining = progress.total - progress.done - progress.stuck;
        (remaining == 0 && progress.stuck == 0)
            || (progress.stuck_fraction() < self.config.advance_stuck_tolerance
                && progress.completed_fraction() > self.config.advance_complete_threshold)
    }

    /// Complete the job once nothing claimable or in flight remains in
    /// any group, then purge its entries. Stragglers in earlier groups
    /// keep the pending count above zero, so a job can never complete
    /// past them.
    async fn try_complete(&self, job: &Job) -> EngineResult<bool> {
        let job_id = job.id.clone();
        let pending = self
            .db
            .call(move |conn| queries::pending_count(conn, &job_id))
            .await?;
        if pending > 0 {
            return Ok(false);
        }

        let job_id = job.id.clone();
        let (counters, purged) = self
            .db
            .call(move |conn| {
                queries::update_job_status(conn, &job_id, JobStatus::Completed)?;
                let counters = queries::job_counters(conn, &job_id)?;
                let purged = queries::purge_entries(conn, &job_id)?;
                Ok((counters, purged))
            })
            .await?;
        self.breaker.clear(&job.id);

        info!(
            job_id = %job.id,
            sent = counters.sent,
            failed = counters.failed,
            purged,
            "Job completed"
        );
        Ok(true)
    }
}
