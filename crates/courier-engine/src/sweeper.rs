//! Periodic recovery tasks.
//!
//! Two maintenance jobs run on one timer: resetting entries that have
//! sat in flight past the timeout (a crashed or wedged dispatch cycle
//! never committed them) and resuming jobs whose first-breach abuse
//! cooldown has elapsed.

use crate::{EngineConfig, EngineResult};
use courier_database::{queries, AsyncDatabase};
use courier_gateway::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub struct RecoverySweeper {
    db: AsyncDatabase,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl RecoverySweeper {
    pub fn new(db: AsyncDatabase, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self { db, clock, config }
    }

    /// Reset entries stuck in flight past the timeout. Entries whose
    /// send was confirmed are never touched; they are finished work.
    pub async fn sweep_stuck(&self) -> EngineResult<usize> {
        let now = self.clock.now();
        let timeout = chrono::Duration::seconds(self.config.stuck_timeout_secs);
        let count = self
            .db
            .call(move |conn| queries::reset_stuck(conn, timeout, now))
            .await?;
        if count > 0 {
            info!(count, "Reset stuck in-flight entries");
        }
        Ok(count)
    }

    /// Resume jobs whose abuse cooldown elapsed (first breach only).
    pub async fn sweep_abuse_resumes(&self) -> EngineResult<Vec<String>> {
        let now = self.clock.now();
        let resumed = self
            .db
            .call(move |conn| queries::resume_abuse_paused(conn, now))
            .await?;
        for job_id in &resumed {
            info!(job_id = %job_id, "Abuse cooldown elapsed; job resumed");
        }
        Ok(resumed)
    }

    /// Run both sweeps on the configured interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Recovery sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_stuck().await {
                        error!(error = %e, "Stuck entry sweep failed");
                    }
                    if let Err(e) = self.sweep_abuse_resumes().await {
                        error!(error = %e, "Abuse resume sweep failed");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Recovery sweeper stopped");
    }
}
