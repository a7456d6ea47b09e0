//! Subcommand implementations.

use crate::config::AppConfig;
use anyhow::{bail, Context, Result};
use courier_database::{
    queries, AsyncDatabase, JobStatus, NewChannel, NewEntry, NewJob, PauseReason,
};
use courier_engine::{AbuseBreaker, Dispatcher, JobCoordinator, RecoverySweeper};
use courier_gateway::{Clock, HttpGateway, LogNotifier, SystemClock};
use courier_rate::RateController;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Run the dispatch daemon until Ctrl-C.
pub async fn start(config: AppConfig) -> Result<()> {
    let db = AsyncDatabase::open(&config.database_path).await?;
    let gateway = Arc::new(HttpGateway::new(config.gateway.clone())?);
    let rates = Arc::new(RateController::new(config.rate.clone()));
    let breaker = Arc::new(AbuseBreaker::new(
        config.engine.abuse_window_secs,
        config.engine.abuse_threshold,
    ));
    let notifier = Arc::new(LogNotifier);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Warm the rate controller from the registry so every channel
    // resumes near its last achieved rate instead of cold-starting.
    let channels = db.call(queries::list_channels).await?;
    let now = clock.now();
    for channel in &channels {
        rates.touch_channel(channel, now);
    }
    info!(channels = channels.len(), "Rate state restored from registry");

    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        gateway,
        Arc::clone(&rates),
        Arc::clone(&breaker),
        notifier,
        Arc::clone(&clock),
        config.engine.clone(),
    ));
    let coordinator = Arc::new(JobCoordinator::new(
        db.clone(),
        dispatcher,
        Arc::clone(&rates),
        breaker,
        Arc::clone(&clock),
        config.engine.clone(),
    ));
    let sweeper = RecoverySweeper::new(db.clone(), clock, config.engine.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator_task = tokio::spawn(coordinator.run(shutdown_rx.clone()));
    let sweeper_task = tokio::spawn(sweeper.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown_tx.send(true).ok();

    coordinator_task.await.ok();
    sweeper_task.await.ok();
    db.close().await?;
    info!("Shutdown complete");
    Ok(())
}

/// Print channels and non-terminal jobs as JSON.
pub async fn status(config: AppConfig) -> Result<()> {
    let db = AsyncDatabase::open(&config.database_path).await?;

    let channels = db.call(queries::list_channels).await?;
    let mut jobs = Vec::new();
    for status in [JobStatus::Scheduled, JobStatus::Running, JobStatus::Paused] {
        jobs.extend(
            db.call(move |conn| queries::list_jobs_by_status(conn, status))
                .await?,
        );
    }

    let mut job_rows = Vec::new();
    for job in jobs {
        let job_id = job.id.clone();
        let counters = db
            .call(move |conn| queries::job_counters(conn, &job_id))
            .await?;
        job_rows.push(serde_json::json!({
            "id": job.id,
            "channel_id": job.channel_id,
            "status": job.status,
            "current_group": job.current_group(),
            "pause_reason": job.pause_reason,
            "queued": counters.queued,
            "sent": counters.sent,
            "failed": counters.failed,
            "pending": counters.pending,
        }));
    }

    let report = serde_json::json!({
        "channels": channels.iter().map(|c| serde_json::json!({
            "id": c.id,
            "label": c.label,
            "active": c.active,
            "current_rate": c.current_rate,
            "last_stable_rate": c.last_stable_rate,
        })).collect::<Vec<_>>(),
        "jobs": job_rows,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    db.close().await?;
    Ok(())
}

/// Register a sending channel.
pub async fn add_channel(config: AppConfig, id: String, label: String, rate: i64) -> Result<()> {
    let db = AsyncDatabase::open(&config.database_path).await?;
    let channel = db
        .call(move |conn| {
            queries::insert_channel(
                conn,
                &NewChannel {
                    id,
                    label,
                    current_rate: rate,
                },
            )
        })
        .await?;
    println!(
        "Registered channel {} at {} msg/s",
        channel.id, channel.current_rate
    );
    db.close().await?;
    Ok(())
}

/// One line of a submission file.
#[derive(Debug, Deserialize)]
struct SubmitEntry {
    group: String,
    recipient: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Submit a job from a JSON entries file.
pub async fn submit(
    config: AppConfig,
    channel_id: String,
    entries_path: &Path,
    groups: Vec<String>,
) -> Result<()> {
    let raw = std::fs::read_to_string(entries_path)
        .with_context(|| format!("reading entries file {}", entries_path.display()))?;
    let submitted: Vec<SubmitEntry> =
        serde_json::from_str(&raw).context("parsing entries file")?;
    if submitted.is_empty() {
        bail!("entries file is empty");
    }

    // Group order comes from --groups when given, otherwise from first
    // appearance in the file.
    let mut template_groups = groups;
    if template_groups.is_empty() {
        for entry in &submitted {
            if !template_groups.contains(&entry.group) {
                template_groups.push(entry.group.clone());
            }
        }
    } else {
        for entry in &submitted {
            if !template_groups.contains(&entry.group) {
                bail!("entry group {:?} is not listed in --groups", entry.group);
            }
        }
    }

    let db = AsyncDatabase::open(&config.database_path).await?;
    let lookup_id = channel_id.clone();
    db.call(move |conn| queries::get_channel(conn, &lookup_id))
        .await?
        .with_context(|| format!("unknown channel {}", channel_id))?;

    let entries: Vec<NewEntry> = submitted
        .into_iter()
        .map(|e| NewEntry {
            id: Uuid::new_v4().to_string(),
            group_id: e.group,
            recipient: e.recipient,
            payload: e.payload,
        })
        .collect();
    let new_job = NewJob {
        id: Uuid::new_v4().to_string(),
        channel_id,
        template_groups,
    };
    let job = db
        .call(move |conn| queries::insert_job(conn, &new_job, &entries))
        .await?;

    println!(
        "Submitted job {} with {} entries across {} groups",
        job.id,
        job.queued_count,
        job.template_groups.len()
    );
    db.close().await?;
    Ok(())
}

/// Pause a job on operator request.
pub async fn pause_job(config: AppConfig, job_id: String) -> Result<()> {
    let db = AsyncDatabase::open(&config.database_path).await?;
    let id = job_id.clone();
    db.call(move |conn| queries::pause_job(conn, &id, PauseReason::Operator))
        .await?;
    println!("Paused job {}", job_id);
    db.close().await?;
    Ok(())
}

/// Resume a paused job, including one paused permanently for abuse.
pub async fn resume_job(config: AppConfig, job_id: String) -> Result<()> {
    let db = AsyncDatabase::open(&config.database_path).await?;

    let id = job_id.clone();
    let job = db
        .call(move |conn| queries::get_job(conn, &id))
        .await?
        .with_context(|| format!("unknown job {}", job_id))?;
    if job.status != JobStatus::Paused {
        bail!("job {} is {}, not paused", job.id, job.status.as_str());
    }

    let id = job_id.clone();
    db.call(move |conn| queries::update_job_status(conn, &id, JobStatus::Running))
        .await?;
    println!("Resumed job {}", job_id);
    db.close().await?;
    Ok(())
}
