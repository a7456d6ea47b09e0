//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter so it can
//! run inside [`crate::AsyncDatabase::call`] or directly in tests.
//!
//! # Claim contract
//!
//! [`claim_batch`] is the atomic claim primitive the whole engine relies
//! on: it transitions a bounded set of ready entries to in-flight inside
//! a single `BEGIN IMMEDIATE` transaction. Because all writes are
//! serialized by SQLite's write lock (and, in-process, by the dedicated
//! executor thread), two concurrent claimers can never receive the same
//! entry. Any alternative storage backend must honor the same contract,
//! e.g. `FOR UPDATE SKIP LOCKED` on Postgres.

use crate::{
    Channel, ClaimScope, DatabaseError, DatabaseResult, Entry, EntryStatus, GroupProgress, Job,
    JobCounters, JobStatus, NewChannel, NewEntry, NewJob, PauseReason,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::debug;

/// Begin a write transaction that takes the write lock at BEGIN.
///
/// A deferred transaction upgrades from read to write at its first
/// UPDATE; when another process (the CLI writes to the same WAL file)
/// committed in between, that upgrade fails with `SQLITE_BUSY_SNAPSHOT`
/// and the busy handler never retries it. Immediate mode serializes
/// writers up front, where the busy timeout applies.
fn write_tx(conn: &Connection) -> DatabaseResult<Transaction<'_>> {
    Ok(Transaction::new_unchecked(
        conn,
        TransactionBehavior::Immediate,
    )?)
}

// ==========================================
// Channels
// ==========================================

/// Register a new channel.
pub fn insert_channel(conn: &Connection, channel: &NewChannel) -> DatabaseResult<Channel> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO channels (id, label, current_rate, last_stable_rate, active, rate_updated_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3, 1, ?4, ?4, ?4)",
        params![channel.id, channel.label, channel.current_rate, now],
    )?;
    get_channel(conn, &channel.id)?
        .ok_or_else(|| DatabaseError::NotFound("Channel not found after insert".to_string()))
}

/// Get a channel by ID.
pub fn get_channel(conn: &Connection, id: &str) -> DatabaseResult<Option<Channel>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, label, current_rate, last_stable_rate, active, rate_updated_at, created_at, updated_at
         FROM channels WHERE id = ?1",
    )?;

    let result = stmt.query_row(params![id], map_channel_row);

    match result {
        Ok(channel) => Ok(Some(channel)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List all channels.
pub fn list_channels(conn: &Connection) -> DatabaseResult<Vec<Channel>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, label, current_rate, last_stable_rate, active, rate_updated_at, created_at, updated_at
         FROM channels ORDER BY created_at",
    )?;

    let channels = stmt
        .query_map([], map_channel_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(channels)
}

/// Persist the rate controller's checkpoint for a channel.
pub fn update_channel_rates(
    conn: &Connection,
    id: &str,
    current_rate: i64,
    last_stable_rate: i64,
) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    let count = conn.execute(
        "UPDATE channels
         SET current_rate = ?2, last_stable_rate = ?3, rate_updated_at = ?4, updated_at = ?4
         WHERE id = ?1",
        params![id, current_rate, last_stable_rate, now],
    )?;
    if count == 0 {
        return Err(DatabaseError::NotFound(format!("Channel {} not found", id)));
    }
    debug!(channel_id = %id, current_rate, last_stable_rate, "Channel rates persisted");
    Ok(())
}

/// Activate or deactivate a channel.
pub fn set_channel_active(conn: &Connection, id: &str, active: bool) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    let count = conn.execute(
        "UPDATE channels SET active = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, active, now],
    )?;
    if count == 0 {
        return Err(DatabaseError::NotFound(format!("Channel {} not found", id)));
    }
    Ok(())
}

fn map_channel_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        label: row.get(1)?,
        current_rate: row.get(2)?,
        last_stable_rate: row.get(3)?,
        active: row.get(4)?,
        rate_updated_at: parse_datetime(row.get::<_, String>(5)?),
        created_at: parse_datetime(row.get::<_, String>(6)?),
        updated_at: parse_datetime(row.get::<_, String>(7)?),
    })
}

// ==========================================
// Jobs
// ==========================================

/// Insert a job together with its full set of entries.
///
/// Entries land as `pending`; [`release_entries`] makes them claimable
/// when dispatch starts. Runs in one transaction so a job is never
/// visible without its entries.
pub fn insert_job(conn: &Connection, job: &NewJob, entries: &[NewEntry]) -> DatabaseResult<Job> {
    let now = Utc::now().to_rfc3339();
    let groups_json = serde_json::to_string(&job.template_groups)?;

    let tx = write_tx(conn)?;
    tx.execute(
        "INSERT INTO jobs (id, channel_id, template_groups, current_group_index, status, abuse_pause_count, queued_count, sent_count, failed_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0, 'scheduled', 0, ?4, 0, 0, ?5, ?5)",
        params![job.id, job.channel_id, groups_json, entries.len() as i64, now],
    )?;

    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO entries (id, job_id, group_id, recipient, payload, status, retry_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
        )?;
        for entry in entries {
            let payload = serde_json::to_string(&entry.payload)?;
            stmt.execute(params![
                entry.id,
                job.id,
                entry.group_id,
                entry.recipient,
                payload,
                now,
            ])?;
        }
    }
    tx.commit()?;

    get_job(conn, &job.id)?
        .ok_or_else(|| DatabaseError::NotFound("Job not found after insert".to_string()))
}

/// Get a job by ID.
pub fn get_job(conn: &Connection, id: &str) -> DatabaseResult<Option<Job>> {
    let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", JOB_SELECT))?;

    let result = stmt.query_row(params![id], map_job_row);

    match result {
        Ok(job) => Ok(Some(job)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List jobs with the given status, oldest first.
pub fn list_jobs_by_status(conn: &Connection, status: JobStatus) -> DatabaseResult<Vec<Job>> {
    let mut stmt = conn.prepare_cached(&format!(
        "{} WHERE status = ?1 ORDER BY created_at",
        JOB_SELECT
    ))?;

    let jobs = stmt
        .query_map(params![status.as_str()], map_job_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(jobs)
}

/// Next job eligible to run on a channel, oldest submission first.
///
/// Jobs on a channel run strictly sequentially; a running job keeps
/// priority over a scheduled one.
pub fn next_job_for_channel(conn: &Connection, channel_id: &str) -> DatabaseResult<Option<Job>> {
    let mut stmt = conn.prepare_cached(&format!(
        "{} WHERE channel_id = ?1 AND status IN ('running', 'scheduled')
         ORDER BY CASE status WHEN 'running' THEN 0 ELSE 1 END, created_at
         LIMIT 1",
        JOB_SELECT
    ))?;

    let result = stmt.query_row(params![channel_id], map_job_row);

    match result {
        Ok(job) => Ok(Some(job)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Transition a job's status.
///
/// Sets `started_at` on the first move to running and `completed_at`
/// on a terminal transition. Clears pause bookkeeping when resuming.
pub fn update_job_status(conn: &Connection, id: &str, status: JobStatus) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    let count = match status {
        JobStatus::Running => conn.execute(
            "UPDATE jobs
             SET status = 'running', pause_reason = NULL, abuse_paused_until = NULL,
                 started_at = COALESCE(started_at, ?2), updated_at = ?2
             WHERE id = ?1",
            params![id, now],
        )?,
        JobStatus::Completed | JobStatus::Failed => conn.execute(
            "UPDATE jobs SET status = ?2, completed_at = ?3, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now],
        )?,
        _ => conn.execute(
            "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now],
        )?,
    };
    if count == 0 {
        return Err(DatabaseError::NotFound(format!("Job {} not found", id)));
    }
    Ok(())
}

/// Pause a job with a reason (no auto-resume scheduling).
pub fn pause_job(conn: &Connection, id: &str, reason: PauseReason) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    let count = conn.execute(
        "UPDATE jobs SET status = 'paused', pause_reason = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, reason.as_str(), now],
    )?;
    if count == 0 {
        return Err(DatabaseError::NotFound(format!("Job {} not found", id)));
    }
    Ok(())
}

/// Pause a job for an abuse breach and record the escalation state.
///
/// `paused_until` is `None` for a permanent (manual-resume) pause.
pub fn mark_abuse_paused(
    conn: &Connection,
    id: &str,
    reason: PauseReason,
    paused_until: Option<DateTime<Utc>>,
) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    let count = conn.execute(
        "UPDATE jobs
         SET status = 'paused', pause_reason = ?2, abuse_paused_until = ?3,
             abuse_pause_count = abuse_pause_count + 1, updated_at = ?4
         WHERE id = ?1",
        params![
            id,
            reason.as_str(),
            paused_until.map(|t| t.to_rfc3339()),
            now,
        ],
    )?;
    if count == 0 {
        return Err(DatabaseError::NotFound(format!("Job {} not found", id)));
    }
    Ok(())
}

/// Resume jobs whose first-occurrence abuse cooldown has elapsed.
///
/// Returns the ids of the jobs transitioned back to running. Jobs on
/// their second breach (`abuse_pause_count > 1`) are never touched.
pub fn resume_abuse_paused(conn: &Connection, now: DateTime<Utc>) -> DatabaseResult<Vec<String>> {
    let now_str = now.to_rfc3339();

    let ids: Vec<String> = {
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM jobs
             WHERE status = 'paused' AND abuse_pause_count = 1
               AND abuse_paused_until IS NOT NULL AND abuse_paused_until <= ?1",
        )?;
        let ids = stmt
            .query_map(params![now_str], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    for id in &ids {
        conn.execute(
            "UPDATE jobs
             SET status = 'running', pause_reason = NULL, abuse_paused_until = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, now_str],
        )?;
    }

    Ok(ids)
}

/// Advance the job's current group index, monotonically.
///
/// The guard in SQL makes a rewind impossible even if two coordinators
/// race: the update only applies when the stored index is smaller.
pub fn advance_group_index(conn: &Connection, id: &str, to_index: i64) -> DatabaseResult<bool> {
    let now = Utc::now().to_rfc3339();
    let count = conn.execute(
        "UPDATE jobs SET current_group_index = ?2, updated_at = ?3
         WHERE id = ?1 AND current_group_index < ?2",
        params![id, to_index, now],
    )?;
    Ok(count > 0)
}

/// Read-only counter projection for a job.
pub fn job_counters(conn: &Connection, job_id: &str) -> DatabaseResult<JobCounters> {
    let (queued, sent, failed): (i64, i64, i64) = conn.query_row(
        "SELECT queued_count, sent_count, failed_count FROM jobs WHERE id = ?1",
        params![job_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    let pending = pending_count(conn, job_id)?;
    Ok(JobCounters {
        queued,
        sent,
        failed,
        pending,
    })
}

const JOB_SELECT: &str = "SELECT id, channel_id, template_groups, current_group_index, status, pause_reason, abuse_pause_count, abuse_paused_until, queued_count, sent_count, failed_count, created_at, started_at, completed_at, updated_at FROM jobs";

fn map_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let groups_json: String = row.get(2)?;
    let template_groups: Vec<String> = serde_json::from_str(&groups_json).unwrap_or_default();
    Ok(Job {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        template_groups,
        current_group_index: row.get(3)?,
        status: JobStatus::from_str(&row.get::<_, String>(4)?),
        pause_reason: row
            .get::<_, Option<String>>(5)?
            .as_deref()
            .and_then(PauseReason::from_str),
        abuse_pause_count: row.get(6)?,
        abuse_paused_until: row.get::<_, Option<String>>(7)?.map(parse_datetime),
        queued_count: row.get(8)?,
        sent_count: row.get(9)?,
        failed_count: row.get(10)?,
        created_at: parse_datetime(row.get::<_, String>(11)?),
        started_at: row.get::<_, Option<String>>(12)?.map(parse_datetime),
        completed_at: row.get::<_, Option<String>>(13)?.map(parse_datetime),
        updated_at: parse_datetime(row.get::<_, String>(14)?),
    })
}

// ==========================================
// Entries
// ==========================================

/// Release a job's pending entries for dispatch (pending -> ready).
pub fn release_entries(conn: &Connection, job_id: &str) -> DatabaseResult<usize> {
    let now = Utc::now().to_rfc3339();
    let count = conn.execute(
        "UPDATE entries SET status = 'ready', updated_at = ?2
         WHERE job_id = ?1 AND status = 'pending'",
        params![job_id, now],
    )?;
    Ok(count)
}

/// Atomically claim up to `limit` ready entries (ready -> in_flight).
///
/// Only entries whose retry backoff has elapsed are eligible. Within a
/// group, entries are claimed oldest-created-first; for
/// [`ClaimScope::EarlierGroups`] the groups are drained in job order so
/// the oldest skipped group is backfilled first.
///
/// This is the claim serialization point (see module docs): the select
/// and the status flip happen in one `BEGIN IMMEDIATE` transaction, so
/// concurrent claimers always receive disjoint sets.
pub fn claim_batch(
    conn: &Connection,
    job_id: &str,
    scope: ClaimScope<'_>,
    limit: usize,
    now: DateTime<Utc>,
) -> DatabaseResult<Vec<Entry>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let tx = write_tx(conn)?;
    let mut claimed_ids: Vec<String> = Vec::new();

    match scope {
        ClaimScope::Group(group_id) => {
            claim_from_group(&tx, job_id, group_id, limit, now, &mut claimed_ids)?;
        }
        ClaimScope::EarlierGroups(groups) => {
            for group_id in groups {
                if claimed_ids.len() >= limit {
                    break;
                }
                let remaining = limit - claimed_ids.len();
                claim_from_group(&tx, job_id, group_id, remaining, now, &mut claimed_ids)?;
            }
        }
    }
    tx.commit()?;

    if claimed_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::with_capacity(claimed_ids.len());
    for id in &claimed_ids {
        if let Some(entry) = get_entry(conn, id)? {
            entries.push(entry);
        }
    }

    debug!(job_id = %job_id, count = entries.len(), "Claimed batch");
    Ok(entries)
}

fn claim_from_group(
    conn: &Connection,
    job_id: &str,
    group_id: &str,
    limit: usize,
    now: DateTime<Utc>,
    claimed_ids: &mut Vec<String>,
) -> DatabaseResult<()> {
    let now_str = now.to_rfc3339();

    let ids: Vec<String> = {
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM entries
             WHERE job_id = ?1 AND group_id = ?2 AND status = 'ready'
               AND (next_retry_at IS NULL OR next_retry_at <= ?3)
             ORDER BY created_at
             LIMIT ?4",
        )?;
        let ids = stmt
            .query_map(params![job_id, group_id, now_str, limit as i64], |row| {
                row.get(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    let mut update = conn.prepare_cached(
        "UPDATE entries SET status = 'in_flight', updated_at = ?2 WHERE id = ?1 AND status = 'ready'",
    )?;
    for id in ids {
        if update.execute(params![id, now_str])? > 0 {
            claimed_ids.push(id);
        }
    }
    Ok(())
}

/// Get an entry by ID.
pub fn get_entry(conn: &Connection, id: &str) -> DatabaseResult<Option<Entry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, job_id, group_id, recipient, payload, status, retry_count, next_retry_at, external_message_id, last_error, created_at, updated_at
         FROM entries WHERE id = ?1",
    )?;

    let result = stmt.query_row(params![id], map_entry_row);

    match result {
        Ok(entry) => Ok(Some(entry)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Commit a confirmed delivery (in_flight -> sent).
///
/// The external message id is the idempotency anchor: the guard only
/// writes it when it is still NULL, so a duplicate commit after a
/// re-claim can never overwrite the first confirmation.
pub fn commit_success(
    conn: &Connection,
    entry_id: &str,
    external_message_id: &str,
) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();

    let tx = write_tx(conn)?;
    let count = tx.execute(
        "UPDATE entries
         SET status = 'sent', external_message_id = ?2, next_retry_at = NULL, last_error = NULL, updated_at = ?3
         WHERE id = ?1 AND external_message_id IS NULL",
        params![entry_id, external_message_id, now],
    )?;

    if count > 0 {
        tx.execute(
            "UPDATE jobs SET sent_count = sent_count + 1, updated_at = ?2
             WHERE id = (SELECT job_id FROM entries WHERE id = ?1)",
            params![entry_id, now],
        )?;
    } else {
        // Entry already confirmed earlier; make sure it is not stuck in flight.
        tx.execute(
            "UPDATE entries SET status = 'sent', updated_at = ?2
             WHERE id = ?1 AND status = 'in_flight'",
            params![entry_id, now],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Commit a retryable failure (in_flight -> ready, with backoff).
pub fn commit_retry(
    conn: &Connection,
    entry_id: &str,
    error_code: &str,
    next_retry_at: DateTime<Utc>,
) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    let count = conn.execute(
        "UPDATE entries
         SET status = 'ready', retry_count = retry_count + 1, next_retry_at = ?3, last_error = ?2, updated_at = ?4
         WHERE id = ?1 AND status = 'in_flight'",
        params![entry_id, error_code, next_retry_at.to_rfc3339(), now],
    )?;
    if count == 0 {
        return Err(DatabaseError::InvalidTransition(format!(
            "Entry {} is not in flight",
            entry_id
        )));
    }
    Ok(())
}

/// Return an in-flight entry to ready without burning a retry.
///
/// Used when dispatch halts for a channel-level condition (expired
/// credentials); the entry itself did nothing wrong, so neither the
/// retry count nor the backoff schedule moves.
pub fn requeue_entry(conn: &Connection, entry_id: &str) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE entries SET status = 'ready', updated_at = ?2
         WHERE id = ?1 AND status = 'in_flight'",
        params![entry_id, now],
    )?;
    Ok(())
}

/// Commit a permanent failure (in_flight -> failed).
pub fn commit_failure(conn: &Connection, entry_id: &str, error_code: &str) -> DatabaseResult<()> {
    let now = Utc::now().to_rfc3339();

    let tx = write_tx(conn)?;
    let count = tx.execute(
        "UPDATE entries
         SET status = 'failed', next_retry_at = NULL, last_error = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'in_flight'",
        params![entry_id, error_code, now],
    )?;
    if count > 0 {
        tx.execute(
            "UPDATE jobs SET failed_count = failed_count + 1, updated_at = ?2
             WHERE id = (SELECT job_id FROM entries WHERE id = ?1)",
            params![entry_id, now],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Count of entries still to be processed, across all groups.
///
/// Deliberately job-scoped, not group-scoped: stragglers left behind in
/// earlier groups must keep a job from completing.
pub fn pending_count(conn: &Connection, job_id: &str) -> DatabaseResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM entries
         WHERE job_id = ?1 AND status IN ('ready', 'in_flight')",
        params![job_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Progress counters for one group, used for advancement decisions.
pub fn group_progress(
    conn: &Connection,
    job_id: &str,
    group_id: &str,
) -> DatabaseResult<GroupProgress> {
    let progress = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN status IN ('sent', 'failed') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'in_flight' AND external_message_id IS NULL THEN 1 ELSE 0 END), 0)
         FROM entries WHERE job_id = ?1 AND group_id = ?2",
        params![job_id, group_id],
        |row| {
            Ok(GroupProgress {
                total: row.get(0)?,
                done: row.get(1)?,
                stuck: row.get(2)?,
            })
        },
    )?;
    Ok(progress)
}

/// Reset entries stuck in flight beyond the timeout (in_flight -> ready).
///
/// Only entries with no external message id are reset; an entry whose
/// send was confirmed is finished regardless of its timestamp. Returns
/// the number of entries reset.
pub fn reset_stuck(
    conn: &Connection,
    older_than: Duration,
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let cutoff = (now - older_than).to_rfc3339();
    let count = conn.execute(
        "UPDATE entries SET status = 'ready', updated_at = ?2
         WHERE status = 'in_flight' AND external_message_id IS NULL AND updated_at < ?1",
        params![cutoff, now.to_rfc3339()],
    )?;
    Ok(count)
}

/// Purge a terminal job's entries. The job row itself is kept for audit.
pub fn purge_entries(conn: &Connection, job_id: &str) -> DatabaseResult<usize> {
    let status: String = conn.query_row(
        "SELECT status FROM jobs WHERE id = ?1",
        params![job_id],
        |row| row.get(0),
    )?;
    if !JobStatus::from_str(&status).is_terminal() {
        return Err(DatabaseError::InvalidTransition(format!(
            "Job {} is not terminal",
            job_id
        )));
    }
    let count = conn.execute("DELETE FROM entries WHERE job_id = ?1", params![job_id])?;
    Ok(count)
}

fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let payload_json: String = row.get(4)?;
    let payload = serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null);
    Ok(Entry {
        id: row.get(0)?,
        job_id: row.get(1)?,
        group_id: row.get(2)?,
        recipient: row.get(3)?,
        payload,
        status: EntryStatus::from_str(&row.get::<_, String>(5)?),
        retry_count: row.get(6)?,
        next_retry_at: row.get::<_, Option<String>>(7)?.map(parse_datetime),
        external_message_id: row.get(8)?,
        last_error: row.get(9)?,
        created_at: parse_datetime(row.get::<_, String>(10)?),
        updated_at: parse_datetime(row.get::<_, String>(11)?),
    })
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
