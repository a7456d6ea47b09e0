//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Channel record - a logical sending identity (e.g. one sending number).
///
/// Rate fields are mutated only by the rate controller; the active flag
/// only by operator action or an auth-expired outcome. Channels are never
/// deleted while a job on them is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub label: String,
    /// Current permitted send rate in messages per second.
    pub current_rate: i64,
    /// Last rate that held without error pressure; seed for daily reset.
    pub last_stable_rate: i64,
    pub active: bool,
    pub rate_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to register a channel.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub id: String,
    pub label: String,
    pub current_rate: i64,
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Scheduled
    }
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Scheduled,
        }
    }

    /// Terminal states allow entry purging.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a job is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// First abuse breach; auto-resumes after the cooldown.
    AbuseCooldown,
    /// Second abuse breach; requires manual resume.
    AbuseManualResume,
    /// Paused by operator action.
    Operator,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AbuseCooldown => "abuse_cooldown",
            Self::AbuseManualResume => "abuse_manual_resume",
            Self::Operator => "operator",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "abuse_cooldown" => Some(Self::AbuseCooldown),
            "abuse_manual_resume" => Some(Self::AbuseManualResume),
            "operator" => Some(Self::Operator),
            _ => None,
        }
    }
}

/// Job record - one bulk-send operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub channel_id: String,
    /// Ordered template group ids; fixed at creation.
    pub template_groups: Vec<String>,
    /// Index into `template_groups`; only ever advances.
    pub current_group_index: i64,
    pub status: JobStatus,
    pub pause_reason: Option<PauseReason>,
    pub abuse_pause_count: i64,
    pub abuse_paused_until: Option<DateTime<Utc>>,
    pub queued_count: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Group id at the current index, if any group remains.
    pub fn current_group(&self) -> Option<&str> {
        self.template_groups
            .get(self.current_group_index as usize)
            .map(|s| s.as_str())
    }

    /// Group ids strictly before the current index, in job order.
    pub fn earlier_groups(&self) -> &[String] {
        let idx = (self.current_group_index as usize).min(self.template_groups.len());
        &self.template_groups[..idx]
    }
}

/// Fields required to submit a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub channel_id: String,
    pub template_groups: Vec<String>,
}

/// Entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Created but not yet released for dispatch.
    Pending,
    /// Eligible to be claimed.
    Ready,
    /// Claimed by a dispatcher; a send may be in progress.
    InFlight,
    /// Confirmed delivered to the provider.
    Sent,
    /// Terminally failed.
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InFlight => "in_flight",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ready" => Self::Ready,
            "in_flight" => Self::InFlight,
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Entry record - one logical message to send.
///
/// Once `external_message_id` is non-null the entry must never be sent
/// again; every redispatch path checks it first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub job_id: String,
    /// Template group this entry belongs to; fixed at creation.
    pub group_id: String,
    pub recipient: String,
    /// Rendered message payload, provider-shaped JSON.
    pub payload: serde_json::Value,
    pub status: EntryStatus,
    pub retry_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Provider message id, set exactly once on first confirmed success.
    pub external_message_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to enqueue an entry at job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntry {
    pub id: String,
    pub group_id: String,
    pub recipient: String,
    pub payload: serde_json::Value,
}

/// Which entries a claim targets.
#[derive(Debug, Clone)]
pub enum ClaimScope<'a> {
    /// Entries of one group.
    Group(&'a str),
    /// Straggler backfill: entries of any earlier group, claimed
    /// oldest-group-first then oldest-created-first.
    EarlierGroups(&'a [String]),
}

/// Progress counters for one group of a job.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupProgress {
    pub total: i64,
    /// Entries in a terminal state (sent or failed).
    pub done: i64,
    /// In-flight entries with no external id yet.
    pub stuck: i64,
}

impl GroupProgress {
    pub fn completed_fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        }
    }

    pub fn stuck_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.stuck as f64 / self.total as f64
        }
    }
}

/// Read-only counter projection for dashboards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobCounters {
    pub queued: i64,
    pub sent: i64,
    pub failed: i64,
    pub pending: i64,
}
