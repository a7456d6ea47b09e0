//! Operator notification seam.
//!
//! One-way alerts only; delivery (email, chat, paging) is a collaborator
//! concern behind the [`Notifier`] trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

/// Operator-facing alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// First abuse breach: job paused, will auto-resume.
    AbusePause {
        job_id: String,
        resume_at: DateTime<Utc>,
    },
    /// Second abuse breach: job paused permanently, manual resume required.
    AbusePermanentPause { job_id: String },
    /// Channel credentials expired; dispatch on the channel is halted.
    ChannelAuthExpired { channel_id: String },
}

/// One-way sink for operator alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: Alert);
}

/// Default notifier that surfaces alerts in the log stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: Alert) {
        match alert {
            Alert::AbusePause { job_id, resume_at } => {
                warn!(job_id = %job_id, resume_at = %resume_at, "Job paused for abuse cooldown");
            }
            Alert::AbusePermanentPause { job_id } => {
                warn!(job_id = %job_id, "Job paused permanently after repeated abuse; manual resume required");
            }
            Alert::ChannelAuthExpired { channel_id } => {
                warn!(channel_id = %channel_id, "Channel auth expired; dispatch halted");
            }
        }
    }
}
