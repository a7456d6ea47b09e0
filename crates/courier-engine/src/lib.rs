//! The dispatch engine.
//!
//! Ties the queue store, rate controller, and send gateway together:
//!
//! - [`Dispatcher`] claims a batch for a job, backfills stragglers from
//!   earlier groups, fans the batch out at the channel's permitted rate,
//!   and commits every outcome.
//! - [`AbuseBreaker`] watches the outcome stream for burst-abuse
//!   signals and escalates to a temporary, then permanent, pause.
//! - [`RecoverySweeper`] periodically resets entries stuck in flight
//!   and resumes jobs whose abuse cooldown elapsed.
//! - [`JobCoordinator`] runs one worker per channel, advances template
//!   groups, and detects completion.
//!
//! Jobs sharing a channel run strictly sequentially; rate and abuse
//! state are channel-scoped and concurrent jobs on one channel would
//! corrupt the accounting. The only parallelism inside a job is the
//! bounded fan-out within a batch.

mod breaker;
mod config;
mod coordinator;
mod dispatcher;
mod error;
mod sweeper;

#[cfg(test)]
pub(crate) mod test_support;

pub use breaker::AbuseBreaker;
pub use config::EngineConfig;
pub use coordinator::JobCoordinator;
pub use dispatcher::{CycleReport, Dispatcher};
pub use error::{EngineError, EngineResult};
pub use sweeper::RecoverySweeper;
