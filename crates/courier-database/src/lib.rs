//! Persistent store for the dispatch engine.
//!
//! Owns the SQLite schema for channels, jobs, and entries, and exposes
//! the claim/commit/reset primitives the dispatcher is built on. All
//! writes go through a single dedicated SQLite thread (see
//! [`AsyncDatabase`]), which is what makes the claim transaction atomic
//! with respect to concurrent coordinators.

mod error;
mod executor;
pub mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use models::{
    Channel, ClaimScope, Entry, EntryStatus, GroupProgress, Job, JobCounters, JobStatus,
    NewChannel, NewEntry, NewJob, PauseReason,
};
