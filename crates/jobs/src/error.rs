//! Error taxonomy of the job subsystem.
//!
//! Definition and build-time errors (`DuplicateKey`, `UnknownJob`,
//! `DuplicateArgument`) are caller bugs and are never retried.
//! `ConstraintViolation` means nothing was created; the caller may try again
//! later. Failures that happen while a job runs never show up here; they are
//! recorded on the job's status.

use thiserror::Error;

use subman_core::{JobId, TriggerId};

use crate::constraint::ConstraintViolation;
use crate::types::JobState;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job definition already registered: {0}")]
    DuplicateKey(String),

    #[error("unknown job definition: {0}")]
    UnknownJob(String),

    #[error("argument specified more than once: {0}")]
    DuplicateArgument(String),

    #[error("argument {key} could not be encoded: {message}")]
    InvalidArgument { key: String, message: String },

    #[error("realm {realm} does not serve group {group}")]
    UnknownGroup { realm: String, group: String },

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("job rejected: {0}")]
    ConstraintViolation(#[from] ConstraintViolation),

    #[error("job status not found: {0}")]
    NotFound(JobId),

    #[error("trigger not found: {0}")]
    TriggerNotFound(TriggerId),

    #[error("realm {0} has been shut down")]
    RealmShutDown(String),

    #[error("failed to spawn realm thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistence failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("job status not found: {0}")]
    NotFound(JobId),

    #[error("job status already exists: {0}")]
    AlreadyExists(JobId),

    /// Compare-and-set lost: the record was not in the expected state.
    #[error("job {id} expected in state {expected}, found {actual}")]
    StateConflict {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },

    /// The requested transition is not an edge of the state graph.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },

    #[error("storage error: {0}")]
    Storage(String),
}
