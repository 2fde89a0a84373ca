//! Asynchronous job subsystem.
//!
//! Request-handling code builds a [`JobRequest`] with a [`JobBuilder`] and
//! submits it to a [`JobRealm`]. The realm checks admission constraints
//! against the active status records, persists a `QUEUED` [`JobStatus`],
//! and hands the run to a bounded pool of worker threads. Outcomes are only
//! observable through the status record (or the terminal [`JobEvent`]).
//!
//! ## Components
//!
//! - [`AsyncJob`] / [`JobRegistry`]: named job definitions, frozen at startup
//! - [`JobArguments`]: immutable argument bag captured at submission
//! - [`JobConstraint`]: admission predicates (`unique_by_argument`, ...)
//! - [`JobStatusStore`]: persistence boundary with CAS state transitions
//! - [`JobRealm`]: worker pool, dispatch queue, recurring triggers
//! - [`JobExecutionContext`]: what a definition sees while running

pub mod arguments;
pub mod builder;
pub mod config;
pub mod constraint;
pub mod context;
pub mod definition;
pub mod error;
pub mod notify;
pub mod realm;
pub mod store;
pub mod trigger;
pub mod types;

pub use arguments::{ArgValue, ArgumentError, JobArguments, JobMetadata, LOG_LEVEL_KEY, OWNER_KEY};
pub use builder::{JobBuilder, JobRequest};
pub use config::{RealmConfig, RetrySettings, ScheduledJobSettings};
pub use constraint::{
    ConstraintViolation, JobConstraint, MaxActivePerKey, UniqueByArguments, max_active_per_key,
    unique_by_argument, unique_by_arguments,
};
pub use context::{CancellationToken, JobExecutionContext, JobLogger};
pub use definition::{AsyncJob, FnJob, JobExecutionError, JobOutput, JobRegistry, JobRegistryBuilder};
pub use error::{JobError, StoreError};
pub use notify::{BusNotifier, JobEvent, JobNotifier, NoopNotifier, NotifyError};
pub use realm::{JobRealm, RealmStats, ShutdownReport};
pub use store::{InMemoryJobStatusStore, JobStatusStore, StatusCounts, StatusFilter};
pub use trigger::{Schedule, Trigger, TriggerInfo};
pub use types::{
    BackoffStrategy, FailureKind, JobAttemptRecord, JobFailure, JobState, JobStatus, RetryPolicy,
    Transition,
};

pub use subman_core::{JobId, TriggerId};
