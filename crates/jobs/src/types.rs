//! Job status records, the state graph, and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use subman_core::{JobId, TriggerId};

use crate::arguments::{JobArguments, JobMetadata, OWNER_KEY};
use crate::builder::JobRequest;

/// Lifecycle state of one job run.
///
/// ```text
/// QUEUED ──► RUNNING ──► FINISHED | FAILED | CANCELED | INTERRUPTED
///   │  ▲         │
///   │  └─────────┘ (retry, same record)
///   └──► CANCELED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Failed,
    Canceled,
    Interrupted,
}

impl JobState {
    pub const ACTIVE: [JobState; 2] = [JobState::Queued, JobState::Running];

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    /// Whether `self -> next` is an edge of the state graph.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Queued)
                | (Running, Finished)
                | (Running, Failed)
                | (Running, Canceled)
                | (Running, Interrupted)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Finished => "FINISHED",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
            JobState::Interrupted => "INTERRUPTED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended in `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Declared business failure returned by the job definition.
    Execution,
    /// Defect: an undeclared error or a panic inside the definition.
    Unexpected,
}

/// Error recorded on a `FAILED` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
    pub kind: FailureKind,
}

impl JobFailure {
    pub fn execution(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            retryable,
            kind: FailureKind::Execution,
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            kind: FailureKind::Unexpected,
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy for retryable execution failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of runs allowed, including the first (minimum 1).
    pub max_attempts: u32,
    /// Base delay between attempts
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt; retryable failures fail immediately.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay to wait after the given (1-indexed) attempt failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic per-attempt jitter keeps retries reproducible in tests.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another run is allowed after `attempts` runs have happened.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Record of one finished attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub outcome: JobState,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Durable record of one job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    /// Key of the job definition that executes this run.
    pub job_key: String,
    /// Human-readable label.
    pub name: String,
    /// Realm group the run belongs to.
    pub group: String,
    pub arguments: JobArguments,
    pub metadata: JobMetadata,
    pub state: JobState,
    /// Number of runs started so far.
    pub attempts: u32,
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the current (or last) attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// Set once a terminal state is reached.
    pub finished_at: Option<DateTime<Utc>>,
    /// Present only in `FINISHED`.
    pub result: Option<serde_json::Value>,
    /// Present only in `FAILED`.
    pub error: Option<JobFailure>,
    pub history: Vec<JobAttemptRecord>,
    /// Recurring trigger that spawned this run, if any.
    pub trigger_id: Option<TriggerId>,
    pub cancel_requested: bool,
}

impl JobStatus {
    /// Build the initial `QUEUED` record for an admitted request.
    pub fn queued(
        request: &JobRequest,
        group: impl Into<String>,
        retry_policy: RetryPolicy,
        trigger_id: Option<TriggerId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_key: request.job_key().to_string(),
            name: request.name().to_string(),
            group: group.into(),
            arguments: request.arguments().clone(),
            metadata: request.metadata().clone(),
            state: JobState::Queued,
            attempts: 0,
            retry_policy,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            history: Vec::new(),
            trigger_id,
            cancel_requested: false,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.metadata.get(OWNER_KEY).map(String::as_str)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// A state change applied atomically by [`JobStatusStore::cas_transition`].
///
/// [`JobStatusStore::cas_transition`]: crate::store::JobStatusStore::cas_transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: JobState,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobFailure>,
    /// Attempt-history note for outcomes that carry no `error`.
    pub note: Option<String>,
}

impl Transition {
    fn to(state: JobState) -> Self {
        Self {
            to: state,
            result: None,
            error: None,
            note: None,
        }
    }

    /// `QUEUED -> RUNNING`: a worker took the job.
    pub fn start() -> Self {
        Self::to(JobState::Running)
    }

    pub fn finish(result: Option<serde_json::Value>) -> Self {
        Self {
            result,
            ..Self::to(JobState::Finished)
        }
    }

    pub fn fail(failure: JobFailure) -> Self {
        Self {
            error: Some(failure),
            ..Self::to(JobState::Failed)
        }
    }

    /// `RUNNING -> QUEUED` after a retryable failure.
    pub fn requeue(error: impl Into<String>) -> Self {
        Self {
            note: Some(error.into()),
            ..Self::to(JobState::Queued)
        }
    }

    pub fn cancel() -> Self {
        Self::to(JobState::Canceled)
    }

    pub fn interrupt() -> Self {
        Self {
            note: Some("interrupted by realm shutdown".to_string()),
            ..Self::to(JobState::Interrupted)
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Apply to a record already known to be in a state that may reach `self.to`.
    pub fn apply(&self, status: &mut JobStatus, now: DateTime<Utc>) {
        if status.state == JobState::Running && self.to != JobState::Running {
            if let Some(started_at) = status.started_at {
                status.history.push(JobAttemptRecord {
                    attempt: status.attempts,
                    started_at,
                    finished_at: now,
                    success: self.to == JobState::Finished,
                    outcome: self.to,
                    error: self
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .or_else(|| self.note.clone()),
                    duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
                });
            }
        }

        match self.to {
            JobState::Running => {
                status.attempts += 1;
                status.started_at = Some(now);
            }
            JobState::Queued => {}
            _ => status.finished_at = Some(now),
        }

        if self.to == JobState::Finished {
            status.result = self.result.clone();
        }
        if self.to == JobState::Failed {
            status.error = self.error.clone();
        }

        status.state = self.to;
        status.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::JobBuilder;
    use proptest::prelude::*;

    fn queued_status() -> JobStatus {
        let request = JobBuilder::for_job("test")
            .argument("consumer", "abc")
            .build()
            .unwrap();
        JobStatus::queued(&request, "default", RetryPolicy::default(), None)
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 50,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn should_retry_counts_total_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn start_increments_attempts_and_sets_started_at() {
        let mut status = queued_status();
        Transition::start().apply(&mut status, Utc::now());

        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.attempts, 1);
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_none());
    }

    #[test]
    fn requeue_keeps_the_record_and_logs_the_attempt() {
        let mut status = queued_status();
        Transition::start().apply(&mut status, Utc::now());
        Transition::requeue("backend unavailable").apply(&mut status, Utc::now());

        assert_eq!(status.state, JobState::Queued);
        assert_eq!(status.attempts, 1);
        assert!(status.error.is_none());
        assert_eq!(status.history.len(), 1);
        assert_eq!(status.history[0].error.as_deref(), Some("backend unavailable"));

        Transition::start().apply(&mut status, Utc::now());
        assert_eq!(status.attempts, 2);
    }

    #[test]
    fn result_and_error_only_on_matching_terminal_states() {
        let mut finished = queued_status();
        Transition::start().apply(&mut finished, Utc::now());
        Transition::finish(Some(serde_json::json!({"file": "x.zip"}))).apply(&mut finished, Utc::now());
        assert!(finished.result.is_some());
        assert!(finished.error.is_none());
        assert!(finished.history[0].success);

        let mut failed = queued_status();
        Transition::start().apply(&mut failed, Utc::now());
        Transition::fail(JobFailure::execution("boom", false)).apply(&mut failed, Utc::now());
        assert!(failed.result.is_none());
        assert_eq!(failed.error.as_ref().unwrap().message, "boom");
        assert!(failed.finished_at.is_some());
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        let all = [
            JobState::Queued,
            JobState::Running,
            JobState::Finished,
            JobState::Failed,
            JobState::Canceled,
            JobState::Interrupted,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        assert!(JobState::Queued.can_transition_to(JobState::Canceled));
        assert!(!JobState::Queued.can_transition_to(JobState::Finished));
    }

    fn any_state() -> impl Strategy<Value = JobState> {
        prop_oneof![
            Just(JobState::Queued),
            Just(JobState::Running),
            Just(JobState::Finished),
            Just(JobState::Failed),
            Just(JobState::Canceled),
            Just(JobState::Interrupted),
        ]
    }

    proptest! {
        /// Property: following only legal edges, once a terminal state is
        /// reached every later step is rejected.
        #[test]
        fn terminal_states_are_absorbing(steps in prop::collection::vec(any_state(), 1..20)) {
            let mut current = JobState::Queued;
            let mut terminal_seen = false;
            for next in steps {
                if current.can_transition_to(next) {
                    prop_assert!(!terminal_seen);
                    current = next;
                }
                terminal_seen |= current.is_terminal();
            }
        }

        /// Property: delays never decrease with the attempt number (no jitter).
        #[test]
        fn exponential_delays_are_monotonic(base in 1u64..1_000, attempts in 1u32..30) {
            let policy = RetryPolicy {
                max_attempts: attempts,
                base_delay: Duration::from_millis(base),
                max_delay: Duration::from_secs(120),
                strategy: BackoffStrategy::Exponential,
                jitter: 0.0,
            };
            for attempt in 1..attempts {
                prop_assert!(policy.delay_for_attempt(attempt) <= policy.delay_for_attempt(attempt + 1));
            }
        }
    }
}
