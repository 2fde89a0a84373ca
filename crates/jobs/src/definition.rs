//! Job definitions and the immutable registry that resolves them by key.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::arguments::ArgumentError;
use crate::context::JobExecutionContext;
use crate::error::JobError;

/// Value stored on a `FINISHED` status.
pub type JobOutput = Option<serde_json::Value>;

/// Outcome of a failed `execute` call.
#[derive(Debug, Error)]
pub enum JobExecutionError {
    /// Declared failure. Retryable ones go back to `QUEUED` while attempts remain.
    #[error("{message}")]
    Failed { message: String, retryable: bool },

    /// The run observed its cancellation signal and stopped.
    #[error("job canceled")]
    Canceled,

    /// Anything the definition did not anticipate. Never retried.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl JobExecutionError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }
}

impl From<ArgumentError> for JobExecutionError {
    fn from(err: ArgumentError) -> Self {
        Self::fatal(err.to_string())
    }
}

/// A named, stateless unit of work.
///
/// Implementations must tolerate being executed concurrently for different
/// runs and repeatedly for retries of the same run.
pub trait AsyncJob: Send + Sync + 'static {
    /// Registry key. Unique within a registry.
    fn key(&self) -> &str;

    fn execute(&self, ctx: &JobExecutionContext) -> Result<JobOutput, JobExecutionError>;
}

/// Closure-backed definition.
pub struct FnJob<F> {
    key: String,
    f: F,
}

impl<F> FnJob<F>
where
    F: Fn(&JobExecutionContext) -> Result<JobOutput, JobExecutionError> + Send + Sync + 'static,
{
    pub fn new(key: impl Into<String>, f: F) -> Self {
        Self { key: key.into(), f }
    }
}

impl<F> AsyncJob for FnJob<F>
where
    F: Fn(&JobExecutionContext) -> Result<JobOutput, JobExecutionError> + Send + Sync + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn execute(&self, ctx: &JobExecutionContext) -> Result<JobOutput, JobExecutionError> {
        (self.f)(ctx)
    }
}

impl<F> fmt::Debug for FnJob<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnJob").field("key", &self.key).finish()
    }
}

/// Closed set of job definitions, fixed once built.
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn AsyncJob>>,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::default()
    }

    pub fn lookup(&self, key: &str) -> Result<Arc<dyn AsyncJob>, JobError> {
        self.jobs
            .get(key)
            .cloned()
            .ok_or_else(|| JobError::UnknownJob(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.jobs.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

#[derive(Default)]
pub struct JobRegistryBuilder {
    jobs: HashMap<String, Arc<dyn AsyncJob>>,
}

impl JobRegistryBuilder {
    pub fn register(mut self, job: impl AsyncJob) -> Result<Self, JobError> {
        let key = job.key().to_string();
        if self.jobs.contains_key(&key) {
            return Err(JobError::DuplicateKey(key));
        }
        self.jobs.insert(key, Arc::new(job));
        Ok(self)
    }

    pub fn build(self) -> Arc<JobRegistry> {
        Arc::new(JobRegistry { jobs: self.jobs })
    }
}
