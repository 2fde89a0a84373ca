//! Fluent assembly of job submissions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::arguments::{ArgValue, JobArguments, JobMetadata, LOG_LEVEL_KEY, OWNER_KEY};
use crate::constraint::JobConstraint;
use crate::error::JobError;
use crate::trigger::Trigger;
use crate::types::RetryPolicy;

/// A fully assembled submission: what to run, with which arguments, under
/// which admission constraints and trigger.
#[derive(Debug, Clone)]
pub struct JobRequest {
    job_key: String,
    name: String,
    group: Option<String>,
    arguments: JobArguments,
    metadata: JobMetadata,
    constraints: Vec<Arc<dyn JobConstraint>>,
    retry_policy: Option<RetryPolicy>,
    trigger: Trigger,
}

impl JobRequest {
    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requested group; `None` means the realm's default group.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn arguments(&self) -> &JobArguments {
        &self.arguments
    }

    pub fn metadata(&self) -> &JobMetadata {
        &self.metadata
    }

    pub fn constraints(&self) -> &[Arc<dyn JobConstraint>] {
        &self.constraints
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Copy of this request with a fresh generated name and an immediate trigger.
    /// Used when a recurring trigger fires.
    pub(crate) fn spawn_instance(&self) -> Self {
        Self {
            name: default_name(&self.job_key),
            trigger: Trigger::Immediate,
            ..self.clone()
        }
    }
}

fn default_name(job_key: &str) -> String {
    format!("{job_key}-{}", Uuid::now_v7())
}

/// Builder for [`JobRequest`].
///
/// ```ignore
/// let request = JobBuilder::for_job("export_job")
///     .argument("consumer_uuid", consumer)
///     .owner(org_key)
///     .constraint(unique_by_argument("consumer_uuid"))
///     .build()?;
/// ```
#[derive(Debug)]
pub struct JobBuilder {
    job_key: String,
    name: Option<String>,
    group: Option<String>,
    arguments: BTreeMap<String, ArgValue>,
    metadata: JobMetadata,
    constraints: Vec<Arc<dyn JobConstraint>>,
    retry_policy: Option<RetryPolicy>,
    trigger: Trigger,
    error: Option<JobError>,
}

impl JobBuilder {
    pub fn for_job(job_key: impl Into<String>) -> Self {
        Self {
            job_key: job_key.into(),
            name: None,
            group: None,
            arguments: BTreeMap::new(),
            metadata: JobMetadata::new(),
            constraints: Vec::new(),
            retry_policy: None,
            trigger: Trigger::Immediate,
            error: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Add an argument. Setting the same key twice makes `build` fail.
    pub fn argument(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        let key = key.into();
        if self.arguments.contains_key(&key) {
            self.record(JobError::DuplicateArgument(key));
        } else {
            self.arguments.insert(key, value.into());
        }
        self
    }

    /// Add a structured argument serialized to JSON.
    pub fn json_argument<T: Serialize>(self, key: impl Into<String>, value: &T) -> Self {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(json) => self.argument(key, ArgValue::Json(json)),
            Err(e) => {
                let mut this = self;
                this.record(JobError::InvalidArgument {
                    key,
                    message: e.to_string(),
                });
                this
            }
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn owner(self, owner: impl Into<String>) -> Self {
        self.metadata(OWNER_KEY, owner)
    }

    /// Minimum level for the run's [`JobLogger`](crate::JobLogger).
    pub fn log_level(self, level: impl Into<String>) -> Self {
        self.metadata(LOG_LEVEL_KEY, level)
    }

    pub fn constraint(mut self, constraint: impl JobConstraint + 'static) -> Self {
        self.constraints.push(Arc::new(constraint));
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    // Only the first problem is reported.
    fn record(&mut self, error: JobError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn build(self) -> Result<JobRequest, JobError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let name = self.name.unwrap_or_else(|| default_name(&self.job_key));
        Ok(JobRequest {
            job_key: self.job_key,
            name,
            group: self.group,
            arguments: JobArguments::from(self.arguments),
            metadata: self.metadata,
            constraints: self.constraints,
            retry_policy: self.retry_policy,
            trigger: self.trigger,
        })
    }
}
