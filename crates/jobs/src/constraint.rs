//! Admission constraints evaluated against the active job set.

use std::fmt;

use thiserror::Error;

use crate::builder::JobRequest;
use crate::types::JobStatus;

/// A rejected admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{constraint}: {reason}")]
pub struct ConstraintViolation {
    pub constraint: String,
    pub reason: String,
}

impl ConstraintViolation {
    pub fn new(constraint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            constraint: constraint.into(),
            reason: reason.into(),
        }
    }
}

/// Predicate deciding whether a request may join the currently active
/// (`QUEUED` or `RUNNING`) statuses.
pub trait JobConstraint: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn test(&self, request: &JobRequest, active: &[JobStatus]) -> Result<(), ConstraintViolation>;
}

/// Reject when an active run of the same job has equal values for every
/// listed argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueByArguments {
    names: Vec<String>,
    label: String,
}

impl UniqueByArguments {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let label = format!("unique_by_arguments({})", names.join(", "));
        Self { names, label }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl JobConstraint for UniqueByArguments {
    fn name(&self) -> &str {
        &self.label
    }

    fn test(&self, request: &JobRequest, active: &[JobStatus]) -> Result<(), ConstraintViolation> {
        let mut wanted = Vec::with_capacity(self.names.len());
        for name in &self.names {
            match request.arguments().get(name) {
                Some(value) => wanted.push((name, value)),
                // Without a value there is nothing to be unique on.
                None => return Ok(()),
            }
        }

        let conflict = active.iter().find(|status| {
            status.job_key == request.job_key()
                && wanted
                    .iter()
                    .all(|(name, value)| status.arguments.get(name) == Some(*value))
        });

        match conflict {
            Some(status) => Err(ConstraintViolation::new(
                self.label.clone(),
                format!(
                    "job {} ({}) is already {} for the same {}",
                    status.id,
                    status.job_key,
                    status.state,
                    self.names.join(", ")
                ),
            )),
            None => Ok(()),
        }
    }
}

/// Quota: at most `max` active runs of the request's job key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxActivePerKey {
    max: usize,
}

impl MaxActivePerKey {
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl JobConstraint for MaxActivePerKey {
    fn name(&self) -> &str {
        "max_active_per_key"
    }

    fn test(&self, request: &JobRequest, active: &[JobStatus]) -> Result<(), ConstraintViolation> {
        let count = active
            .iter()
            .filter(|s| s.job_key == request.job_key())
            .count();
        if count >= self.max {
            return Err(ConstraintViolation::new(
                self.name(),
                format!("{count} active {} jobs (limit {})", request.job_key(), self.max),
            ));
        }
        Ok(())
    }
}

pub fn unique_by_argument(name: impl Into<String>) -> UniqueByArguments {
    UniqueByArguments::new([name.into()])
}

pub fn unique_by_arguments<I, S>(names: I) -> UniqueByArguments
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    UniqueByArguments::new(names)
}

pub fn max_active_per_key(max: usize) -> MaxActivePerKey {
    MaxActivePerKey::new(max)
}

/// Evaluate every constraint of the request in order, stopping at the first violation.
pub(crate) fn check_all(request: &JobRequest, active: &[JobStatus]) -> Result<(), ConstraintViolation> {
    request
        .constraints()
        .iter()
        .try_for_each(|c| c.test(request, active))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::JobBuilder;
    use crate::types::{JobState, RetryPolicy};

    fn active(key: &str, consumer: &str, state: JobState) -> JobStatus {
        let request = JobBuilder::for_job(key)
            .argument("consumer_uuid", consumer)
            .argument("cdn_label", "cdn-a")
            .build()
            .unwrap();
        let mut status = JobStatus::queued(&request, "default", RetryPolicy::default(), None);
        status.state = state;
        status
    }

    #[test]
    fn unique_by_argument_rejects_equal_values() {
        let running = vec![active("export", "c-1", JobState::Running)];
        let request = JobBuilder::for_job("export")
            .argument("consumer_uuid", "c-1")
            .constraint(unique_by_argument("consumer_uuid"))
            .build()
            .unwrap();

        let err = check_all(&request, &running).unwrap_err();
        assert_eq!(err.constraint, "unique_by_arguments(consumer_uuid)");
        assert!(err.reason.contains("RUNNING"));
    }

    #[test]
    fn different_values_or_other_jobs_do_not_conflict() {
        let running = vec![
            active("export", "c-2", JobState::Queued),
            active("refresh", "c-1", JobState::Running),
        ];
        let request = JobBuilder::for_job("export")
            .argument("consumer_uuid", "c-1")
            .constraint(unique_by_argument("consumer_uuid"))
            .build()
            .unwrap();

        assert!(check_all(&request, &running).is_ok());
    }

    #[test]
    fn missing_argument_never_conflicts() {
        let running = vec![active("export", "c-1", JobState::Running)];
        let request = JobBuilder::for_job("export")
            .constraint(unique_by_argument("consumer_uuid"))
            .build()
            .unwrap();

        assert!(check_all(&request, &running).is_ok());
    }

    #[test]
    fn tuple_uniqueness_needs_every_value_to_match() {
        let running = vec![active("export", "c-1", JobState::Running)];
        let other_cdn = JobBuilder::for_job("export")
            .argument("consumer_uuid", "c-1")
            .argument("cdn_label", "cdn-b")
            .constraint(unique_by_arguments(["consumer_uuid", "cdn_label"]))
            .build()
            .unwrap();
        assert!(check_all(&other_cdn, &running).is_ok());

        let same = JobBuilder::for_job("export")
            .argument("consumer_uuid", "c-1")
            .argument("cdn_label", "cdn-a")
            .constraint(unique_by_arguments(["consumer_uuid", "cdn_label"]))
            .build()
            .unwrap();
        assert!(check_all(&same, &running).is_err());
    }

    #[test]
    fn max_active_per_key_counts_same_key_only() {
        let running = vec![
            active("export", "c-1", JobState::Running),
            active("export", "c-2", JobState::Queued),
            active("refresh", "c-3", JobState::Queued),
        ];
        let at_limit = JobBuilder::for_job("export")
            .constraint(max_active_per_key(2))
            .build()
            .unwrap();
        assert!(check_all(&at_limit, &running).is_err());

        let under_limit = JobBuilder::for_job("refresh")
            .constraint(max_active_per_key(2))
            .build()
            .unwrap();
        assert!(check_all(&under_limit, &running).is_ok());
    }

    #[test]
    fn constraints_compose_in_order() {
        let running = vec![active("export", "c-1", JobState::Running)];
        let request = JobBuilder::for_job("export")
            .argument("consumer_uuid", "c-1")
            .constraint(max_active_per_key(1))
            .constraint(unique_by_argument("consumer_uuid"))
            .build()
            .unwrap();

        let err = check_all(&request, &running).unwrap_err();
        assert_eq!(err.constraint, "max_active_per_key");
    }
}
