//! Owner-wide compliance recalculation.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use subman_jobs::{
    AsyncJob, JobBuilder, JobExecutionContext, JobExecutionError, JobOutput, unique_by_argument,
};

pub const REFRESH_COMPLIANCE_JOB_KEY: &str = "refresh_compliance";
pub const OWNER_ARG: &str = "owner_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceStatus {
    Valid,
    Partial,
    Invalid,
}

#[derive(Debug, Clone, Error)]
pub enum ComplianceError {
    #[error("owner {0} does not exist")]
    OwnerNotFound(String),

    #[error("compliance source unavailable: {0}")]
    Unavailable(String),
}

impl From<ComplianceError> for JobExecutionError {
    fn from(err: ComplianceError) -> Self {
        match err {
            ComplianceError::OwnerNotFound(_) => JobExecutionError::fatal(err.to_string()),
            ComplianceError::Unavailable(_) => JobExecutionError::retryable(err.to_string()),
        }
    }
}

/// Access to an owner's consumers and their compliance computation.
pub trait ComplianceSource: Send + Sync {
    fn consumers(&self, owner_key: &str) -> Result<Vec<String>, ComplianceError>;

    fn recompute(&self, consumer_uuid: &str) -> Result<ComplianceStatus, ComplianceError>;
}

/// Per-owner tally returned as the job result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceSummary {
    pub owner_key: String,
    pub consumers: usize,
    pub valid: usize,
    pub partial: usize,
    pub invalid: usize,
}

pub struct RefreshComplianceJob<S> {
    source: S,
}

impl<S: ComplianceSource> RefreshComplianceJob<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

/// One refresh per owner may be active at a time.
pub fn schedule_refresh(owner_key: &str) -> JobBuilder {
    JobBuilder::for_job(REFRESH_COMPLIANCE_JOB_KEY)
        .argument(OWNER_ARG, owner_key)
        .owner(owner_key)
        .constraint(unique_by_argument(OWNER_ARG))
}

impl<S: ComplianceSource + 'static> AsyncJob for RefreshComplianceJob<S> {
    fn key(&self) -> &str {
        REFRESH_COMPLIANCE_JOB_KEY
    }

    fn execute(&self, ctx: &JobExecutionContext) -> Result<JobOutput, JobExecutionError> {
        let owner_key = ctx.arguments().get_str(OWNER_ARG)?;
        let consumers = self.source.consumers(owner_key)?;
        ctx.logger().info(&format!(
            "recalculating compliance for {} consumers of {owner_key}",
            consumers.len()
        ));

        let mut summary = ComplianceSummary {
            owner_key: owner_key.to_string(),
            ..Default::default()
        };
        for consumer in &consumers {
            ctx.checkpoint()?;
            let status = self.source.recompute(consumer)?;
            ctx.logger().debug(&format!("{consumer}: {status:?}"));
            match status {
                ComplianceStatus::Valid => summary.valid += 1,
                ComplianceStatus::Partial => summary.partial += 1,
                ComplianceStatus::Invalid => summary.invalid += 1,
            }
            summary.consumers += 1;
        }

        let output = serde_json::to_value(&summary)
            .map_err(|e| JobExecutionError::Unexpected(e.into()))?;
        Ok(Some(output))
    }
}

/// Compliance data held in memory, keyed by owner.
#[derive(Debug, Default)]
pub struct InMemoryComplianceSource {
    owners: RwLock<HashMap<String, Vec<(String, ComplianceStatus)>>>,
}

impl InMemoryComplianceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_consumer(&self, owner_key: &str, consumer_uuid: &str, status: ComplianceStatus) {
        let mut owners = self.owners.write();
        let consumers = owners.entry(owner_key.to_string()).or_default();
        match consumers.iter_mut().find(|(uuid, _)| uuid == consumer_uuid) {
            Some(entry) => entry.1 = status,
            None => consumers.push((consumer_uuid.to_string(), status)),
        }
    }
}

impl ComplianceSource for InMemoryComplianceSource {
    fn consumers(&self, owner_key: &str) -> Result<Vec<String>, ComplianceError> {
        self.owners
            .read()
            .get(owner_key)
            .map(|consumers| consumers.iter().map(|(uuid, _)| uuid.clone()).collect())
            .ok_or_else(|| ComplianceError::OwnerNotFound(owner_key.to_string()))
    }

    fn recompute(&self, consumer_uuid: &str) -> Result<ComplianceStatus, ComplianceError> {
        self.owners
            .read()
            .values()
            .flatten()
            .find(|(uuid, _)| uuid == consumer_uuid)
            .map(|(_, status)| *status)
            .ok_or_else(|| ComplianceError::Unavailable(format!("no data for {consumer_uuid}")))
    }
}

impl<S: ComplianceSource + ?Sized> ComplianceSource for std::sync::Arc<S> {
    fn consumers(&self, owner_key: &str) -> Result<Vec<String>, ComplianceError> {
        (**self).consumers(owner_key)
    }

    fn recompute(&self, consumer_uuid: &str) -> Result<ComplianceStatus, ComplianceError> {
        (**self).recompute(consumer_uuid)
    }
}
