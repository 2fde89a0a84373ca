//! Housekeeping: drop terminal job statuses past their retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use subman_jobs::{
    AsyncJob, JobBuilder, JobExecutionContext, JobExecutionError, JobOutput, JobStatusStore,
    Schedule, Trigger, max_active_per_key,
};

pub const PURGE_JOB_STATUSES_KEY: &str = "purge_job_statuses";
/// Optional argument overriding the configured retention.
pub const RETENTION_HOURS_ARG: &str = "retention_hours";

pub struct PurgeJobStatusesJob {
    store: Arc<dyn JobStatusStore>,
    retention: Duration,
}

impl PurgeJobStatusesJob {
    pub fn new(store: Arc<dyn JobStatusStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    fn retention_for(&self, ctx: &JobExecutionContext) -> Result<Duration, JobExecutionError> {
        if !ctx.arguments().contains(RETENTION_HOURS_ARG) {
            return Ok(self.retention);
        }
        let hours = ctx.arguments().get_i64(RETENTION_HOURS_ARG)?;
        let hours = u64::try_from(hours).map_err(|_| {
            JobExecutionError::fatal(format!("{RETENTION_HOURS_ARG} must not be negative"))
        })?;
        Ok(Duration::from_secs(hours.saturating_mul(3600)))
    }
}

/// Recurring purge; never more than one instance active.
pub fn schedule_purge(schedule: Schedule) -> JobBuilder {
    JobBuilder::for_job(PURGE_JOB_STATUSES_KEY)
        .name("purge job statuses")
        .constraint(max_active_per_key(1))
        .trigger(Trigger::Recurring(schedule))
}

impl AsyncJob for PurgeJobStatusesJob {
    fn key(&self) -> &str {
        PURGE_JOB_STATUSES_KEY
    }

    fn execute(&self, ctx: &JobExecutionContext) -> Result<JobOutput, JobExecutionError> {
        let retention = self.retention_for(ctx)?;
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r))
        else {
            return Ok(Some(json!({ "removed": 0 })));
        };

        let removed = self
            .store
            .delete_finished_before(cutoff)
            .map_err(|e| JobExecutionError::retryable(e.to_string()))?;

        ctx.logger()
            .info(&format!("purged {removed} job statuses finished before {cutoff}"));
        Ok(Some(json!({ "removed": removed, "cutoff": cutoff })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subman_jobs::{
        InMemoryJobStatusStore, JobArguments, JobState, JobStatus, RetryPolicy, Transition,
    };

    fn terminal_status(store: &InMemoryJobStatusStore) {
        let request = JobBuilder::for_job("export_job").build().unwrap();
        let status = store
            .create_status(JobStatus::queued(&request, "default", RetryPolicy::default(), None))
            .unwrap();
        store
            .cas_transition(status.id, JobState::Queued, Transition::cancel())
            .unwrap();
    }

    #[test]
    fn keeps_statuses_inside_retention() {
        let store = InMemoryJobStatusStore::arc();
        terminal_status(&store);
        let job = PurgeJobStatusesJob::new(store.clone(), Duration::from_secs(3600));

        let ctx = JobExecutionContext::detached(PURGE_JOB_STATUSES_KEY, JobArguments::default());
        let output = job.execute(&ctx).unwrap().unwrap();
        assert_eq!(output["removed"], 0);
        assert_eq!(store.stats().unwrap().canceled, 1);
    }

    #[test]
    fn retention_argument_overrides_default() {
        let store = InMemoryJobStatusStore::arc();
        terminal_status(&store);
        terminal_status(&store);
        let job = PurgeJobStatusesJob::new(store.clone(), Duration::from_secs(3600));

        let request = JobBuilder::for_job(PURGE_JOB_STATUSES_KEY)
            .argument(RETENTION_HOURS_ARG, 0_i64)
            .build()
            .unwrap();
        let ctx = JobExecutionContext::detached(PURGE_JOB_STATUSES_KEY, request.arguments().clone());
        let output = job.execute(&ctx).unwrap().unwrap();
        assert_eq!(output["removed"], 2);
        assert_eq!(store.stats().unwrap().total(), 0);
    }

    #[test]
    fn negative_retention_is_rejected() {
        let job = PurgeJobStatusesJob::new(InMemoryJobStatusStore::arc(), Duration::ZERO);
        let request = JobBuilder::for_job(PURGE_JOB_STATUSES_KEY)
            .argument(RETENTION_HOURS_ARG, -1_i64)
            .build()
            .unwrap();
        let ctx = JobExecutionContext::detached(PURGE_JOB_STATUSES_KEY, request.arguments().clone());
        assert!(matches!(
            job.execute(&ctx),
            Err(JobExecutionError::Failed { retryable: false, .. })
        ));
    }

    #[test]
    fn schedule_is_recurring_and_single_instance() {
        let request = schedule_purge(Schedule::cron("0 0 3 * * *").unwrap())
            .build()
            .unwrap();
        assert!(request.trigger().is_recurring());
        assert_eq!(request.constraints().len(), 1);
    }
}
