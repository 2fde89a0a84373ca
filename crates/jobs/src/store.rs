//! Job status persistence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use subman_core::{JobId, TriggerId};

use crate::arguments::{ArgValue, OWNER_KEY};
use crate::error::StoreError;
use crate::types::{JobState, JobStatus, Transition};

/// Selection over status records. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct StatusFilter {
    pub job_keys: Vec<String>,
    pub groups: Vec<String>,
    pub states: Vec<JobState>,
    pub owner: Option<String>,
    pub trigger_id: Option<TriggerId>,
    pub arguments: Vec<(String, ArgValue)>,
    pub limit: Option<usize>,
}

impl StatusFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only `QUEUED` and `RUNNING`.
    pub fn active() -> Self {
        Self::new().states(JobState::ACTIVE)
    }

    pub fn job_key(mut self, key: impl Into<String>) -> Self {
        self.job_keys.push(key.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.states.push(state);
        self
    }

    pub fn states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.states.extend(states);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn trigger_id(mut self, trigger_id: TriggerId) -> Self {
        self.trigger_id = Some(trigger_id);
        self
    }

    pub fn argument(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.arguments.push((name.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, status: &JobStatus) -> bool {
        (self.job_keys.is_empty() || self.job_keys.iter().any(|k| *k == status.job_key))
            && (self.groups.is_empty() || self.groups.iter().any(|g| *g == status.group))
            && (self.states.is_empty() || self.states.contains(&status.state))
            && self
                .owner
                .as_deref()
                .is_none_or(|owner| status.metadata.get(OWNER_KEY).map(String::as_str) == Some(owner))
            && self.trigger_id.is_none_or(|t| status.trigger_id == Some(t))
            && self
                .arguments
                .iter()
                .all(|(name, value)| status.arguments.get(name) == Some(value))
    }
}

/// Counts of status records per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub finished: usize,
    pub failed: usize,
    pub canceled: usize,
    pub interrupted: usize,
}

impl StatusCounts {
    fn record(&mut self, state: JobState) {
        match state {
            JobState::Queued => self.queued += 1,
            JobState::Running => self.running += 1,
            JobState::Finished => self.finished += 1,
            JobState::Failed => self.failed += 1,
            JobState::Canceled => self.canceled += 1,
            JobState::Interrupted => self.interrupted += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.finished + self.failed + self.canceled + self.interrupted
    }
}

/// Durable job status storage.
///
/// Every state change goes through [`cas_transition`](Self::cas_transition):
/// the update applies only if the record is still in `expected` and the
/// move is an edge of the state graph.
pub trait JobStatusStore: Send + Sync {
    fn create_status(&self, status: JobStatus) -> Result<JobStatus, StoreError>;

    fn cas_transition(
        &self,
        id: JobId,
        expected: JobState,
        transition: Transition,
    ) -> Result<JobStatus, StoreError>;

    /// Record that cancellation was requested without changing the state.
    fn request_cancel(&self, id: JobId) -> Result<JobStatus, StoreError>;

    fn find_by_id(&self, id: JobId) -> Result<Option<JobStatus>, StoreError>;

    /// Active (`QUEUED`/`RUNNING`) records that also match `filter`.
    fn find_active(&self, filter: &StatusFilter) -> Result<Vec<JobStatus>, StoreError>;

    /// Matching records ordered by creation time.
    fn list(&self, filter: &StatusFilter) -> Result<Vec<JobStatus>, StoreError>;

    /// Delete the given records if terminal. Returns how many were removed.
    fn delete_terminal(&self, ids: &[JobId]) -> Result<usize, StoreError>;

    /// Delete terminal records that finished before `cutoff`.
    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    fn stats(&self) -> Result<StatusCounts, StoreError>;
}

/// In-memory status store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStatusStore {
    statuses: RwLock<HashMap<JobId, JobStatus>>,
}

impl InMemoryJobStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn sorted(mut statuses: Vec<JobStatus>, limit: Option<usize>) -> Vec<JobStatus> {
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            statuses.truncate(limit);
        }
        statuses
    }
}

impl JobStatusStore for InMemoryJobStatusStore {
    fn create_status(&self, status: JobStatus) -> Result<JobStatus, StoreError> {
        let mut statuses = self.statuses.write();
        if statuses.contains_key(&status.id) {
            return Err(StoreError::AlreadyExists(status.id));
        }
        statuses.insert(status.id, status.clone());
        Ok(status)
    }

    fn cas_transition(
        &self,
        id: JobId,
        expected: JobState,
        transition: Transition,
    ) -> Result<JobStatus, StoreError> {
        let mut statuses = self.statuses.write();
        let status = statuses.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if status.state != expected {
            return Err(StoreError::StateConflict {
                id,
                expected,
                actual: status.state,
            });
        }
        if !expected.can_transition_to(transition.to) {
            return Err(StoreError::IllegalTransition {
                from: expected,
                to: transition.to,
            });
        }

        transition.apply(status, Utc::now());
        Ok(status.clone())
    }

    fn request_cancel(&self, id: JobId) -> Result<JobStatus, StoreError> {
        let mut statuses = self.statuses.write();
        let status = statuses.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if status.is_active() {
            status.cancel_requested = true;
            status.updated_at = Utc::now();
        }
        Ok(status.clone())
    }

    fn find_by_id(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
        Ok(self.statuses.read().get(&id).cloned())
    }

    fn find_active(&self, filter: &StatusFilter) -> Result<Vec<JobStatus>, StoreError> {
        let statuses = self.statuses.read();
        let active = statuses
            .values()
            .filter(|s| s.is_active() && filter.matches(s))
            .cloned()
            .collect();
        Ok(Self::sorted(active, filter.limit))
    }

    fn list(&self, filter: &StatusFilter) -> Result<Vec<JobStatus>, StoreError> {
        let statuses = self.statuses.read();
        let matched = statuses
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        Ok(Self::sorted(matched, filter.limit))
    }

    fn delete_terminal(&self, ids: &[JobId]) -> Result<usize, StoreError> {
        let mut statuses = self.statuses.write();
        let mut removed = 0;
        for id in ids {
            if statuses.get(id).is_some_and(JobStatus::is_terminal) {
                statuses.remove(id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut statuses = self.statuses.write();
        let before = statuses.len();
        statuses.retain(|_, s| !(s.is_terminal() && s.finished_at.is_some_and(|at| at < cutoff)));
        Ok(before - statuses.len())
    }

    fn stats(&self) -> Result<StatusCounts, StoreError> {
        let statuses = self.statuses.read();
        let mut counts = StatusCounts::default();
        for status in statuses.values() {
            counts.record(status.state);
        }
        Ok(counts)
    }
}

impl<S: JobStatusStore + ?Sized> JobStatusStore for Arc<S> {
    fn create_status(&self, status: JobStatus) -> Result<JobStatus, StoreError> {
        (**self).create_status(status)
    }

    fn cas_transition(
        &self,
        id: JobId,
        expected: JobState,
        transition: Transition,
    ) -> Result<JobStatus, StoreError> {
        (**self).cas_transition(id, expected, transition)
    }

    fn request_cancel(&self, id: JobId) -> Result<JobStatus, StoreError> {
        (**self).request_cancel(id)
    }

    fn find_by_id(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
        (**self).find_by_id(id)
    }

    fn find_active(&self, filter: &StatusFilter) -> Result<Vec<JobStatus>, StoreError> {
        (**self).find_active(filter)
    }

    fn list(&self, filter: &StatusFilter) -> Result<Vec<JobStatus>, StoreError> {
        (**self).list(filter)
    }

    fn delete_terminal(&self, ids: &[JobId]) -> Result<usize, StoreError> {
        (**self).delete_terminal(ids)
    }

    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        (**self).delete_finished_before(cutoff)
    }

    fn stats(&self) -> Result<StatusCounts, StoreError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::JobBuilder;
    use crate::types::{JobFailure, RetryPolicy};

    fn new_status(key: &str, owner: &str) -> JobStatus {
        let request = JobBuilder::for_job(key)
            .argument("consumer_uuid", "c-1")
            .owner(owner)
            .build()
            .unwrap();
        JobStatus::queued(&request, "default", RetryPolicy::default(), None)
    }

    #[test]
    fn create_and_cas_to_running() {
        let store = InMemoryJobStatusStore::new();
        let status = store.create_status(new_status("export", "acme")).unwrap();

        let running = store
            .cas_transition(status.id, JobState::Queued, Transition::start())
            .unwrap();
        assert_eq!(running.state, JobState::Running);
        assert_eq!(running.attempts, 1);

        // A second claim loses the race.
        let err = store
            .cas_transition(status.id, JobState::Queued, Transition::start())
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::StateConflict {
                id: status.id,
                expected: JobState::Queued,
                actual: JobState::Running,
            }
        );
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let store = InMemoryJobStatusStore::new();
        let status = new_status("export", "acme");
        store.create_status(status.clone()).unwrap();
        assert_eq!(
            store.create_status(status.clone()),
            Err(StoreError::AlreadyExists(status.id))
        );
    }

    #[test]
    fn terminal_records_reject_every_transition() {
        let store = InMemoryJobStatusStore::new();
        let status = store.create_status(new_status("export", "acme")).unwrap();
        store
            .cas_transition(status.id, JobState::Queued, Transition::cancel())
            .unwrap();

        let err = store
            .cas_transition(status.id, JobState::Canceled, Transition::start())
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
        assert_eq!(
            store.find_by_id(status.id).unwrap().unwrap().state,
            JobState::Canceled
        );
    }

    #[test]
    fn queued_cannot_finish_directly() {
        let store = InMemoryJobStatusStore::new();
        let status = store.create_status(new_status("export", "acme")).unwrap();
        let err = store
            .cas_transition(status.id, JobState::Queued, Transition::finish(None))
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::IllegalTransition {
                from: JobState::Queued,
                to: JobState::Finished,
            }
        );
    }

    #[test]
    fn filters_select_by_owner_key_and_state() {
        let store = InMemoryJobStatusStore::new();
        let a = store.create_status(new_status("export", "acme")).unwrap();
        let b = store.create_status(new_status("export", "globex")).unwrap();
        store.create_status(new_status("refresh", "acme")).unwrap();
        store
            .cas_transition(b.id, JobState::Queued, Transition::start())
            .unwrap();

        let acme = store.list(&StatusFilter::new().owner("acme")).unwrap();
        assert_eq!(acme.len(), 2);
        assert_eq!(acme[0].id, a.id);

        let running = store.list(&StatusFilter::new().state(JobState::Running)).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b.id);

        let exports = store
            .find_active(&StatusFilter::new().job_key("export").argument("consumer_uuid", "c-1"))
            .unwrap();
        assert_eq!(exports.len(), 2);

        let limited = store.list(&StatusFilter::new().limit(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn delete_only_removes_terminal_records() {
        let store = InMemoryJobStatusStore::new();
        let active = store.create_status(new_status("export", "acme")).unwrap();
        let done = store.create_status(new_status("export", "acme")).unwrap();
        store
            .cas_transition(done.id, JobState::Queued, Transition::start())
            .unwrap();
        store
            .cas_transition(
                done.id,
                JobState::Running,
                Transition::fail(JobFailure::execution("boom", false)),
            )
            .unwrap();

        assert_eq!(store.delete_terminal(&[active.id, done.id]).unwrap(), 1);
        assert!(store.find_by_id(active.id).unwrap().is_some());
        assert!(store.find_by_id(done.id).unwrap().is_none());
    }

    #[test]
    fn delete_finished_before_respects_cutoff() {
        let store = InMemoryJobStatusStore::new();
        let status = store.create_status(new_status("export", "acme")).unwrap();
        store
            .cas_transition(status.id, JobState::Queued, Transition::cancel())
            .unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.delete_finished_before(past).unwrap(), 0);

        let future = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.delete_finished_before(future).unwrap(), 1);
    }

    #[test]
    fn request_cancel_flags_active_records_only() {
        let store = InMemoryJobStatusStore::new();
        let status = store.create_status(new_status("export", "acme")).unwrap();
        assert!(store.request_cancel(status.id).unwrap().cancel_requested);

        store
            .cas_transition(status.id, JobState::Queued, Transition::cancel())
            .unwrap();
        let other = store.create_status(new_status("export", "acme")).unwrap();
        store
            .cas_transition(other.id, JobState::Queued, Transition::cancel())
            .unwrap();
        assert!(!store.request_cancel(other.id).unwrap().cancel_requested);

        let missing = JobId::new();
        assert_eq!(store.request_cancel(missing), Err(StoreError::NotFound(missing)));
    }

    #[test]
    fn stats_count_per_state() {
        let store = InMemoryJobStatusStore::new();
        for _ in 0..3 {
            store.create_status(new_status("export", "acme")).unwrap();
        }
        let first = store.list(&StatusFilter::new()).unwrap()[0].id;
        store
            .cas_transition(first, JobState::Queued, Transition::start())
            .unwrap();

        let counts = store.stats().unwrap();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.total(), 3);
    }
}
