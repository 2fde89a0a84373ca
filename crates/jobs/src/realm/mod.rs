//! The job realm: admission, dispatch, recurring triggers and lifecycle.
//!
//! A realm owns a fixed pool of worker threads and one timer thread. All job
//! state lives in the [`JobStatusStore`]; the in-process queue only orders
//! ids for dispatch. Every state change is a compare-and-set on the stored
//! record, so a realm can always be reconciled from its store on restart.

mod queue;
mod stats;
mod timer;
mod worker;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use subman_core::{JobId, TriggerId};

use crate::builder::{JobBuilder, JobRequest};
use crate::config::{RealmConfig, ScheduledJobSettings};
use crate::constraint::check_all;
use crate::context::CancellationToken;
use crate::definition::JobRegistry;
use crate::error::{JobError, StoreError};
use crate::notify::{JobEvent, JobNotifier, NoopNotifier, deliver};
use crate::store::{InMemoryJobStatusStore, JobStatusStore, StatusCounts, StatusFilter};
use crate::trigger::{Schedule, Trigger, TriggerInfo};
use crate::types::{JobState, JobStatus, Transition};

pub use stats::RealmStats;

use queue::DispatchQueue;
use stats::{Counters, bump};
use timer::{TimerSignal, TriggerEntry};

/// Outcome of [`JobRealm::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every in-flight run finished within the grace period.
    pub completed_in_grace: bool,
    /// Runs marked `INTERRUPTED` because they outlived the grace period.
    pub interrupted: Vec<JobId>,
}

pub(crate) struct RealmInner {
    pub(crate) config: RealmConfig,
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) store: Arc<dyn JobStatusStore>,
    notifier: Arc<dyn JobNotifier>,
    pub(crate) queue: DispatchQueue,
    /// Serializes constraint evaluation with status creation.
    admission: Mutex<()>,
    /// Cancellation tokens of runs owned by a worker, keyed by job.
    pub(crate) running: Mutex<HashMap<JobId, CancellationToken>>,
    /// Signalled whenever a run leaves `running`.
    pub(crate) idle: Condvar,
    pub(crate) stopping: AtomicBool,
    pub(crate) triggers: Mutex<BTreeMap<TriggerId, TriggerEntry>>,
    pub(crate) timer: TimerSignal,
    pub(crate) counters: Counters,
}

impl RealmInner {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    fn resolve_group(&self, requested: Option<&str>) -> Result<String, JobError> {
        match requested {
            None => Ok(self.config.default_group().to_string()),
            Some(group) if self.config.groups.iter().any(|g| g == group) => Ok(group.to_string()),
            Some(group) => Err(JobError::UnknownGroup {
                realm: self.config.name.clone(),
                group: group.to_string(),
            }),
        }
    }

    /// Check constraints and create a `QUEUED` status for an immediate request.
    pub(crate) fn admit(
        &self,
        request: &JobRequest,
        trigger_id: Option<TriggerId>,
    ) -> Result<JobStatus, JobError> {
        self.registry.lookup(request.job_key())?;
        let group = self.resolve_group(request.group())?;
        let policy = request
            .retry_policy()
            .cloned()
            .unwrap_or_else(|| self.config.retry_policy());

        let _admission = self.admission.lock();

        let active = self.store.find_active(&StatusFilter::new())?;
        if let Err(violation) = check_all(request, &active) {
            bump(&self.counters.rejected);
            debug!(
                realm = %self.name(),
                job_key = %request.job_key(),
                constraint = %violation.constraint,
                reason = %violation.reason,
                "job rejected"
            );
            return Err(violation.into());
        }

        let status = self
            .store
            .create_status(JobStatus::queued(request, group, policy, trigger_id))?;
        self.queue.push(status.id, None);
        bump(&self.counters.admitted);

        debug!(
            realm = %self.name(),
            job_id = %status.id,
            job_key = %status.job_key,
            group = %status.group,
            "job queued"
        );
        Ok(status)
    }

    /// Publish the terminal event for a status.
    pub(crate) fn finished(&self, status: &JobStatus) {
        self.counters.record_terminal(status.state);
        deliver(self.notifier.as_ref(), &JobEvent::from_status(status));
    }

    /// Stop dispatch and triggers without waiting for anything.
    fn begin_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.queue.close();
        self.timer.wake();
    }
}

struct Threads {
    workers: Vec<JoinHandle<()>>,
    timer: JoinHandle<()>,
}

enum Lifecycle {
    Created,
    Running(Threads),
    ShutDown,
}

/// A scheduler instance: worker pool, dispatch queue, trigger timer and the
/// status store it reports into.
///
/// ```ignore
/// let realm = JobRealm::in_memory(RealmConfig::default(), registry);
/// realm.start()?;
/// let id = realm.submit(JobBuilder::for_job("export_job").build()?)?;
/// let status = realm.get_status(id)?;
/// let report = realm.shutdown();
/// ```
pub struct JobRealm {
    inner: Arc<RealmInner>,
    lifecycle: Mutex<Lifecycle>,
}

impl JobRealm {
    pub fn new(
        config: RealmConfig,
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStatusStore>,
        notifier: Arc<dyn JobNotifier>,
    ) -> Self {
        let inner = RealmInner {
            config,
            registry,
            store,
            notifier,
            queue: DispatchQueue::new(),
            admission: Mutex::new(()),
            running: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
            stopping: AtomicBool::new(false),
            triggers: Mutex::new(BTreeMap::new()),
            timer: TimerSignal::default(),
            counters: Counters::default(),
        };
        Self {
            inner: Arc::new(inner),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    /// Realm backed by a fresh in-memory store with no notifications.
    pub fn in_memory(config: RealmConfig, registry: Arc<JobRegistry>) -> Self {
        Self::new(
            config,
            registry,
            InMemoryJobStatusStore::arc(),
            Arc::new(NoopNotifier),
        )
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn config(&self) -> &RealmConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn JobStatusStore> {
        &self.inner.store
    }

    fn ensure_open(&self) -> Result<(), JobError> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(JobError::RealmShutDown(self.name().to_string()));
        }
        Ok(())
    }

    /// Admit an immediate request. Never waits on job execution.
    pub fn submit(&self, request: JobRequest) -> Result<JobId, JobError> {
        self.ensure_open()?;
        if request.trigger().is_recurring() {
            return Err(JobError::InvalidTrigger(format!(
                "{} has a recurring trigger; register it with schedule()",
                request.job_key()
            )));
        }
        self.inner.admit(&request, None).map(|status| status.id)
    }

    /// Spawn the worker pool and trigger timer. Idempotent while running.
    pub fn start(&self) -> Result<(), JobError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::ShutDown => return Err(JobError::RealmShutDown(self.name().to_string())),
            Lifecycle::Created => {}
        }

        if self.inner.config.recover_on_start {
            self.recover()?;
        }

        let threads = self.spawn_threads().inspect_err(|_| {
            // Whatever did start winds down on its own.
            self.inner.begin_stop();
        });
        match threads {
            Ok(threads) => {
                *lifecycle = Lifecycle::Running(threads);
                info!(
                    realm = %self.name(),
                    workers = self.inner.config.worker_threads,
                    groups = ?self.inner.config.groups,
                    "realm started"
                );
                Ok(())
            }
            Err(e) => {
                *lifecycle = Lifecycle::ShutDown;
                Err(e)
            }
        }
    }

    fn spawn_threads(&self) -> Result<Threads, JobError> {
        let worker_count = self.inner.config.worker_threads.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{index}", self.name()))
                .spawn(move || worker::run(inner, index))?;
            workers.push(handle);
        }

        let inner = Arc::clone(&self.inner);
        let timer = thread::Builder::new()
            .name(format!("{}-timer", self.name()))
            .spawn(move || timer::run(inner))?;

        Ok(Threads { workers, timer })
    }

    /// Re-enqueue stored `QUEUED` jobs and interrupt orphaned `RUNNING` ones.
    fn recover(&self) -> Result<(), JobError> {
        let filter = StatusFilter::active().groups(self.inner.config.groups.iter().cloned());
        let mut requeued = 0;
        let mut interrupted = 0;

        for status in self.inner.store.list(&filter)? {
            match status.state {
                JobState::Queued if !self.inner.queue.contains(status.id) => {
                    self.inner.queue.push(status.id, None);
                    requeued += 1;
                }
                JobState::Running => {
                    match self
                        .inner
                        .store
                        .cas_transition(status.id, JobState::Running, Transition::interrupt())
                    {
                        Ok(updated) => {
                            interrupted += 1;
                            self.inner.finished(&updated);
                        }
                        Err(StoreError::StateConflict { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                _ => {}
            }
        }

        if requeued > 0 || interrupted > 0 {
            info!(realm = %self.name(), requeued, interrupted, "recovered stored jobs");
        }
        Ok(())
    }

    /// Stop dispatching, wait up to the grace period for running jobs, then
    /// interrupt the rest. Idempotent.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut lifecycle = self.lifecycle.lock();
        let threads = match std::mem::replace(&mut *lifecycle, Lifecycle::ShutDown) {
            Lifecycle::Running(threads) => threads,
            Lifecycle::Created => {
                self.inner.begin_stop();
                return ShutdownReport {
                    completed_in_grace: true,
                    interrupted: Vec::new(),
                };
            }
            Lifecycle::ShutDown => {
                return ShutdownReport {
                    completed_in_grace: true,
                    interrupted: Vec::new(),
                };
            }
        };

        info!(realm = %self.name(), "realm shutting down");
        self.inner.begin_stop();

        let grace = self.inner.config.shutdown_grace_period();
        let deadline = Instant::now() + grace;
        let stuck: Vec<(JobId, CancellationToken)> = {
            let mut running = self.inner.running.lock();
            while !running.is_empty() {
                if self.inner.idle.wait_until(&mut running, deadline).timed_out() {
                    break;
                }
            }
            running.iter().map(|(id, token)| (*id, token.clone())).collect()
        };

        let mut interrupted = Vec::new();
        for (job_id, token) in &stuck {
            token.cancel();
            match self
                .inner
                .store
                .cas_transition(*job_id, JobState::Running, Transition::interrupt())
            {
                Ok(status) => {
                    warn!(
                        realm = %self.name(),
                        job_id = %job_id,
                        job_key = %status.job_key,
                        "job interrupted by shutdown"
                    );
                    self.inner.finished(&status);
                    interrupted.push(*job_id);
                }
                // Finished (or never started) after the grace period ended.
                Err(e) => debug!(realm = %self.name(), job_id = %job_id, error = %e, "not interrupted"),
            }
        }

        join_or_abandon(self.name(), threads, Duration::from_millis(200));

        info!(
            realm = %self.name(),
            interrupted = interrupted.len(),
            "realm shut down"
        );
        ShutdownReport {
            completed_in_grace: stuck.is_empty(),
            interrupted,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Standby: keep admitting, dispatch nothing. Running jobs are unaffected.
    pub fn pause(&self) {
        self.inner.queue.pause();
        info!(realm = %self.name(), "realm paused");
    }

    pub fn unpause(&self) {
        self.inner.queue.unpause();
        info!(realm = %self.name(), "realm resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.queue.is_paused()
    }

    /// Cancel a job.
    ///
    /// Queued jobs move straight to `CANCELED`. Running jobs get their
    /// cancellation signal raised and `cancel_requested` recorded; they end
    /// when the definition observes it. Terminal jobs are returned unchanged.
    pub fn cancel(&self, job_id: JobId) -> Result<JobStatus, JobError> {
        loop {
            let status = self.get_status(job_id)?;
            match status.state {
                JobState::Queued => {
                    match self
                        .inner
                        .store
                        .cas_transition(job_id, JobState::Queued, Transition::cancel())
                    {
                        Ok(canceled) => {
                            self.inner.queue.remove(job_id);
                            info!(realm = %self.name(), job_id = %job_id, "queued job canceled");
                            self.inner.finished(&canceled);
                            return Ok(canceled);
                        }
                        // A worker took it meanwhile; look again.
                        Err(StoreError::StateConflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                JobState::Running => {
                    // Flag first: a worker claiming the job after this point
                    // sees it, and one that claimed earlier has its token in
                    // `running` already.
                    let flagged = self.inner.store.request_cancel(job_id)?;
                    if flagged.state == JobState::Queued {
                        // Requeued for a retry meanwhile.
                        continue;
                    }
                    if let Some(token) = self.inner.running.lock().get(&job_id) {
                        token.cancel();
                    }
                    info!(realm = %self.name(), job_id = %job_id, "cancellation requested");
                    return Ok(flagged);
                }
                _ => return Ok(status),
            }
        }
    }

    pub fn get_status(&self, job_id: JobId) -> Result<JobStatus, JobError> {
        self.inner
            .store
            .find_by_id(job_id)?
            .ok_or(JobError::NotFound(job_id))
    }

    pub fn list_by_group(&self, group: &str) -> Result<Vec<JobStatus>, JobError> {
        let group = self.inner.resolve_group(Some(group))?;
        self.list(&StatusFilter::new().group(group))
    }

    pub fn list_by_owner(&self, owner: &str) -> Result<Vec<JobStatus>, JobError> {
        self.list(&StatusFilter::new().owner(owner))
    }

    pub fn list(&self, filter: &StatusFilter) -> Result<Vec<JobStatus>, JobError> {
        Ok(self.inner.store.list(filter)?)
    }

    pub fn groups(&self) -> &[String] {
        &self.inner.config.groups
    }

    /// Register a recurring request. Each firing submits a fresh run.
    pub fn schedule(&self, request: JobRequest) -> Result<TriggerId, JobError> {
        self.ensure_open()?;
        let schedule = match request.trigger() {
            Trigger::Recurring(schedule) => schedule.clone(),
            Trigger::Immediate => {
                return Err(JobError::InvalidTrigger(format!(
                    "{} has no recurring trigger; use submit()",
                    request.job_key()
                )));
            }
        };
        self.inner.registry.lookup(request.job_key())?;
        self.inner.resolve_group(request.group())?;

        let id = TriggerId::new();
        let entry = TriggerEntry::new(request, schedule, Utc::now());
        info!(
            realm = %self.name(),
            trigger_id = %id,
            job_key = %entry.template.job_key(),
            schedule = %entry.schedule,
            "trigger scheduled"
        );
        self.inner.triggers.lock().insert(id, entry);
        self.inner.timer.wake();
        Ok(id)
    }

    /// Register the recurring jobs declared in configuration.
    pub fn add_scheduled_jobs(
        &self,
        entries: &[ScheduledJobSettings],
    ) -> Result<Vec<TriggerId>, JobError> {
        entries
            .iter()
            .map(|entry| {
                let schedule = entry.parsed_schedule()?;
                let mut builder = JobBuilder::for_job(entry.job_key.as_str())
                    .name(entry.name.clone().unwrap_or_else(|| entry.job_key.clone()))
                    .trigger(Trigger::Recurring(schedule));
                if let Some(group) = &entry.group {
                    builder = builder.group(group.as_str());
                }
                self.schedule(builder.build()?)
            })
            .collect()
    }

    pub fn reschedule(&self, trigger_id: TriggerId, schedule: Schedule) -> Result<TriggerInfo, JobError> {
        let info = {
            let mut triggers = self.inner.triggers.lock();
            let entry = triggers
                .get_mut(&trigger_id)
                .ok_or(JobError::TriggerNotFound(trigger_id))?;
            entry.reschedule(schedule, Utc::now());
            entry.info(trigger_id)
        };
        info!(realm = %self.name(), trigger_id = %trigger_id, schedule = %info.schedule, "trigger rescheduled");
        self.inner.timer.wake();
        Ok(info)
    }

    pub fn unschedule(&self, trigger_id: TriggerId) -> Result<TriggerInfo, JobError> {
        let entry = self
            .inner
            .triggers
            .lock()
            .remove(&trigger_id)
            .ok_or(JobError::TriggerNotFound(trigger_id))?;
        info!(realm = %self.name(), trigger_id = %trigger_id, "trigger removed");
        Ok(entry.info(trigger_id))
    }

    pub fn triggers(&self) -> Vec<TriggerInfo> {
        self.inner
            .triggers
            .lock()
            .iter()
            .map(|(id, entry)| entry.info(*id))
            .collect()
    }

    /// Delete terminal statuses. Active ones are left in place.
    pub fn delete_jobs(&self, ids: &[JobId]) -> Result<usize, JobError> {
        let removed = self.inner.store.delete_terminal(ids)?;
        debug!(realm = %self.name(), requested = ids.len(), removed, "deleted job statuses");
        Ok(removed)
    }

    /// Delete terminal statuses older than the retention window.
    pub fn purge_expired(&self) -> Result<usize, JobError> {
        // A window too large to represent means nothing has expired yet.
        let Ok(retention) = chrono::Duration::from_std(self.inner.config.status_retention()) else {
            return Ok(0);
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Ok(0);
        };
        let removed = self.inner.store.delete_finished_before(cutoff)?;
        if removed > 0 {
            info!(realm = %self.name(), removed, %cutoff, "purged expired job statuses");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> RealmStats {
        let statuses = self.inner.store.stats().unwrap_or_else(|e| {
            warn!(realm = %self.name(), error = %e, "failed to count job statuses");
            StatusCounts::default()
        });
        let running = self.inner.running.lock().len();
        self.inner.counters.snapshot(
            running,
            self.inner.queue.len(),
            self.inner.queue.is_paused(),
            statuses,
        )
    }
}

impl Drop for JobRealm {
    fn drop(&mut self) {
        if matches!(*self.lifecycle.get_mut(), Lifecycle::Running(_)) {
            self.inner.begin_stop();
        }
    }
}

impl std::fmt::Debug for JobRealm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRealm")
            .field("name", &self.name())
            .field("groups", &self.groups())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Join threads that exit within `wait`; detach the rest.
fn join_or_abandon(realm: &str, threads: Threads, wait: Duration) {
    let deadline = Instant::now() + wait;
    let mut handles = threads.workers;
    handles.push(threads.timer);

    for handle in handles {
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            warn!(realm = %realm, thread = %name, "abandoning stuck realm thread");
        }
    }
}
