//! Recurring trigger timer.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use subman_core::{JobId, TriggerId};

use super::RealmInner;
use super::stats::bump;
use crate::builder::JobRequest;
use crate::error::JobError;
use crate::trigger::{Schedule, TriggerInfo};

/// Wake-up flag for the timer thread.
#[derive(Debug, Default)]
pub(crate) struct TimerSignal {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl TimerSignal {
    pub(crate) fn wake(&self) {
        *self.woken.lock() = true;
        self.cond.notify_all();
    }

    /// Sleep for `tick` or until woken.
    fn wait(&self, tick: Duration) {
        let mut woken = self.woken.lock();
        if !*woken {
            self.cond.wait_for(&mut woken, tick);
        }
        *woken = false;
    }
}

#[derive(Debug)]
pub(crate) struct TriggerEntry {
    pub(crate) template: JobRequest,
    pub(crate) schedule: Schedule,
    next_fire: Option<DateTime<Utc>>,
    spawned: u64,
    skipped: u64,
    last_job: Option<JobId>,
}

impl TriggerEntry {
    pub(crate) fn new(template: JobRequest, schedule: Schedule, now: DateTime<Utc>) -> Self {
        let next_fire = schedule.next_after(now);
        Self {
            template,
            schedule,
            next_fire,
            spawned: 0,
            skipped: 0,
            last_job: None,
        }
    }

    pub(crate) fn reschedule(&mut self, schedule: Schedule, now: DateTime<Utc>) {
        self.next_fire = schedule.next_after(now);
        self.schedule = schedule;
    }

    pub(crate) fn info(&self, id: TriggerId) -> TriggerInfo {
        TriggerInfo {
            id,
            job_key: self.template.job_key().to_string(),
            name: self.template.name().to_string(),
            schedule: self.schedule.clone(),
            next_fire: self.next_fire,
            spawned: self.spawned,
            skipped: self.skipped,
            last_job: self.last_job,
        }
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire.is_some_and(|at| at <= now)
    }
}

pub(super) fn run(inner: Arc<RealmInner>) {
    debug!(realm = %inner.name(), "trigger timer started");
    let tick = inner.config.trigger_tick();

    while !inner.stopping.load(Ordering::SeqCst) {
        fire_due(&inner, Utc::now());
        inner.timer.wait(tick);
    }

    debug!(realm = %inner.name(), "trigger timer stopped");
}

/// Fire every trigger whose next fire time has passed.
///
/// Missed fire times collapse into one firing; a trigger whose previous run is
/// still active skips the tick instead of queueing behind it.
fn fire_due(inner: &RealmInner, now: DateTime<Utc>) {
    let mut triggers = inner.triggers.lock();

    for (id, entry) in triggers.iter_mut() {
        if !entry.is_due(now) {
            continue;
        }
        entry.next_fire = entry.schedule.next_after(now);

        if let Some(last) = entry.last_job {
            let still_active = match inner.store.find_by_id(last) {
                Ok(status) => status.is_some_and(|s| s.is_active()),
                Err(e) => {
                    warn!(realm = %inner.name(), trigger_id = %id, error = %e, "could not check previous run");
                    true
                }
            };
            if still_active {
                entry.skipped += 1;
                bump(&inner.counters.triggers_skipped);
                debug!(
                    realm = %inner.name(),
                    trigger_id = %id,
                    job_id = %last,
                    "trigger misfire: previous run still active"
                );
                continue;
            }
        }

        match inner.admit(&entry.template.spawn_instance(), Some(*id)) {
            Ok(status) => {
                entry.spawned += 1;
                entry.last_job = Some(status.id);
                bump(&inner.counters.triggers_fired);
                info!(
                    realm = %inner.name(),
                    trigger_id = %id,
                    job_id = %status.id,
                    job_key = %status.job_key,
                    "trigger fired"
                );
            }
            Err(JobError::ConstraintViolation(violation)) => {
                entry.skipped += 1;
                bump(&inner.counters.triggers_skipped);
                debug!(
                    realm = %inner.name(),
                    trigger_id = %id,
                    reason = %violation,
                    "trigger skipped by constraint"
                );
            }
            Err(e) => {
                entry.skipped += 1;
                bump(&inner.counters.triggers_skipped);
                warn!(realm = %inner.name(), trigger_id = %id, error = %e, "trigger failed to submit");
            }
        }
    }
}
