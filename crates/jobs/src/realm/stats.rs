use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::store::StatusCounts;
use crate::types::JobState;

/// Realm runtime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RealmStats {
    pub admitted: u64,
    pub rejected: u64,
    pub finished: u64,
    pub failed: u64,
    pub canceled: u64,
    pub interrupted: u64,
    pub retried: u64,
    pub triggers_fired: u64,
    pub triggers_skipped: u64,
    pub running: usize,
    pub queue_depth: usize,
    pub paused: bool,
    /// Records currently held by the status store, per state.
    pub statuses: StatusCounts,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) admitted: AtomicU64,
    pub(crate) rejected: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    interrupted: AtomicU64,
    pub(crate) retried: AtomicU64,
    pub(crate) triggers_fired: AtomicU64,
    pub(crate) triggers_skipped: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub(crate) fn record_terminal(&self, state: JobState) {
        match state {
            JobState::Finished => bump(&self.finished),
            JobState::Failed => bump(&self.failed),
            JobState::Canceled => bump(&self.canceled),
            JobState::Interrupted => bump(&self.interrupted),
            JobState::Queued | JobState::Running => {}
        }
    }

    pub(crate) fn snapshot(
        &self,
        running: usize,
        queue_depth: usize,
        paused: bool,
        statuses: StatusCounts,
    ) -> RealmStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RealmStats {
            admitted: load(&self.admitted),
            rejected: load(&self.rejected),
            finished: load(&self.finished),
            failed: load(&self.failed),
            canceled: load(&self.canceled),
            interrupted: load(&self.interrupted),
            retried: load(&self.retried),
            triggers_fired: load(&self.triggers_fired),
            triggers_skipped: load(&self.triggers_skipped),
            running,
            queue_depth,
            paused,
            statuses,
        }
    }
}
