//! FIFO dispatch queue shared by the worker pool.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use subman_core::JobId;

#[derive(Debug, Clone, Copy)]
struct Entry {
    job_id: JobId,
    /// Retry backoff: not dispatched before this instant.
    not_before: Option<Instant>,
}

impl Entry {
    fn is_due(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: VecDeque<Entry>,
    paused: bool,
    closed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct DispatchQueue {
    state: Mutex<State>,
    ready: Condvar,
}

impl DispatchQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a job. Ignored once the queue is closed.
    pub(crate) fn push(&self, job_id: JobId, not_before: Option<Instant>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.entries.push_back(Entry { job_id, not_before });
        drop(state);
        self.ready.notify_one();
    }

    pub(crate) fn remove(&self, job_id: JobId) -> bool {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.job_id != job_id);
        before != state.entries.len()
    }

    pub(crate) fn contains(&self, job_id: JobId) -> bool {
        self.state.lock().entries.iter().any(|e| e.job_id == job_id)
    }

    pub(crate) fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub(crate) fn unpause(&self) {
        self.state.lock().paused = false;
        self.ready.notify_all();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Stop handing out work and wake every waiting worker.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Block until the first due entry can be dispatched.
    ///
    /// Returns `None` once the queue is closed. `max_wait` bounds each sleep
    /// so backoff deadlines are noticed without a dedicated wake-up.
    pub(crate) fn take(&self, max_wait: Duration) -> Option<JobId> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }

            let now = Instant::now();
            let mut wait = max_wait;
            if !state.paused {
                if let Some(index) = state.entries.iter().position(|e| e.is_due(now)) {
                    return state.entries.remove(index).map(|e| e.job_id);
                }
                // Only backoff entries left: sleep until the earliest is due.
                if let Some(earliest) = state.entries.iter().filter_map(|e| e.not_before).min() {
                    wait = wait.min(earliest.saturating_duration_since(now));
                }
            }

            self.ready.wait_for(&mut state, wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const POLL: Duration = Duration::from_millis(20);

    #[test]
    fn hands_out_entries_in_fifo_order() {
        let queue = DispatchQueue::new();
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());
        queue.push(a, None);
        queue.push(b, None);
        queue.push(c, None);

        assert_eq!(queue.take(POLL), Some(a));
        assert_eq!(queue.take(POLL), Some(b));
        assert_eq!(queue.take(POLL), Some(c));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn backoff_entries_wait_until_due() {
        let queue = DispatchQueue::new();
        let delayed = JobId::new();
        let ready = JobId::new();
        queue.push(delayed, Some(Instant::now() + Duration::from_millis(60)));
        queue.push(ready, None);

        assert_eq!(queue.take(POLL), Some(ready));
        let started = Instant::now();
        assert_eq!(queue.take(POLL), Some(delayed));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn removed_entries_are_not_dispatched() {
        let queue = DispatchQueue::new();
        let (a, b) = (JobId::new(), JobId::new());
        queue.push(a, None);
        queue.push(b, None);

        assert!(queue.remove(a));
        assert!(!queue.contains(a));
        assert_eq!(queue.take(POLL), Some(b));
    }

    #[test]
    fn paused_queue_holds_entries_until_unpaused() {
        let queue = Arc::new(DispatchQueue::new());
        queue.pause();
        let id = JobId::new();
        queue.push(id, None);

        let worker = {
            let queue = queue.clone();
            thread::spawn(move || queue.take(POLL))
        };
        thread::sleep(Duration::from_millis(80));
        assert!(!worker.is_finished());
        assert_eq!(queue.len(), 1);

        queue.unpause();
        assert_eq!(worker.join().unwrap(), Some(id));
    }

    #[test]
    fn close_releases_waiting_workers() {
        let queue = Arc::new(DispatchQueue::new());
        let worker = {
            let queue = queue.clone();
            thread::spawn(move || queue.take(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(30));
        queue.close();
        assert_eq!(worker.join().unwrap(), None);

        queue.push(JobId::new(), None);
        assert_eq!(queue.len(), 0);
    }
}
