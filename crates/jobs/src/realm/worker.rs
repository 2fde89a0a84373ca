//! Worker loop: take a queued job, run it, record the outcome.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use subman_core::JobId;

use super::RealmInner;
use super::stats::bump;
use crate::context::{CancellationToken, JobExecutionContext};
use crate::definition::{JobExecutionError, JobOutput};
use crate::error::StoreError;
use crate::types::{JobFailure, JobState, JobStatus, Transition};

pub(super) fn run(inner: Arc<RealmInner>, index: usize) {
    debug!(realm = %inner.name(), worker = index, "worker started");
    let idle_poll = inner.config.idle_poll();

    while let Some(job_id) = inner.queue.take(idle_poll) {
        if inner.stopping.load(Ordering::SeqCst) {
            break;
        }
        run_job(&inner, job_id);
    }

    debug!(realm = %inner.name(), worker = index, "worker stopped");
}

fn run_job(inner: &RealmInner, job_id: JobId) {
    // Registered before the status turns RUNNING so cancel() always finds it.
    let token = CancellationToken::new();
    inner.running.lock().insert(job_id, token.clone());

    execute(inner, job_id, &token);

    let mut running = inner.running.lock();
    running.remove(&job_id);
    inner.idle.notify_all();
}

fn execute(inner: &RealmInner, job_id: JobId, token: &CancellationToken) {
    let status = match inner
        .store
        .cas_transition(job_id, JobState::Queued, Transition::start())
    {
        Ok(status) => status,
        Err(e @ (StoreError::StateConflict { .. } | StoreError::NotFound(_))) => {
            debug!(realm = %inner.name(), job_id = %job_id, reason = %e, "dropping queue entry");
            return;
        }
        Err(e) => {
            error!(realm = %inner.name(), job_id = %job_id, error = %e, "failed to start job");
            return;
        }
    };

    // A cancel that landed between attempts only left the flag behind.
    if status.cancel_requested {
        token.cancel();
    }

    let transition = match inner.registry.lookup(&status.job_key) {
        Ok(definition) => {
            let ctx = JobExecutionContext::new(
                status.id,
                status.job_key.clone(),
                status.attempts,
                status.arguments.clone(),
                status.metadata.clone(),
                token.clone(),
            );
            info!(
                realm = %inner.name(),
                job_id = %status.id,
                job_key = %status.job_key,
                attempt = status.attempts,
                "job started"
            );
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| definition.execute(&ctx)))
                .unwrap_or_else(|payload| {
                    Err(JobExecutionError::Unexpected(anyhow::anyhow!(
                        "job panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            outcome_transition(inner, &status, token, outcome)
        }
        // Only reachable for records created by another realm's registry.
        Err(e) => Transition::fail(JobFailure::unexpected(e.to_string())),
    };

    record(inner, &status, transition);
}

fn outcome_transition(
    inner: &RealmInner,
    status: &JobStatus,
    token: &CancellationToken,
    outcome: Result<JobOutput, JobExecutionError>,
) -> Transition {
    match outcome {
        Ok(output) => Transition::finish(output),
        Err(JobExecutionError::Canceled) => Transition::cancel(),
        Err(JobExecutionError::Failed { message, retryable: true })
            if token.is_canceled() || status.cancel_requested =>
        {
            Transition::cancel().with_note(message)
        }
        Err(JobExecutionError::Failed { message, retryable: true })
            if status.retry_policy.should_retry(status.attempts) =>
        {
            Transition::requeue(message)
        }
        Err(JobExecutionError::Failed { message, retryable }) => {
            Transition::fail(JobFailure::execution(message, retryable))
        }
        Err(JobExecutionError::Unexpected(e)) => {
            error!(
                realm = %inner.name(),
                job_id = %status.id,
                job_key = %status.job_key,
                attempt = status.attempts,
                error = %format!("{e:#}"),
                "job failed unexpectedly"
            );
            Transition::fail(JobFailure::unexpected(format!("{e:#}")))
        }
    }
}

fn record(inner: &RealmInner, status: &JobStatus, transition: Transition) {
    match inner
        .store
        .cas_transition(status.id, JobState::Running, transition)
    {
        Ok(updated) if updated.state == JobState::Queued && updated.cancel_requested => {
            cancel_requeued(inner, updated);
        }
        Ok(updated) if updated.state == JobState::Queued => {
            let delay = updated.retry_policy.delay_for_attempt(updated.attempts);
            bump(&inner.counters.retried);
            warn!(
                realm = %inner.name(),
                job_id = %updated.id,
                job_key = %updated.job_key,
                attempt = updated.attempts,
                max_attempts = updated.retry_policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = updated.history.last().and_then(|h| h.error.as_deref()).unwrap_or(""),
                "job failed, retrying"
            );
            inner.queue.push(updated.id, Some(Instant::now() + delay));
        }
        Ok(updated) => {
            info!(
                realm = %inner.name(),
                job_id = %updated.id,
                job_key = %updated.job_key,
                attempt = updated.attempts,
                state = %updated.state,
                "job completed"
            );
            inner.finished(&updated);
        }
        // Shutdown already marked it INTERRUPTED; the late outcome is dropped.
        Err(StoreError::StateConflict { actual, .. }) => {
            debug!(
                realm = %inner.name(),
                job_id = %status.id,
                state = %actual,
                "discarding outcome of job no longer running"
            );
        }
        Err(e) => {
            error!(realm = %inner.name(), job_id = %status.id, error = %e, "failed to record job outcome");
        }
    }
}

/// Cancel arrived while the failed attempt was being recorded.
fn cancel_requeued(inner: &RealmInner, status: JobStatus) {
    match inner
        .store
        .cas_transition(status.id, JobState::Queued, Transition::cancel())
    {
        Ok(canceled) => {
            info!(
                realm = %inner.name(),
                job_id = %canceled.id,
                job_key = %canceled.job_key,
                attempt = canceled.attempts,
                "job canceled instead of retrying"
            );
            inner.finished(&canceled);
        }
        // cancel() got there first.
        Err(StoreError::StateConflict { .. }) => {}
        Err(e) => {
            error!(realm = %inner.name(), job_id = %status.id, error = %e, "failed to cancel requeued job");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
