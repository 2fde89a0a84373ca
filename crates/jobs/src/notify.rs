//! Terminal-state notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use subman_core::JobId;
use subman_events::EventBus;

use crate::arguments::JobMetadata;
use crate::types::{JobState, JobStatus};

/// Published once per terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub job_key: String,
    pub final_state: JobState,
    pub owner_metadata: JobMetadata,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn from_status(status: &JobStatus) -> Self {
        Self {
            job_id: status.id,
            job_key: status.job_key.clone(),
            final_state: status.state,
            owner_metadata: status.metadata.clone(),
            occurred_at: status.finished_at.unwrap_or(status.updated_at),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Receives terminal job events. Delivery is at-least-once.
pub trait JobNotifier: Send + Sync {
    fn notify(&self, event: &JobEvent) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl JobNotifier for NoopNotifier {
    fn notify(&self, _event: &JobEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Publishes job events on an [`EventBus`].
#[derive(Debug)]
pub struct BusNotifier<B> {
    bus: B,
}

impl<B> BusNotifier<B>
where
    B: EventBus<JobEvent>,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> JobNotifier for BusNotifier<B>
where
    B: EventBus<JobEvent>,
{
    fn notify(&self, event: &JobEvent) -> Result<(), NotifyError> {
        self.bus
            .publish(event.clone())
            .map_err(|e| NotifyError(e.to_string()))
    }
}

const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Notify with a bounded number of attempts; the last failure is logged and dropped.
pub(crate) fn deliver(notifier: &dyn JobNotifier, event: &JobEvent) {
    let mut last_error = None;
    for _ in 0..MAX_DELIVERY_ATTEMPTS {
        match notifier.notify(event) {
            Ok(()) => return,
            Err(e) => last_error = Some(e),
        }
    }
    if let Some(error) = last_error {
        warn!(
            job_id = %event.job_id,
            job_key = %event.job_key,
            state = %event.final_state,
            error = %error,
            "dropping job notification after {MAX_DELIVERY_ATTEMPTS} attempts"
        );
    }
}
