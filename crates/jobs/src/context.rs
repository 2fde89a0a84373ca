//! Per-run execution state handed to a job definition.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Level;

use subman_core::JobId;

use crate::arguments::{JobArguments, JobMetadata, LOG_LEVEL_KEY};
use crate::definition::JobExecutionError;

/// Cooperative cancellation flag shared between the realm and a running job.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    job_id: JobId,
    job_key: String,
    attempt: u32,
    arguments: JobArguments,
    metadata: JobMetadata,
    cancel: CancellationToken,
    logger: JobLogger,
}

impl JobExecutionContext {
    pub fn new(
        job_id: JobId,
        job_key: impl Into<String>,
        attempt: u32,
        arguments: JobArguments,
        metadata: JobMetadata,
        cancel: CancellationToken,
    ) -> Self {
        let job_key = job_key.into();
        let logger = JobLogger::new(job_id, job_key.clone(), &metadata);
        Self {
            job_id,
            job_key,
            attempt,
            arguments,
            metadata,
            cancel,
            logger,
        }
    }

    /// Context outside any realm, for driving a definition directly.
    pub fn detached(job_key: impl Into<String>, arguments: JobArguments) -> Self {
        Self::new(
            JobId::new(),
            job_key,
            1,
            arguments,
            JobMetadata::new(),
            CancellationToken::new(),
        )
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    /// 1-based attempt number of this run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn arguments(&self) -> &JobArguments {
        &self.arguments
    }

    pub fn metadata(&self) -> &JobMetadata {
        &self.metadata
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// `Err(Canceled)` once cancellation was requested. Call between units of work.
    pub fn checkpoint(&self) -> Result<(), JobExecutionError> {
        if self.is_canceled() {
            Err(JobExecutionError::Canceled)
        } else {
            Ok(())
        }
    }

    pub fn logger(&self) -> &JobLogger {
        &self.logger
    }
}

/// Log sink for job progress. Drops messages below the job's `log_level`.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: JobId,
    job_key: String,
    min_level: Level,
}

impl JobLogger {
    fn new(job_id: JobId, job_key: String, metadata: &JobMetadata) -> Self {
        let min_level = metadata
            .get(LOG_LEVEL_KEY)
            .and_then(|level| level.parse::<Level>().ok())
            .unwrap_or(Level::TRACE);
        Self {
            job_id,
            job_key,
            min_level,
        }
    }

    pub fn min_level(&self) -> Level {
        self.min_level
    }

    /// Whether a message at `level` passes the job's threshold.
    pub fn enabled(&self, level: Level) -> bool {
        // `Level` orders by verbosity: TRACE > DEBUG > ... > ERROR.
        level <= self.min_level
    }

    pub fn trace(&self, message: &str) {
        if self.enabled(Level::TRACE) {
            tracing::trace!(job_id = %self.job_id, job_key = %self.job_key, "{message}");
        }
    }

    pub fn debug(&self, message: &str) {
        if self.enabled(Level::DEBUG) {
            tracing::debug!(job_id = %self.job_id, job_key = %self.job_key, "{message}");
        }
    }

    pub fn info(&self, message: &str) {
        if self.enabled(Level::INFO) {
            tracing::info!(job_id = %self.job_id, job_key = %self.job_key, "{message}");
        }
    }

    pub fn warn(&self, message: &str) {
        if self.enabled(Level::WARN) {
            tracing::warn!(job_id = %self.job_id, job_key = %self.job_key, "{message}");
        }
    }

    pub fn error(&self, message: &str) {
        if self.enabled(Level::ERROR) {
            tracing::error!(job_id = %self.job_id, job_key = %self.job_key, "{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_level(level: &str) -> JobExecutionContext {
        let mut metadata = JobMetadata::new();
        metadata.insert(LOG_LEVEL_KEY.to_string(), level.to_string());
        JobExecutionContext::new(
            JobId::new(),
            "export",
            1,
            JobArguments::default(),
            metadata,
            CancellationToken::new(),
        )
    }

    #[test]
    fn log_level_metadata_sets_threshold() {
        let logger = ctx_with_level("warn").logger().clone();
        assert!(logger.enabled(Level::ERROR));
        assert!(logger.enabled(Level::WARN));
        assert!(!logger.enabled(Level::INFO));
        assert!(!logger.enabled(Level::DEBUG));
    }

    #[test]
    fn unknown_level_allows_everything() {
        let logger = ctx_with_level("chatty").logger().clone();
        assert_eq!(logger.min_level(), Level::TRACE);
        assert!(logger.enabled(Level::TRACE));
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let ctx = ctx_with_level("info");
        assert!(ctx.checkpoint().is_ok());

        ctx.cancellation().cancel();
        assert!(ctx.is_canceled());
        assert!(matches!(ctx.checkpoint(), Err(JobExecutionError::Canceled)));
    }

    #[test]
    fn clones_share_the_token() {
        let token = CancellationToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_canceled());
    }
}
