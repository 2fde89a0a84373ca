//! Realm configuration.
//!
//! Every field has a default so a partial TOML table (or none at all) yields a
//! working realm.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::trigger::Schedule;
use crate::types::{BackoffStrategy, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealmConfig {
    #[serde(default = "default_name")]
    pub name: String,

    /// Groups this realm serves. The first is the default for requests
    /// that do not name one.
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,

    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default = "default_shutdown_grace_period_ms")]
    pub shutdown_grace_period_ms: u64,

    /// Recurring trigger check interval.
    #[serde(default = "default_trigger_tick_ms")]
    pub trigger_tick_ms: u64,

    /// Upper bound on how long an idle worker sleeps before re-checking the queue.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// How long terminal statuses are kept before `purge_expired` removes them.
    #[serde(default = "default_status_retention_hours")]
    pub status_retention_hours: u64,

    /// Re-enqueue stored `QUEUED` jobs and interrupt orphaned `RUNNING` ones on start.
    #[serde(default = "default_true")]
    pub recover_on_start: bool,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub scheduled: Vec<ScheduledJobSettings>,
}

fn default_name() -> String {
    "async".to_string()
}

fn default_groups() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_worker_threads() -> usize {
    4
}

fn default_shutdown_grace_period_ms() -> u64 {
    30_000
}

fn default_trigger_tick_ms() -> u64 {
    1_000
}

fn default_idle_poll_ms() -> u64 {
    500
}

fn default_status_retention_hours() -> u64 {
    24 * 7
}

fn default_true() -> bool {
    true
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            groups: default_groups(),
            worker_threads: default_worker_threads(),
            shutdown_grace_period_ms: default_shutdown_grace_period_ms(),
            trigger_tick_ms: default_trigger_tick_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            status_retention_hours: default_status_retention_hours(),
            recover_on_start: true,
            retry: RetrySettings::default(),
            scheduled: Vec::new(),
        }
    }
}

/// Default retry policy for requests that do not carry their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            strategy: BackoffStrategy::default(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            strategy: self.strategy,
            jitter: self.jitter,
        }
    }
}

/// A recurring job declared in configuration.
///
/// ```toml
/// [[realm.scheduled]]
/// job_key = "purge_job_statuses"
/// schedule = "0 0 3 * * *"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJobSettings {
    pub job_key: String,
    /// Cron expression or `every <n><unit>`.
    pub schedule: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ScheduledJobSettings {
    pub fn new(job_key: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            job_key: job_key.into(),
            schedule: schedule.into(),
            group: None,
            name: None,
        }
    }

    pub fn parsed_schedule(&self) -> Result<Schedule, crate::error::JobError> {
        self.schedule.parse()
    }
}

impl RealmConfig {
    pub fn from_toml_str(source: &str) -> anyhow::Result<Self> {
        let config: RealmConfig =
            toml::from_str(source).context("failed to parse realm configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read realm config {}", path.display()))?;
        Self::from_toml_str(&source).with_context(|| format!("invalid realm config {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            bail!("realm name must not be empty");
        }
        if self.worker_threads == 0 {
            bail!("worker_threads must be at least 1");
        }
        if self.groups.is_empty() {
            bail!("realm {} must serve at least one group", self.name);
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            bail!("retry.jitter must be within 0.0..=1.0");
        }
        if self.trigger_tick_ms == 0 || self.idle_poll_ms == 0 {
            bail!("trigger_tick_ms and idle_poll_ms must be positive");
        }
        for entry in &self.scheduled {
            entry
                .parsed_schedule()
                .with_context(|| format!("scheduled job {}", entry.job_key))?;
            if let Some(group) = &entry.group {
                if !self.groups.contains(group) {
                    bail!("scheduled job {} names unknown group {group}", entry.job_key);
                }
            }
        }
        Ok(())
    }

    pub fn default_group(&self) -> &str {
        self.groups.first().map(String::as_str).unwrap_or("default")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn trigger_tick(&self) -> Duration {
        Duration::from_millis(self.trigger_tick_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn status_retention(&self) -> Duration {
        Duration::from_secs(self.status_retention_hours.saturating_mul(3600))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_trigger_tick(mut self, tick: Duration) -> Self {
        self.trigger_tick_ms = tick.as_millis().max(1) as u64;
        self
    }

    pub fn with_idle_poll(mut self, poll: Duration) -> Self {
        self.idle_poll_ms = poll.as_millis().max(1) as u64;
        self
    }

    pub fn with_status_retention_hours(mut self, hours: u64) -> Self {
        self.status_retention_hours = hours;
        self
    }

    pub fn with_recover_on_start(mut self, recover: bool) -> Self {
        self.recover_on_start = recover;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_retention_saturates() {
        let config = RealmConfig::default().with_status_retention_hours(u64::MAX);
        assert_eq!(config.status_retention(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = RealmConfig::from_toml_str("").unwrap();
        assert_eq!(config, RealmConfig::default());
        assert_eq!(config.default_group(), "default");
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.status_retention(), Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn parses_partial_document() {
        let config = RealmConfig::from_toml_str(
            r#"
            name = "exports"
            groups = ["export", "maintenance"]
            worker_threads = 2

            [retry]
            max_attempts = 5
            strategy = "linear"

            [[scheduled]]
            job_key = "purge_job_statuses"
            schedule = "0 0 3 * * *"
            group = "maintenance"

            [[scheduled]]
            job_key = "refresh_compliance"
            schedule = "every 10m"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "exports");
        assert_eq!(config.default_group(), "export");
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.scheduled.len(), 2);
        assert_eq!(config.scheduled[0].group.as_deref(), Some("maintenance"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(RealmConfig::from_toml_str("worker_threads = 0").is_err());
        assert!(RealmConfig::from_toml_str("groups = []").is_err());
        assert!(RealmConfig::from_toml_str("[retry]\nmax_attempts = 0").is_err());

        let bad_cron = r#"
            [[scheduled]]
            job_key = "x"
            schedule = "every day at noon"
        "#;
        assert!(RealmConfig::from_toml_str(bad_cron).is_err());

        let bad_group = r#"
            [[scheduled]]
            job_key = "x"
            schedule = "every 1s"
            group = "nowhere"
        "#;
        assert!(RealmConfig::from_toml_str(bad_group).is_err());
    }
}
