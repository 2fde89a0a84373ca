//! Consumer manifest export.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use subman_jobs::{
    AsyncJob, JobBuilder, JobExecutionContext, JobExecutionError, JobOutput, unique_by_argument,
};

pub const EXPORT_JOB_KEY: &str = "export_job";

pub const CONSUMER_KEY: &str = "consumer_uuid";
pub const CDN_LABEL: &str = "cdn_label";
pub const WEBAPP_PREFIX: &str = "webapp_prefix";
pub const API_URL: &str = "api_url";
pub const EXTENSION_DATA: &str = "extension_data";

/// Everything the exporter needs to build one manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub consumer_uuid: String,
    pub cdn_label: Option<String>,
    pub webapp_prefix: Option<String>,
    pub api_url: Option<String>,
    #[serde(default)]
    pub extension_data: BTreeMap<String, String>,
}

impl ExportRequest {
    pub fn new(consumer_uuid: impl Into<String>) -> Self {
        Self {
            consumer_uuid: consumer_uuid.into(),
            cdn_label: None,
            webapp_prefix: None,
            api_url: None,
            extension_data: BTreeMap::new(),
        }
    }

    /// Build a job for this export, owned by `owner_key`.
    ///
    /// At most one export per consumer is active at a time.
    pub fn into_job(self, owner_key: &str, log_level: Option<&str>) -> JobBuilder {
        let mut builder = JobBuilder::for_job(EXPORT_JOB_KEY)
            .name(format!("export-{}", Uuid::now_v7()))
            .argument(CONSUMER_KEY, self.consumer_uuid)
            .argument(CDN_LABEL, self.cdn_label)
            .argument(WEBAPP_PREFIX, self.webapp_prefix)
            .argument(API_URL, self.api_url)
            .json_argument(EXTENSION_DATA, &self.extension_data)
            .owner(owner_key)
            .constraint(unique_by_argument(CONSUMER_KEY));
        if let Some(level) = log_level {
            builder = builder.log_level(level);
        }
        builder
    }
}

/// Stored manifest reference returned as the job result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    pub consumer_uuid: String,
    pub export_id: String,
    pub href: String,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("consumer {0} does not exist")]
    ConsumerNotFound(String),

    /// Backing storage is temporarily unreachable.
    #[error("manifest storage unavailable: {0}")]
    Unavailable(String),

    #[error("failed to write manifest: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode manifest: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ExportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExportError::Unavailable(_))
    }
}

impl From<ExportError> for JobExecutionError {
    fn from(err: ExportError) -> Self {
        if err.is_transient() {
            JobExecutionError::retryable(err.to_string())
        } else {
            JobExecutionError::fatal(err.to_string())
        }
    }
}

/// Generates and stores consumer manifests.
pub trait ManifestExporter: Send + Sync {
    fn generate_and_store(&self, request: &ExportRequest) -> Result<ExportResult, ExportError>;
}

pub struct ExportJob<E> {
    exporter: E,
}

impl<E: ManifestExporter> ExportJob<E> {
    pub fn new(exporter: E) -> Self {
        Self { exporter }
    }

    fn read_request(ctx: &JobExecutionContext) -> Result<ExportRequest, JobExecutionError> {
        let args = ctx.arguments();
        let extension_data = if args.contains(EXTENSION_DATA) {
            args.get_as(EXTENSION_DATA)?
        } else {
            BTreeMap::new()
        };
        Ok(ExportRequest {
            consumer_uuid: args.get_str(CONSUMER_KEY)?.to_string(),
            cdn_label: args.get_opt_str(CDN_LABEL)?.map(str::to_string),
            webapp_prefix: args.get_opt_str(WEBAPP_PREFIX)?.map(str::to_string),
            api_url: args.get_opt_str(API_URL)?.map(str::to_string),
            extension_data,
        })
    }
}

impl<E: ManifestExporter + 'static> AsyncJob for ExportJob<E> {
    fn key(&self) -> &str {
        EXPORT_JOB_KEY
    }

    fn execute(&self, ctx: &JobExecutionContext) -> Result<JobOutput, JobExecutionError> {
        let request = Self::read_request(ctx)?;
        ctx.logger()
            .info(&format!("starting export for consumer {}", request.consumer_uuid));

        let result = self.exporter.generate_and_store(&request)?;

        ctx.logger().info(&format!("export complete: {}", result.href));
        let output = serde_json::to_value(&result).map_err(anyhow_error)?;
        Ok(Some(output))
    }
}

fn anyhow_error(err: serde_json::Error) -> JobExecutionError {
    JobExecutionError::Unexpected(err.into())
}

/// Writes manifests as JSON files under `<root>/<consumer_uuid>/`.
#[derive(Debug, Clone)]
pub struct DirectoryManifestExporter {
    root: PathBuf,
}

#[derive(Serialize)]
struct ManifestDocument<'a> {
    export_id: &'a str,
    exported_at: DateTime<Utc>,
    request: &'a ExportRequest,
}

impl DirectoryManifestExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ManifestExporter for DirectoryManifestExporter {
    fn generate_and_store(&self, request: &ExportRequest) -> Result<ExportResult, ExportError> {
        let consumer = request.consumer_uuid.trim();
        if consumer.is_empty() || consumer.contains(['/', '\\']) || consumer.starts_with('.') {
            return Err(ExportError::ConsumerNotFound(request.consumer_uuid.clone()));
        }
        if !self.root.is_dir() {
            return Err(ExportError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        let export_id = Uuid::now_v7().to_string();
        let exported_at = Utc::now();
        let dir = self.root.join(consumer);
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{export_id}.json"));
        let document = ManifestDocument {
            export_id: &export_id,
            exported_at,
            request,
        };
        fs::write(&path, serde_json::to_vec_pretty(&document)?)?;
        debug!(consumer_uuid = %consumer, path = %path.display(), "manifest written");

        Ok(ExportResult {
            consumer_uuid: consumer.to_string(),
            export_id,
            href: path.display().to_string(),
            exported_at,
        })
    }
}
