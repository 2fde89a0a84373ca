//! Job definitions run by the entitlement server's job realm.

pub mod compliance;
pub mod export;
pub mod purge;

use std::sync::Arc;
use std::time::Duration;

use subman_jobs::{JobError, JobRegistry, JobStatusStore};

pub use compliance::{
    ComplianceError, ComplianceSource, ComplianceStatus, ComplianceSummary,
    InMemoryComplianceSource, REFRESH_COMPLIANCE_JOB_KEY, RefreshComplianceJob, schedule_refresh,
};
pub use export::{
    DirectoryManifestExporter, EXPORT_JOB_KEY, ExportError, ExportJob, ExportRequest,
    ExportResult, ManifestExporter,
};
pub use purge::{PURGE_JOB_STATUSES_KEY, PurgeJobStatusesJob, schedule_purge};

/// Register every bundled definition.
pub fn registry<E, C>(
    exporter: E,
    compliance: C,
    store: Arc<dyn JobStatusStore>,
    retention: Duration,
) -> Result<Arc<JobRegistry>, JobError>
where
    E: ManifestExporter + 'static,
    C: ComplianceSource + 'static,
{
    Ok(JobRegistry::builder()
        .register(ExportJob::new(exporter))?
        .register(RefreshComplianceJob::new(compliance))?
        .register(PurgeJobStatusesJob::new(store, retention))?
        .build())
}
