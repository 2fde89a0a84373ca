use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use tracing::{info, warn};

use subman_events::{EventBus, InMemoryEventBus};
use subman_jobs::{BusNotifier, InMemoryJobStatusStore, JobEvent, JobRealm, OWNER_KEY};
use subman_tasks::{DirectoryManifestExporter, InMemoryComplianceSource};
use subman_worker::{WorkerConfig, console};

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = WorkerConfig::load(config_path.as_deref())?;
    subman_observability::init_with(&config.logging);

    std::fs::create_dir_all(&config.export_dir)
        .with_context(|| format!("failed to create {}", config.export_dir.display()))?;

    let store = InMemoryJobStatusStore::arc();
    let registry = subman_tasks::registry(
        DirectoryManifestExporter::new(&config.export_dir),
        InMemoryComplianceSource::new(),
        store.clone(),
        config.realm.status_retention(),
    )?;

    let bus = Arc::new(InMemoryEventBus::<JobEvent>::new());
    let events = bus.subscribe();
    thread::Builder::new()
        .name("job-events".to_string())
        .spawn(move || {
            while let Ok(event) = events.recv() {
                info!(
                    job_id = %event.job_id,
                    job_key = %event.job_key,
                    state = %event.final_state,
                    owner = event.owner_metadata.get(OWNER_KEY).map(String::as_str).unwrap_or("-"),
                    "job reached terminal state"
                );
            }
        })
        .context("failed to spawn event listener")?;

    let realm = JobRealm::new(
        config.realm.clone(),
        registry,
        store,
        Arc::new(BusNotifier::new(bus)),
    );
    let triggers = realm.add_scheduled_jobs(&config.realm.scheduled)?;
    realm.start()?;
    info!(
        realm = %realm.name(),
        jobs = ?realm.registry().keys(),
        triggers = triggers.len(),
        "worker ready; type `help` for commands"
    );

    if let Err(e) = console::run(&realm, io::stdin().lock(), io::stdout()) {
        warn!(error = %e, "console closed");
    }

    let report = realm.shutdown();
    info!(
        completed_in_grace = report.completed_in_grace,
        interrupted = report.interrupted.len(),
        "worker stopped"
    );
    Ok(())
}
