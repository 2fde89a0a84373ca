//! Worker configuration file.
//!
//! ```toml
//! export_dir = "/var/lib/subman/exports"
//!
//! [logging]
//! level = "info,subman_jobs=debug"
//! format = "pretty"
//!
//! [realm]
//! name = "async"
//! worker_threads = 4
//!
//! [[realm.scheduled]]
//! job_key = "purge_job_statuses"
//! schedule = "0 0 3 * * *"
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use subman_jobs::RealmConfig;
use subman_observability::LoggingSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub realm: RealmConfig,

    /// Where manifest exports are written.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("exports")
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            logging: LoggingSettings::default(),
            realm: RealmConfig::default(),
            export_dir: default_export_dir(),
        }
    }
}

impl WorkerConfig {
    /// Load from `path`, or use defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let source = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Self::from_toml_str(&source).with_context(|| format!("invalid config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(source: &str) -> anyhow::Result<Self> {
        let config: WorkerConfig = toml::from_str(source).context("failed to parse worker config")?;
        config.realm.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use subman_observability::LogFormat;

    #[test]
    fn no_path_means_defaults() {
        assert_eq!(WorkerConfig::load(None).unwrap(), WorkerConfig::default());
    }

    #[test]
    fn loads_nested_tables_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            export_dir = "/tmp/exports"

            [logging]
            format = "compact"

            [realm]
            name = "exports"
            worker_threads = 1

            [[realm.scheduled]]
            job_key = "purge_job_statuses"
            schedule = "every 1h"
            "#
        )
        .unwrap();

        let config = WorkerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.export_dir, PathBuf::from("/tmp/exports"));
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert_eq!(config.realm.name, "exports");
        assert_eq!(config.realm.worker_threads, 1);
        assert_eq!(config.realm.scheduled.len(), 1);
    }

    #[test]
    fn invalid_realm_section_is_rejected() {
        let err = WorkerConfig::from_toml_str("[realm]\nworker_threads = 0").unwrap_err();
        assert!(format!("{err:#}").contains("worker_threads"));
        assert!(WorkerConfig::load(Some(Path::new("/definitely/not/here.toml"))).is_err());
    }
}
