//! Operator commands read from stdin.

use std::io::{self, BufRead, Write};

use serde::Serialize;
use thiserror::Error;

use subman_jobs::{JobError, JobId, JobRealm};
use subman_tasks::{ExportRequest, schedule_refresh};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pause,
    Unpause,
    Status(JobId),
    Cancel(JobId),
    Triggers,
    Stats,
    Export { consumer_uuid: String, owner_key: String },
    Refresh { owner_key: String },
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid job id `{0}`")]
    InvalidId(String),
}

const HELP: &str = "commands: pause | unpause | status <job-id> | cancel <job-id> | triggers | stats \
                    | export <consumer-uuid> <owner-key> | refresh <owner-key> | help | quit";

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match (name, args.as_slice()) {
            ("pause", []) => Command::Pause,
            ("unpause" | "resume", []) => Command::Unpause,
            ("status", [id]) => Command::Status(parse_id(id)?),
            ("status", _) => return Err(CommandError::Usage("status <job-id>")),
            ("cancel", [id]) => Command::Cancel(parse_id(id)?),
            ("cancel", _) => return Err(CommandError::Usage("cancel <job-id>")),
            ("triggers", []) => Command::Triggers,
            ("stats", []) => Command::Stats,
            ("export", [consumer, owner]) => Command::Export {
                consumer_uuid: consumer.to_string(),
                owner_key: owner.to_string(),
            },
            ("export", _) => return Err(CommandError::Usage("export <consumer-uuid> <owner-key>")),
            ("refresh", [owner]) => Command::Refresh {
                owner_key: owner.to_string(),
            },
            ("refresh", _) => return Err(CommandError::Usage("refresh <owner-key>")),
            ("help", _) => Command::Help,
            ("quit" | "exit", []) => Command::Quit,
            _ => return Err(CommandError::Unknown(line.trim().to_string())),
        };
        Ok(Some(command))
    }
}

fn parse_id(raw: &str) -> Result<JobId, CommandError> {
    raw.parse()
        .map_err(|_| CommandError::InvalidId(raw.to_string()))
}

fn render<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unprintable: {e}>"))
}

/// Run a command against the realm and describe the outcome.
pub fn execute(realm: &JobRealm, command: &Command) -> Result<String, JobError> {
    let reply = match command {
        Command::Pause => {
            realm.pause();
            "paused".to_string()
        }
        Command::Unpause => {
            realm.unpause();
            "resumed".to_string()
        }
        Command::Status(id) => render(&realm.get_status(*id)?),
        Command::Cancel(id) => {
            let status = realm.cancel(*id)?;
            let note = if status.cancel_requested && status.is_active() {
                " (cancel requested)"
            } else {
                ""
            };
            format!("{id}: {}{note}", status.state)
        }
        Command::Triggers => render(&realm.triggers()),
        Command::Stats => render(&realm.stats()),
        Command::Export {
            consumer_uuid,
            owner_key,
        } => {
            let request = ExportRequest::new(consumer_uuid.as_str())
                .into_job(owner_key, None)
                .build()?;
            format!("queued export {}", realm.submit(request)?)
        }
        Command::Refresh { owner_key } => {
            let request = schedule_refresh(owner_key).build()?;
            format!("queued compliance refresh {}", realm.submit(request)?)
        }
        Command::Help => HELP.to_string(),
        Command::Quit => "bye".to_string(),
    };
    Ok(reply)
}

/// Read commands until `quit` or end of input.
pub fn run<R: BufRead, W: Write>(realm: &JobRealm, input: R, mut output: W) -> io::Result<()> {
    for line in input.lines() {
        let line = line?;
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                writeln!(output, "{e}")?;
                continue;
            }
        };

        match execute(realm, &command) {
            Ok(reply) => writeln!(output, "{reply}")?,
            Err(e) => writeln!(output, "error: {e}")?,
        }
        output.flush()?;

        if command == Command::Quit {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use subman_jobs::{InMemoryJobStatusStore, NoopNotifier, RealmConfig};
    use subman_tasks::{DirectoryManifestExporter, InMemoryComplianceSource, registry};

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("  pause ").unwrap(), Some(Command::Pause));
        assert_eq!(Command::parse("resume").unwrap(), Some(Command::Unpause));
        assert_eq!(Command::parse("").unwrap(), None);
        assert_eq!(
            Command::parse("export c-1 acme").unwrap(),
            Some(Command::Export {
                consumer_uuid: "c-1".to_string(),
                owner_key: "acme".to_string(),
            })
        );

        let id = JobId::new();
        assert_eq!(
            Command::parse(&format!("status {id}")).unwrap(),
            Some(Command::Status(id))
        );
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(
            Command::parse("status"),
            Err(CommandError::Usage("status <job-id>"))
        );
        assert_eq!(
            Command::parse("status nope"),
            Err(CommandError::InvalidId("nope".to_string()))
        );
        assert!(matches!(
            Command::parse("reboot now"),
            Err(CommandError::Unknown(_))
        ));
    }

    fn realm(dir: &std::path::Path) -> JobRealm {
        let store = InMemoryJobStatusStore::arc();
        let registry = registry(
            DirectoryManifestExporter::new(dir),
            InMemoryComplianceSource::new(),
            store.clone(),
            Duration::from_secs(3600),
        )
        .unwrap();
        JobRealm::new(RealmConfig::default(), registry, store, Arc::new(NoopNotifier))
    }

    #[test]
    fn cancel_reports_the_resulting_state() {
        let dir = tempfile::tempdir().unwrap();
        let realm = realm(dir.path());

        let queued = execute(
            &realm,
            &Command::Export {
                consumer_uuid: "c-1".to_string(),
                owner_key: "acme".to_string(),
            },
        )
        .unwrap();
        let id: JobId = queued.trim_start_matches("queued export ").parse().unwrap();

        assert_eq!(
            execute(&realm, &Command::Cancel(id)).unwrap(),
            format!("{id}: CANCELED")
        );
        assert!(matches!(
            execute(&realm, &Command::Cancel(JobId::new())),
            Err(JobError::NotFound(_))
        ));
    }

    #[test]
    fn session_runs_until_quit() {
        let dir = tempfile::tempdir().unwrap();
        let realm = realm(dir.path());

        let input = "pause\nexport c-1 acme\nexport c-1 acme\nbogus\nstats\nquit\npause\n";
        let mut output = Vec::new();
        run(&realm, input.as_bytes(), &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();

        assert!(output.starts_with("paused\nqueued export "));
        assert!(output.contains("error: job rejected"));
        assert!(output.contains("unknown command `bogus`"));
        assert!(output.contains("\"admitted\": 1"));
        assert!(output.trim_end().ends_with("bye"));
        assert_eq!(realm.stats().queue_depth, 1);
    }
}
