use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::commit::{CommitReport, CommitStatus};
use crate::record::Record;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to write audit log: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize audit event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One applied mutation, with enough state to undo it by hand.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub action: String,
    pub key: String,
    pub before: Option<Record>,
    pub after: Record,
}

pub fn audit_log_path(home_dir: &Path) -> PathBuf {
    home_dir.join("audit.log")
}

pub fn append_audit_event(home_dir: &Path, event: &AuditEvent) -> Result<(), AuditError> {
    fs::create_dir_all(home_dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(audit_log_path(home_dir))?;
    let line = serde_json::to_string(event)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Log every change the commit report marks as applied. Returns the number of
/// events written.
pub fn record_applied(
    home_dir: &Path,
    action: &str,
    changes: &[(Option<Record>, Record)],
    report: &CommitReport,
    at: DateTime<Utc>,
) -> Result<usize, AuditError> {
    let timestamp = at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut written = 0;
    for (before, after) in changes {
        if !matches!(report.status_of(&after.key), Some(CommitStatus::Applied { .. })) {
            continue;
        }
        append_audit_event(
            home_dir,
            &AuditEvent {
                timestamp: timestamp.clone(),
                action: action.to_string(),
                key: after.key.clone(),
                before: before.clone(),
                after: after.clone(),
            },
        )?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{CommitEntry, Mode};
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn only_applied_changes_are_logged() {
        let temp = TempDir::new().expect("tempdir");
        let at = Utc.with_ymd_and_hms(2025, 3, 12, 9, 0, 0).unwrap();
        let record = |key: &str| Record {
            key: key.to_string(),
            description: "x".to_string(),
            t_start: at,
            t_stop: at,
            modified_at: at,
            hidden: false,
        };
        let report = CommitReport {
            mode: Mode::Apply,
            entries: vec![
                CommitEntry {
                    key: "a".to_string(),
                    status: CommitStatus::Applied { modified_at: at },
                },
                CommitEntry {
                    key: "b".to_string(),
                    status: CommitStatus::Failed {
                        reason: "nope".to_string(),
                    },
                },
            ],
        };
        let changes = vec![(Some(record("a")), record("a")), (None, record("b"))];
        let written = record_applied(temp.path(), "repair", &changes, &report, at).expect("audit");
        assert_eq!(written, 1);
        let text = fs::read_to_string(audit_log_path(temp.path())).expect("read");
        assert_eq!(text.lines().count(), 1);
        let event: serde_json::Value = serde_json::from_str(text.trim()).expect("json");
        assert_eq!(event["key"], "a");
        assert_eq!(event["action"], "repair");
    }
}
