//! The final, elidable step shared by every mutating pipeline.
//!
//! Repair and import build their plans identically for dry and real runs and
//! only differ in the [`Mode`] handed to [`commit`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::record::Record;
use crate::repository::{RecordRepository, RepositoryError, UpsertOutcome};

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    DryRun,
    Apply,
}

impl Mode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            Mode::DryRun
        } else {
            Mode::Apply
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::DryRun => "dry_run",
            Mode::Apply => "apply",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitStatus {
    /// Not sent (dry run).
    Pending,
    Applied {
        #[serde(with = "chrono::serde::ts_seconds")]
        modified_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitEntry {
    pub key: String,
    pub status: CommitStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitReport {
    pub mode: Mode,
    pub entries: Vec<CommitEntry>,
}

impl CommitReport {
    pub fn applied(&self) -> impl Iterator<Item = &CommitEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.status, CommitStatus::Applied { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = &CommitEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.status, CommitStatus::Failed { .. }))
    }

    pub fn applied_count(&self) -> usize {
        self.applied().count()
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count() > 0
    }

    pub fn status_of(&self, key: &str) -> Option<&CommitStatus> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.status)
    }
}

/// Send `records` to the repository in one call, or record them as pending.
///
/// An outright repository failure is returned as an error and nothing is
/// reported applied. Otherwise each record's own outcome is reported, with the
/// timestamp the repository actually stored.
pub fn commit<R: RecordRepository + ?Sized>(
    repo: &mut R,
    records: &[Record],
    mode: Mode,
) -> Result<CommitReport, RepositoryError> {
    if mode == Mode::DryRun || records.is_empty() {
        return Ok(CommitReport {
            mode,
            entries: records
                .iter()
                .map(|record| CommitEntry {
                    key: record.key.clone(),
                    status: CommitStatus::Pending,
                })
                .collect(),
        });
    }

    debug!(count = records.len(), "sending records to repository");
    let results = repo.upsert_records(records)?;
    let mut by_key: HashMap<String, UpsertOutcome> = results
        .into_iter()
        .map(|result| (result.key, result.outcome))
        .collect();

    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        let status = match by_key.remove(&record.key) {
            Some(UpsertOutcome::Accepted { modified_at }) => CommitStatus::Applied { modified_at },
            Some(UpsertOutcome::Rejected { reason }) => {
                warn!(key = %record.key, %reason, "repository rejected record");
                CommitStatus::Failed { reason }
            }
            None => {
                warn!(key = %record.key, "repository returned no result for record");
                CommitStatus::Failed {
                    reason: "no result returned by repository".to_string(),
                }
            }
        };
        entries.push(CommitEntry {
            key: record.key.clone(),
            status,
        });
    }
    Ok(CommitReport { mode, entries })
}
