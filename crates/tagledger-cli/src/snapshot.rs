//! Offline repository backed by a JSON file.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tagledger_core::record::{Record, TimeWindow};
use tagledger_core::repository::{RecordRepository, RepositoryError, UpsertOutcome, UpsertResult};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    /// Fixed clock in unix seconds; the system clock is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_time: Option<i64>,
    #[serde(default)]
    records: Vec<Record>,
}

/// Each call re-reads the file so external edits are picked up while
/// following.
pub struct SnapshotRepository {
    path: PathBuf,
}

impl SnapshotRepository {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<SnapshotFile, RepositoryError> {
        if !self.path.exists() {
            return Ok(SnapshotFile::default());
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|err| RepositoryError::Other(format!("{}: {err}", self.path.display())))?;
        if text.trim().is_empty() {
            return Ok(SnapshotFile::default());
        }
        serde_json::from_str(&text)
            .map_err(|err| RepositoryError::Decode(format!("{}: {err}", self.path.display())))
    }

    fn save(&self, snapshot: &SnapshotFile) -> Result<(), RepositoryError> {
        let body = serde_json::to_string_pretty(snapshot)
            .map_err(|err| RepositoryError::Other(err.to_string()))?;
        fs::write(&self.path, format!("{body}\n"))
            .map_err(|err| RepositoryError::Other(format!("{}: {err}", self.path.display())))
    }
}

impl RecordRepository for SnapshotRepository {
    fn list_records(&mut self, window: &TimeWindow) -> Result<Vec<Record>, RepositoryError> {
        let snapshot = self.load()?;
        Ok(snapshot
            .records
            .into_iter()
            .filter(|record| window.touches(record))
            .collect())
    }

    fn upsert_records(&mut self, records: &[Record]) -> Result<Vec<UpsertResult>, RepositoryError> {
        let mut snapshot = self.load()?;
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            if record.key.trim().is_empty() {
                results.push(UpsertResult {
                    key: record.key.clone(),
                    outcome: UpsertOutcome::Rejected {
                        reason: "empty key".to_string(),
                    },
                });
                continue;
            }
            match snapshot.records.iter_mut().find(|stored| stored.key == record.key) {
                Some(stored) => *stored = record.clone(),
                None => snapshot.records.push(record.clone()),
            }
            results.push(UpsertResult {
                key: record.key.clone(),
                outcome: UpsertOutcome::Accepted {
                    modified_at: record.modified_at,
                },
            });
        }
        self.save(&snapshot)?;
        debug!(path = %self.path.display(), count = records.len(), "snapshot updated");
        Ok(results)
    }

    fn server_time(&mut self) -> Result<DateTime<Utc>, RepositoryError> {
        match self.load()?.server_time {
            Some(secs) => Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| RepositoryError::Decode(format!("bad server_time {secs}"))),
            None => Ok(Utc::now()),
        }
    }
}
