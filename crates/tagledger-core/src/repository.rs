use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{Record, TimeWindow};

/// Failure reported by a repository implementation. The engine treats every
/// variant the same way; the split only improves the message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Repository transport error: {0}")]
    Transport(String),
    #[error("Repository returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Repository response could not be decoded: {0}")]
    Decode(String),
    #[error("Repository error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Accepted {
        #[serde(with = "chrono::serde::ts_seconds")]
        modified_at: DateTime<Utc>,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertResult {
    pub key: String,
    pub outcome: UpsertOutcome,
}

/// Remote record store as seen by the engine.
pub trait RecordRepository {
    /// Records touching `window`, hidden ones included.
    fn list_records(&mut self, window: &TimeWindow) -> Result<Vec<Record>, RepositoryError>;

    /// Store each record independently; one result per record.
    fn upsert_records(&mut self, records: &[Record]) -> Result<Vec<UpsertResult>, RepositoryError>;

    /// The store's clock, used as the anchor for relative expressions.
    fn server_time(&mut self) -> Result<DateTime<Utc>, RepositoryError>;
}

/// Repository held in memory with a controllable clock and failure injection.
#[derive(Debug, Clone)]
pub struct InMemoryRepository {
    records: Vec<Record>,
    clock: DateTime<Utc>,
    fail_next_upsert: Option<String>,
    fail_next_list: Option<String>,
    rejected_keys: HashSet<String>,
    upsert_calls: usize,
    list_calls: usize,
}

impl InMemoryRepository {
    pub fn new(clock: DateTime<Utc>) -> Self {
        Self {
            records: Vec::new(),
            clock,
            fail_next_upsert: None,
            fail_next_list: None,
            rejected_keys: HashSet::new(),
            upsert_calls: 0,
            list_calls: 0,
        }
    }

    pub fn with_records(records: Vec<Record>, clock: DateTime<Utc>) -> Self {
        let mut repo = Self::new(clock);
        repo.records = records;
        repo
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn find(&self, key: &str) -> Option<&Record> {
        self.records.iter().find(|record| record.key == key)
    }

    pub fn advance(&mut self, by: Duration) {
        self.clock += by;
    }

    pub fn set_clock(&mut self, clock: DateTime<Utc>) {
        self.clock = clock;
    }

    pub fn fail_next_upsert(&mut self, reason: impl Into<String>) {
        self.fail_next_upsert = Some(reason.into());
    }

    pub fn fail_next_list(&mut self, reason: impl Into<String>) {
        self.fail_next_list = Some(reason.into());
    }

    pub fn reject_key(&mut self, key: impl Into<String>) {
        self.rejected_keys.insert(key.into());
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls
    }
}

impl RecordRepository for InMemoryRepository {
    fn list_records(&mut self, window: &TimeWindow) -> Result<Vec<Record>, RepositoryError> {
        self.list_calls += 1;
        if let Some(reason) = self.fail_next_list.take() {
            return Err(RepositoryError::Transport(reason));
        }
        Ok(self
            .records
            .iter()
            .filter(|record| window.touches(record))
            .cloned()
            .collect())
    }

    fn upsert_records(&mut self, records: &[Record]) -> Result<Vec<UpsertResult>, RepositoryError> {
        self.upsert_calls += 1;
        if let Some(reason) = self.fail_next_upsert.take() {
            return Err(RepositoryError::Transport(reason));
        }
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            if self.rejected_keys.contains(&record.key) {
                results.push(UpsertResult {
                    key: record.key.clone(),
                    outcome: UpsertOutcome::Rejected {
                        reason: "rejected by repository".to_string(),
                    },
                });
                continue;
            }
            match self.records.iter_mut().find(|existing| existing.key == record.key) {
                Some(existing) => *existing = record.clone(),
                None => self.records.push(record.clone()),
            }
            results.push(UpsertResult {
                key: record.key.clone(),
                outcome: UpsertOutcome::Accepted {
                    modified_at: record.modified_at,
                },
            });
        }
        Ok(results)
    }

    fn server_time(&mut self) -> Result<DateTime<Utc>, RepositoryError> {
        Ok(self.clock)
    }
}
