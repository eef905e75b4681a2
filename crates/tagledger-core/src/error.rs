use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::interchange::CsvError;
use crate::record::RecordError;
use crate::repository::RepositoryError;
use crate::timeparse::TimeParseError;

/// Process exit status shared by every command.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Clean,
    /// Non-fatal findings, or rows that could not be imported.
    Findings,
    /// Findings that block automatic repair.
    Fatal,
    /// The repository failed outright or rejected changes.
    RepositoryFailed,
    /// Bad arguments, configuration, or unparseable input.
    Usage,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Findings => 1,
            ExitStatus::Fatal => 2,
            ExitStatus::RepositoryFailed => 3,
            ExitStatus::Usage => 4,
        }
    }

    fn rank(self) -> u8 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Findings => 1,
            ExitStatus::Fatal => 2,
            ExitStatus::Usage => 3,
            ExitStatus::RepositoryFailed => 4,
        }
    }

    /// The more severe of two statuses.
    pub fn worst(self, other: ExitStatus) -> ExitStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Time(#[from] TimeParseError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Csv(#[from] CsvError),
    #[error("refusing to repair: {count} fatal finding(s) present")]
    FatalFindings { count: usize },
    #[error("{0}")]
    Invalid(String),
}

impl LedgerError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            LedgerError::Repository(_) => ExitStatus::RepositoryFailed,
            LedgerError::FatalFindings { .. } => ExitStatus::Fatal,
            _ => ExitStatus::Usage,
        }
    }
}
