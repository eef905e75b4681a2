//! Turn diagnostics into a concrete, reviewable list of record changes.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::commit::{commit, CommitReport, Mode};
use crate::diagnostics::{diagnose, DiagnoseOptions, DiagnosticReport, Finding};
use crate::error::LedgerError;
use crate::record::{next_modified, overlaps, Record, TimeWindow};
use crate::repository::RecordRepository;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    /// A running record gets a stop time.
    Close {
        #[serde(with = "chrono::serde::ts_seconds")]
        t_stop: DateTime<Utc>,
    },
    /// A closed record gets a new interval.
    Trim {
        #[serde(with = "chrono::serde::ts_seconds")]
        t_start: DateTime<Utc>,
        #[serde(with = "chrono::serde::ts_seconds")]
        t_stop: DateTime<Utc>,
    },
    /// The record is hidden.
    Flag,
}

impl RepairAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairAction::Close { .. } => "close",
            RepairAction::Trim { .. } => "trim",
            RepairAction::Flag => "flag",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedChange {
    pub action: RepairAction,
    pub before: Record,
    pub after: Record,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub changes: Vec<PlannedChange>,
    /// Findings that are reported but never fixed automatically.
    pub manual_review: Vec<Finding>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Records in their proposed state, ready for [`commit`].
    pub fn records(&self) -> Vec<Record> {
        self.changes.iter().map(|change| change.after.clone()).collect()
    }

    pub fn change_for(&self, key: &str) -> Option<&PlannedChange> {
        self.changes.iter().find(|change| change.before.key == key)
    }

    /// Apply the plan to a copy of `records`. Nothing is added or removed.
    pub fn apply_to(&self, records: &[Record]) -> Vec<Record> {
        let by_key: HashMap<&str, &PlannedChange> = self
            .changes
            .iter()
            .map(|change| (change.before.key.as_str(), change))
            .collect();
        records
            .iter()
            .map(|record| match by_key.get(record.key.as_str()) {
                Some(change) if change.before == *record => change.after.clone(),
                _ => record.clone(),
            })
            .collect()
    }
}

/// Working state while the plan is assembled: proposed records by key plus the
/// order in which keys were first touched.
struct Draft<'a> {
    originals: HashMap<&'a str, &'a Record>,
    proposed: HashMap<String, Record>,
    reasons: HashMap<String, Vec<String>>,
    touched: Vec<String>,
}

impl<'a> Draft<'a> {
    fn new(records: &'a [Record]) -> Self {
        let mut originals = HashMap::new();
        for record in records {
            originals.entry(record.key.as_str()).or_insert(record);
        }
        Self {
            originals,
            proposed: HashMap::new(),
            reasons: HashMap::new(),
            touched: Vec::new(),
        }
    }

    /// Current proposed state of `record`, falling back to the finding's copy.
    fn current(&self, record: &Record) -> Record {
        self.proposed
            .get(&record.key)
            .cloned()
            .unwrap_or_else(|| record.clone())
    }

    fn original(&self, record: &Record) -> Record {
        self.originals
            .get(record.key.as_str())
            .map(|r| (*r).clone())
            .unwrap_or_else(|| record.clone())
    }

    fn propose(&mut self, next: Record, reason: String) {
        if !self.proposed.contains_key(&next.key) {
            self.touched.push(next.key.clone());
        }
        self.reasons.entry(next.key.clone()).or_default().push(reason);
        self.proposed.insert(next.key.clone(), next);
    }

    fn finish(self, now: DateTime<Utc>, manual_review: Vec<Finding>) -> Plan {
        let mut changes = Vec::with_capacity(self.touched.len());
        for key in &self.touched {
            let Some(before) = self.originals.get(key.as_str()).map(|r| (*r).clone()) else {
                continue;
            };
            let Some(mut after) = self.proposed.get(key).cloned() else {
                continue;
            };
            if after.same_content(&before) {
                continue;
            }
            after.modified_at = next_modified(before.modified_at, now);
            let action = if after.hidden && !before.hidden {
                RepairAction::Flag
            } else if before.is_running() && !after.is_running() {
                RepairAction::Close {
                    t_stop: after.t_stop,
                }
            } else {
                RepairAction::Trim {
                    t_start: after.t_start,
                    t_stop: after.t_stop,
                }
            };
            changes.push(PlannedChange {
                action,
                before,
                after,
                reasons: self.reasons.get(key).cloned().unwrap_or_default(),
            });
        }
        Plan {
            changes,
            manual_review,
        }
    }
}

/// Build a repair plan for `report`, which must have been computed over
/// `records`.
///
/// Overlaps are resolved by ending the earlier record where the later one
/// starts; when both start together the less recently modified record is
/// hidden instead. Stale running records are closed where the next record
/// starts, or after the stale threshold when nothing follows. Findings that
/// touch a duplicated key, and every other kind of finding, go to manual
/// review.
pub fn plan_repairs(records: &[Record], report: &DiagnosticReport, now: DateTime<Utc>) -> Plan {
    let mut draft = Draft::new(records);
    let mut manual_review = Vec::new();

    let duplicated: HashSet<&str> = report
        .findings
        .iter()
        .filter_map(|finding| match finding {
            Finding::DuplicateKey { first, .. } => Some(first.key.as_str()),
            _ => None,
        })
        .collect();

    let mut starts: Vec<DateTime<Utc>> = records
        .iter()
        .filter(|record| !record.hidden)
        .map(|record| record.t_start)
        .collect();
    starts.sort_unstable();

    for finding in &report.findings {
        if finding
            .keys()
            .iter()
            .any(|key| duplicated.contains(key))
        {
            manual_review.push(finding.clone());
            continue;
        }
        match finding {
            Finding::OverlapFound { first, second } => {
                let a = draft.current(first);
                let b = draft.current(second);
                if !overlaps(&a, &b) {
                    debug!(first = %a.key, second = %b.key, "overlap already resolved");
                    continue;
                }
                if a.t_start < b.t_start {
                    let mut trimmed = a;
                    trimmed.t_stop = b.t_start;
                    draft.propose(trimmed, format!("overlaps {}", b.key));
                } else {
                    // Equal starts: trimming would leave an empty interval.
                    let (victim, keeper) = if b.modified_at < a.modified_at {
                        (second, &a)
                    } else {
                        (first, &b)
                    };
                    let mut hidden = draft.original(victim);
                    hidden.hidden = true;
                    draft.propose(hidden, format!("starts together with {}", keeper.key));
                }
            }
            Finding::StaleRunning {
                record,
                threshold_secs,
            } => {
                let current = draft.current(record);
                if !current.is_running() || current.hidden {
                    continue;
                }
                let next_start = starts
                    .iter()
                    .copied()
                    .find(|start| *start > current.t_start);
                let close_at = next_start
                    .unwrap_or_else(|| current.t_start + Duration::seconds(*threshold_secs));
                let mut closed = current;
                closed.t_stop = close_at;
                draft.propose(closed, "running past the stale threshold".to_string());
            }
            Finding::DuplicateKey { .. }
            | Finding::InvertedInterval { .. }
            | Finding::Suspicious { .. } => manual_review.push(finding.clone()),
        }
    }

    let plan = draft.finish(now, manual_review);
    debug!(
        changes = plan.changes.len(),
        manual = plan.manual_review.len(),
        "repair plan built"
    );
    plan
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairOutcome {
    pub window: TimeWindow,
    pub report: DiagnosticReport,
    pub plan: Plan,
    pub commit: CommitReport,
}

/// Fetch, diagnose, plan and commit. Dry and real runs share every step up to
/// the commit.
pub fn run_repair<R: RecordRepository + ?Sized>(
    repo: &mut R,
    window: &TimeWindow,
    options: &DiagnoseOptions,
    strict: bool,
    mode: Mode,
) -> Result<RepairOutcome, LedgerError> {
    let now = repo.server_time()?;
    let records = repo.list_records(window)?;
    let report = diagnose(&records, now, options);
    if strict && report.has_fatal() {
        return Err(LedgerError::FatalFindings {
            count: report.fatal().count(),
        });
    }
    let plan = plan_repairs(&records, &report, now);
    let commit = commit(repo, &plan.records(), mode)?;
    info!(
        mode = mode.as_str(),
        changes = plan.changes.len(),
        applied = commit.applied_count(),
        failed = commit.failed_count(),
        "repair finished"
    );
    Ok(RepairOutcome {
        window: *window,
        report,
        plan,
        commit,
    })
}
