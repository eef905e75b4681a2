//! Merge parsed CSV rows into the repository without ever regressing a record.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::commit::{commit, CommitReport, Mode};
use crate::error::LedgerError;
use crate::interchange::{parse_csv, ImportOptions, ParsedCsv, RowError};
use crate::record::{Record, TimeWindow};
use crate::repository::RecordRepository;
use crate::timeparse::default_range_start;

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Same content as the stored record.
    Unchanged,
    /// The stored record was modified at or after the row's time.
    Older,
    /// Excluded by the tag or time-window filter.
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Insert {
        row: usize,
        record: Record,
    },
    Update {
        row: usize,
        before: Record,
        after: Record,
    },
    Skipped {
        row: usize,
        key: String,
        reason: SkipReason,
    },
    Error(RowError),
}

impl RowOutcome {
    pub fn row(&self) -> usize {
        match self {
            RowOutcome::Insert { row, .. }
            | RowOutcome::Update { row, .. }
            | RowOutcome::Skipped { row, .. } => *row,
            RowOutcome::Error(err) => err.row(),
        }
    }

    /// The record to send, for inserts and updates.
    pub fn mutation(&self) -> Option<&Record> {
        match self {
            RowOutcome::Insert { record, .. } => Some(record),
            RowOutcome::Update { after, .. } => Some(after),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub older: usize,
    pub filtered: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportPlan {
    pub outcomes: Vec<RowOutcome>,
}

impl ImportPlan {
    pub fn mutations(&self) -> Vec<Record> {
        self.outcomes
            .iter()
            .filter_map(RowOutcome::mutation)
            .cloned()
            .collect()
    }

    pub fn errors(&self) -> impl Iterator<Item = &RowError> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            RowOutcome::Error(err) => Some(err),
            _ => None,
        })
    }

    pub fn counts(&self) -> ImportCounts {
        let mut counts = ImportCounts::default();
        for outcome in &self.outcomes {
            match outcome {
                RowOutcome::Insert { .. } => counts.inserted += 1,
                RowOutcome::Update { .. } => counts.updated += 1,
                RowOutcome::Skipped { reason, .. } => match reason {
                    SkipReason::Unchanged => counts.unchanged += 1,
                    SkipReason::Older => counts.older += 1,
                    SkipReason::Filtered => counts.filtered += 1,
                },
                RowOutcome::Error(_) => counts.errors += 1,
            }
        }
        counts
    }
}

/// Decide the fate of every parsed row against the `existing` records.
pub fn plan_import(parsed: &ParsedCsv, existing: &[Record], options: &ImportOptions) -> ImportPlan {
    let mut index: BTreeMap<&str, &Record> = BTreeMap::new();
    for record in existing {
        index.entry(record.key.as_str()).or_insert(record);
    }

    let outcomes = parsed
        .rows
        .iter()
        .map(|row| match row {
            Err(err) => RowOutcome::Error(err.clone()),
            Ok(candidate) => {
                let mut incoming = candidate.record.clone();
                let stored = index.get(incoming.key.as_str()).copied();
                if let (None, Some(stored)) = (candidate.hidden, stored) {
                    incoming.hidden = stored.hidden;
                }
                if !options.accepts(&incoming) {
                    return RowOutcome::Skipped {
                        row: candidate.row,
                        key: incoming.key,
                        reason: SkipReason::Filtered,
                    };
                }
                match stored {
                    None => RowOutcome::Insert {
                        row: candidate.row,
                        record: incoming,
                    },
                    Some(stored) if incoming.same_content(stored) => RowOutcome::Skipped {
                        row: candidate.row,
                        key: incoming.key,
                        reason: SkipReason::Unchanged,
                    },
                    Some(stored) if incoming.modified_at > stored.modified_at => {
                        RowOutcome::Update {
                            row: candidate.row,
                            before: stored.clone(),
                            after: incoming,
                        }
                    }
                    Some(_) => RowOutcome::Skipped {
                        row: candidate.row,
                        key: incoming.key,
                        reason: SkipReason::Older,
                    },
                }
            }
        })
        .collect();
    ImportPlan { outcomes }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub anchor: DateTime<Utc>,
    pub plan: ImportPlan,
    pub commit: CommitReport,
}

/// Parse, reconcile and commit a CSV document.
/// Stored records are matched by key, and a stored record may since have
/// moved away from the times in the file. The window therefore covers the
/// whole history up to a day past `anchor`, stretched to the rows' span.
fn comparison_window(span: &TimeWindow, anchor: DateTime<Utc>) -> TimeWindow {
    TimeWindow::new(
        span.start.min(default_range_start()),
        span.end.max(anchor + Duration::days(1)),
    )
}

pub fn run_import<R, Tz>(
    repo: &mut R,
    input: &str,
    tz: &Tz,
    options: &ImportOptions,
    mode: Mode,
) -> Result<ImportOutcome, LedgerError>
where
    R: RecordRepository + ?Sized,
    Tz: TimeZone,
{
    let anchor = repo.server_time()?;
    let parsed = parse_csv(input, anchor, tz, options)?;
    let candidates: Vec<Record> = parsed.candidates().map(|c| c.record.clone()).collect();
    let existing = match TimeWindow::spanning(&candidates, anchor) {
        Some(span) => repo.list_records(&comparison_window(&span, anchor))?,
        None => Vec::new(),
    };
    let plan = plan_import(&parsed, &existing, options);
    let commit = commit(repo, &plan.mutations(), mode)?;
    let counts = plan.counts();
    info!(
        mode = mode.as_str(),
        inserted = counts.inserted,
        updated = counts.updated,
        skipped = counts.unchanged + counts.older + counts.filtered,
        errors = counts.errors,
        "import finished"
    );
    Ok(ImportOutcome {
        anchor,
        plan,
        commit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interchange::CandidateRow;
    use crate::summary::TagMatch;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 12, h, 0, 0).unwrap()
    }

    fn rec(key: &str, description: &str, start: u32, stop: u32, modified: u32) -> Record {
        Record {
            key: key.to_string(),
            description: description.to_string(),
            t_start: at(start),
            t_stop: at(stop),
            modified_at: at(modified),
            hidden: false,
        }
    }

    fn parsed(rows: Vec<(Record, Option<bool>)>) -> ParsedCsv {
        ParsedCsv {
            rows: rows
                .into_iter()
                .enumerate()
                .map(|(idx, (record, hidden))| {
                    Ok(CandidateRow {
                        row: idx + 1,
                        record,
                        hidden,
                    })
                })
                .collect(),
        }
    }

    #[test]
    fn rows_are_inserted_updated_or_skipped() {
        let existing = vec![
            rec("same", "x", 8, 9, 9),
            rec("stale", "x", 9, 10, 10),
            rec("fresh", "x", 10, 11, 12),
        ];
        let input = parsed(vec![
            (rec("new", "x", 11, 12, 12), None),
            (rec("same", "x", 8, 9, 12), None),
            (rec("stale", "changed", 9, 10, 11), None),
            (rec("fresh", "changed", 10, 11, 11), None),
        ]);
        let plan = plan_import(&input, &existing, &ImportOptions::default());
        assert_eq!(
            plan.counts(),
            ImportCounts {
                inserted: 1,
                updated: 1,
                unchanged: 1,
                older: 1,
                filtered: 0,
                errors: 0,
            }
        );
        let keys: Vec<String> = plan.mutations().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["new".to_string(), "stale".to_string()]);
    }

    #[test]
    fn hidden_flag_is_inherited_when_absent() {
        let mut stored = rec("k", "x", 8, 9, 9);
        stored.hidden = true;
        let plan = plan_import(
            &parsed(vec![(rec("k", "x", 8, 9, 12), None)]),
            &[stored.clone()],
            &ImportOptions::default(),
        );
        assert!(matches!(
            plan.outcomes[0],
            RowOutcome::Skipped {
                reason: SkipReason::Unchanged,
                ..
            }
        ));

        let plan = plan_import(
            &parsed(vec![(rec("k", "x", 8, 9, 12), Some(false))]),
            &[stored],
            &ImportOptions::default(),
        );
        match &plan.outcomes[0] {
            RowOutcome::Update { after, .. } => assert!(!after.hidden),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn filters_mark_rows_as_filtered() {
        let options = ImportOptions {
            tags: vec!["#client".to_string()],
            tag_match: TagMatch::All,
            window: Some(TimeWindow::new(at(8), at(12))),
            ..Default::default()
        };
        let plan = plan_import(
            &parsed(vec![
                (rec("a", "call #client", 9, 10, 10), None),
                (rec("b", "call #other", 9, 10, 10), None),
                (rec("c", "late #client", 13, 14, 14), None),
            ]),
            &[],
            &options,
        );
        assert_eq!(plan.counts().inserted, 1);
        assert_eq!(plan.counts().filtered, 2);
    }

    #[test]
    fn outcomes_follow_input_order_including_errors() {
        let input = ParsedCsv {
            rows: vec![
                Err(RowError::Missing {
                    row: 1,
                    column: "start".to_string(),
                }),
                Ok(CandidateRow {
                    row: 2,
                    record: rec("a", "x", 8, 9, 9),
                    hidden: None,
                }),
            ],
        };
        let plan = plan_import(&input, &[], &ImportOptions::default());
        let rows: Vec<usize> = plan.outcomes.iter().map(RowOutcome::row).collect();
        assert_eq!(rows, vec![1, 2]);
        assert_eq!(plan.errors().count(), 1);
    }
}
