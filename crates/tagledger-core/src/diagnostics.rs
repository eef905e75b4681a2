//! Consistency checks over a window of records.
//!
//! Diagnostics never mutate anything; they produce a [`DiagnosticReport`] that
//! the repair planner and the renderers consume.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ExitStatus;
use crate::record::Record;
use crate::timeparse::default_range_start;

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Fatal,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionKind {
    /// Starts before the plausible epoch floor.
    BeforeEpochFloor,
    /// Ends unreasonably far in the future.
    FarFuture,
    /// Ends in the future beyond the allowed slack.
    Future,
    /// A closed record longer than the long-duration limit.
    LongDuration,
}

impl SuspicionKind {
    pub fn describe(&self) -> &'static str {
        match self {
            SuspicionKind::BeforeEpochFloor => "starts before the year 2000",
            SuspicionKind::FarFuture => "ends years in the future",
            SuspicionKind::Future => "ends in the future",
            SuspicionKind::LongDuration => "lasts longer than expected",
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    DuplicateKey,
    InvertedInterval,
    OverlapFound,
    StaleRunning,
    Suspicious,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::DuplicateKey => "duplicate_key",
            FindingKind::InvertedInterval => "inverted_interval",
            FindingKind::OverlapFound => "overlap",
            FindingKind::StaleRunning => "stale_running",
            FindingKind::Suspicious => "suspicious",
        }
    }
}

/// One detected problem. Findings carry copies of the records involved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    OverlapFound {
        first: Record,
        second: Record,
    },
    StaleRunning {
        record: Record,
        threshold_secs: i64,
    },
    DuplicateKey {
        first: Record,
        second: Record,
    },
    InvertedInterval {
        record: Record,
    },
    Suspicious {
        record: Record,
        reason: SuspicionKind,
    },
}

impl Finding {
    pub fn kind(&self) -> FindingKind {
        match self {
            Finding::OverlapFound { .. } => FindingKind::OverlapFound,
            Finding::StaleRunning { .. } => FindingKind::StaleRunning,
            Finding::DuplicateKey { .. } => FindingKind::DuplicateKey,
            Finding::InvertedInterval { .. } => FindingKind::InvertedInterval,
            Finding::Suspicious { .. } => FindingKind::Suspicious,
        }
    }

    /// Duplicate keys and inverted intervals block automatic repair.
    pub fn severity(&self) -> Severity {
        match self {
            Finding::DuplicateKey { .. } | Finding::InvertedInterval { .. } => Severity::Fatal,
            _ => Severity::Warning,
        }
    }

    pub fn records(&self) -> Vec<&Record> {
        match self {
            Finding::OverlapFound { first, second } | Finding::DuplicateKey { first, second } => {
                vec![first, second]
            }
            Finding::StaleRunning { record, .. }
            | Finding::InvertedInterval { record }
            | Finding::Suspicious { record, .. } => vec![record],
        }
    }

    pub fn keys(&self) -> Vec<&str> {
        self.records().into_iter().map(|r| r.key.as_str()).collect()
    }

    pub fn summary(&self) -> String {
        match self {
            Finding::OverlapFound { first, second } => {
                format!("{} overlaps {}", first.key, second.key)
            }
            Finding::StaleRunning {
                record,
                threshold_secs,
            } => format!(
                "{} has been running for more than {}h",
                record.key,
                threshold_secs / 3600
            ),
            Finding::DuplicateKey { first, .. } => {
                format!("key {} is used by more than one record", first.key)
            }
            Finding::InvertedInterval { record } => {
                format!("{} stops before it starts", record.key)
            }
            Finding::Suspicious { record, reason } => {
                format!("{} {}", record.key, reason.describe())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnoseOptions {
    /// Running records older than this (and not the most recent) are stale.
    pub stale_threshold: Duration,
    pub check_suspicious: bool,
    pub epoch_floor: DateTime<Utc>,
    pub future_slack: Duration,
    pub far_future: Duration,
    pub long_duration: Duration,
}

impl Default for DiagnoseOptions {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::hours(24),
            check_suspicious: true,
            epoch_floor: default_range_start(),
            future_slack: Duration::days(1),
            far_future: Duration::days(730),
            long_duration: Duration::days(2),
        }
    }
}

impl DiagnoseOptions {
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FindingCounts {
    pub duplicate_keys: usize,
    pub inverted: usize,
    pub overlaps: usize,
    pub stale_running: usize,
    pub suspicious: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticReport {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub checked_at: DateTime<Utc>,
    /// Records examined, hidden ones included.
    pub checked: usize,
    pub findings: Vec<Finding>,
}

impl DiagnosticReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn has_fatal(&self) -> bool {
        self.findings
            .iter()
            .any(|finding| finding.severity() == Severity::Fatal)
    }

    pub fn fatal(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|finding| finding.severity() == Severity::Fatal)
    }

    pub fn of_kind(&self, kind: FindingKind) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(move |finding| finding.kind() == kind)
    }

    pub fn counts(&self) -> FindingCounts {
        let mut counts = FindingCounts::default();
        for finding in &self.findings {
            match finding.kind() {
                FindingKind::DuplicateKey => counts.duplicate_keys += 1,
                FindingKind::InvertedInterval => counts.inverted += 1,
                FindingKind::OverlapFound => counts.overlaps += 1,
                FindingKind::StaleRunning => counts.stale_running += 1,
                FindingKind::Suspicious => counts.suspicious += 1,
            }
        }
        counts
    }

    pub fn exit_status(&self) -> ExitStatus {
        if self.has_fatal() {
            ExitStatus::Fatal
        } else if self.is_clean() {
            ExitStatus::Clean
        } else {
            ExitStatus::Findings
        }
    }
}

/// Examine `records` and report every problem found.
///
/// Findings are grouped by kind (duplicate keys, inverted intervals, overlaps,
/// stale running records, suspicious values). Overlap pairs are ordered by the
/// start of the first record, then the start of the second.
pub fn diagnose(records: &[Record], now: DateTime<Utc>, options: &DiagnoseOptions) -> DiagnosticReport {
    let visible: Vec<&Record> = records.iter().filter(|record| !record.hidden).collect();
    let order = start_order(&visible);

    let mut findings = find_duplicate_keys(records);
    findings.extend(
        order
            .iter()
            .map(|&idx| visible[idx])
            .filter(|record| record.is_inverted())
            .map(|record| Finding::InvertedInterval {
                record: record.clone(),
            }),
    );
    findings.extend(find_overlaps(&visible, &order));
    findings.extend(find_stale(&visible, &order, now, options.stale_threshold));
    if options.check_suspicious {
        findings.extend(find_suspicious(&visible, &order, now, options));
    }

    debug!(
        checked = records.len(),
        findings = findings.len(),
        "diagnostics complete"
    );
    DiagnosticReport {
        checked_at: now,
        checked: records.len(),
        findings,
    }
}

/// Indices into `records` sorted by start, ties broken by key.
fn start_order(records: &[&Record]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| {
        records[a]
            .t_start
            .cmp(&records[b].t_start)
            .then_with(|| records[a].key.cmp(&records[b].key))
    });
    order
}

fn find_duplicate_keys(records: &[Record]) -> Vec<Finding> {
    let mut groups: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
    for record in records {
        groups.entry(record.key.as_str()).or_default().push(record);
    }
    let mut findings = Vec::new();
    for group in groups.values().filter(|group| group.len() > 1) {
        for other in &group[1..] {
            findings.push(Finding::DuplicateKey {
                first: group[0].clone(),
                second: (*other).clone(),
            });
        }
    }
    findings
}

/// Sweep over records in start order, keeping the set of records whose end
/// has not yet been passed. Every record still active when another starts
/// overlaps it.
fn find_overlaps(records: &[&Record], order: &[usize]) -> Vec<Finding> {
    let mut active: Vec<usize> = Vec::new();
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for (pos, &idx) in order.iter().enumerate() {
        let current = records[idx];
        if current.is_inverted() {
            continue;
        }
        active.retain(|&earlier| match records[order[earlier]].open_end() {
            Some(end) => end > current.t_start,
            None => true,
        });
        pairs.extend(active.iter().map(|&earlier| (earlier, pos)));
        active.push(pos);
    }
    pairs.sort_unstable();
    pairs
        .into_iter()
        .map(|(a, b)| Finding::OverlapFound {
            first: records[order[a]].clone(),
            second: records[order[b]].clone(),
        })
        .collect()
}

fn find_stale(
    records: &[&Record],
    order: &[usize],
    now: DateTime<Utc>,
    threshold: Duration,
) -> Vec<Finding> {
    let Some(&most_recent) = order.last() else {
        return Vec::new();
    };
    order
        .iter()
        .filter(|&&idx| idx != most_recent)
        .map(|&idx| records[idx])
        .filter(|record| record.is_running() && now - record.t_start > threshold)
        .map(|record| Finding::StaleRunning {
            record: record.clone(),
            threshold_secs: threshold.num_seconds(),
        })
        .collect()
}

fn find_suspicious(
    records: &[&Record],
    order: &[usize],
    now: DateTime<Utc>,
    options: &DiagnoseOptions,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    for record in order.iter().map(|&idx| records[idx]) {
        if record.is_inverted() {
            continue;
        }
        let reason = if record.t_start < options.epoch_floor {
            Some(SuspicionKind::BeforeEpochFloor)
        } else if record.t_stop > now + options.far_future {
            Some(SuspicionKind::FarFuture)
        } else if record.t_stop > now + options.future_slack {
            Some(SuspicionKind::Future)
        } else if !record.is_running() && record.t_stop - record.t_start > options.long_duration {
            Some(SuspicionKind::LongDuration)
        } else {
            None
        };
        if let Some(reason) = reason {
            findings.push(Finding::Suspicious {
                record: record.clone(),
                reason,
            });
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, h, m, 0).unwrap()
    }

    fn rec(key: &str, start: DateTime<Utc>, stop: DateTime<Utc>) -> Record {
        Record {
            key: key.to_string(),
            description: format!("task {key}"),
            t_start: start,
            t_stop: stop,
            modified_at: start,
            hidden: false,
        }
    }

    fn overlap_keys(report: &DiagnosticReport) -> Vec<(String, String)> {
        report
            .of_kind(FindingKind::OverlapFound)
            .map(|finding| match finding {
                Finding::OverlapFound { first, second } => (first.key.clone(), second.key.clone()),
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn running_record_overlapping_a_later_one_is_reported() {
        let now = at(12, 11, 0);
        let records = vec![
            rec("a", at(12, 9, 0), at(12, 9, 0)),
            rec("b", at(12, 9, 30), at(12, 10, 0)),
        ];
        let report = diagnose(&records, now, &DiagnoseOptions::default());
        assert_eq!(overlap_keys(&report), vec![("a".to_string(), "b".to_string())]);
        assert_eq!(report.of_kind(FindingKind::StaleRunning).count(), 0);
        assert_eq!(report.exit_status(), ExitStatus::Findings);
    }

    #[test]
    fn overlap_pairs_are_ordered_by_first_then_second_start() {
        let now = at(12, 20, 0);
        let records = vec![
            rec("c", at(12, 10, 30), at(12, 11, 30)),
            rec("b", at(12, 10, 0), at(12, 11, 0)),
            rec("a", at(12, 9, 0), at(12, 12, 0)),
        ];
        let report = diagnose(&records, now, &DiagnoseOptions::default());
        assert_eq!(
            overlap_keys(&report),
            vec![
                ("a".to_string(), "b".to_string()),
                ("a".to_string(), "c".to_string()),
                ("b".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn touching_and_hidden_records_are_clean() {
        let now = at(12, 20, 0);
        let mut hidden = rec("h", at(12, 9, 30), at(12, 9, 45));
        hidden.hidden = true;
        let records = vec![
            rec("a", at(12, 9, 0), at(12, 10, 0)),
            rec("b", at(12, 10, 0), at(12, 11, 0)),
            hidden,
        ];
        let report = diagnose(&records, now, &DiagnoseOptions::default());
        assert!(report.is_clean());
        assert_eq!(report.checked, 3);
        assert_eq!(report.exit_status(), ExitStatus::Clean);
    }

    #[test]
    fn stale_running_spares_the_most_recent_record() {
        let now = at(12, 12, 0);
        let records = vec![
            rec("old", at(10, 8, 0), at(10, 8, 0)),
            rec("latest", at(11, 8, 0), at(11, 8, 0)),
        ];
        let report = diagnose(&records, now, &DiagnoseOptions::default());
        let stale: Vec<&str> = report
            .of_kind(FindingKind::StaleRunning)
            .flat_map(|finding| finding.keys())
            .collect();
        assert_eq!(stale, vec!["old"]);
    }

    #[test]
    fn stale_threshold_is_configurable() {
        let now = at(12, 12, 0);
        let records = vec![
            rec("old", at(12, 8, 0), at(12, 8, 0)),
            rec("later", at(12, 11, 0), at(12, 11, 30)),
        ];
        let strict = DiagnoseOptions::default().with_stale_threshold(Duration::hours(2));
        assert_eq!(diagnose(&records, now, &strict).counts().stale_running, 1);
        assert_eq!(
            diagnose(&records, now, &DiagnoseOptions::default())
                .counts()
                .stale_running,
            0
        );
    }

    #[test]
    fn duplicate_keys_and_inversions_are_fatal() {
        let now = at(12, 20, 0);
        let mut hidden_dup = rec("a", at(12, 14, 0), at(12, 15, 0));
        hidden_dup.hidden = true;
        let records = vec![
            rec("a", at(12, 9, 0), at(12, 10, 0)),
            hidden_dup,
            rec("inv", at(12, 12, 0), at(12, 11, 0)),
        ];
        let report = diagnose(&records, now, &DiagnoseOptions::default());
        let counts = report.counts();
        assert_eq!(counts.duplicate_keys, 1);
        assert_eq!(counts.inverted, 1);
        assert_eq!(counts.overlaps, 0);
        assert!(report.has_fatal());
        assert_eq!(report.exit_status(), ExitStatus::Fatal);
    }

    #[test]
    fn suspicious_values_are_flagged_once_each() {
        let now = at(12, 12, 0);
        let ancient = rec(
            "ancient",
            Utc.with_ymd_and_hms(1999, 6, 1, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(1999, 6, 1, 10, 0, 0).unwrap(),
        );
        let records = vec![
            ancient,
            rec("long", at(1, 9, 0), at(5, 9, 0)),
            rec("future", at(14, 9, 0), at(14, 10, 0)),
        ];
        let report = diagnose(&records, now, &DiagnoseOptions::default());
        let reasons: Vec<SuspicionKind> = report
            .of_kind(FindingKind::Suspicious)
            .map(|finding| match finding {
                Finding::Suspicious { reason, .. } => *reason,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                SuspicionKind::BeforeEpochFloor,
                SuspicionKind::LongDuration,
                SuspicionKind::Future,
            ]
        );
    }

    #[test]
    fn overlap_count_matches_brute_force() {
        let now = at(20, 0, 0);
        let mut records = Vec::new();
        for i in 0..30u32 {
            let start = at(12, 0, 0) + Duration::minutes(i64::from(i * 37 % 600));
            let len = Duration::minutes(i64::from(15 + i * 13 % 90));
            let stop = if i % 7 == 0 { start } else { start + len };
            records.push(rec(&format!("r{i:02}"), start, stop));
        }
        let mut expected = 0;
        for i in 0..records.len() {
            for j in (i + 1)..records.len() {
                if crate::record::overlaps(&records[i], &records[j]) {
                    expected += 1;
                }
            }
        }
        let report = diagnose(&records, now, &DiagnoseOptions::default());
        assert_eq!(report.counts().overlaps, expected);
    }
}
