//! Plain-text and JSON views of tagledger results.
//!
//! Every text renderer builds the whole output as one `String`, so callers can
//! print a frame in a single write.

use std::fmt::{Display, Write as _};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use tagledger_core::commit::{CommitReport, CommitStatus};
use tagledger_core::diagnostics::{DiagnosticReport, Finding, Severity};
use tagledger_core::reconcile::{ImportOutcome, RowOutcome, SkipReason};
use tagledger_core::record::{Record, TimeWindow};
use tagledger_core::repair::{Plan, RepairAction};
use tagledger_core::summary::{tag_stats, total_time, StatusReport};
use tagledger_core::tracking::TrackingOutcome;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
}

/// `3h05m` style duration; negative values render as zero.
pub fn readable_duration(duration: Duration) -> String {
    let minutes = duration.num_minutes().max(0);
    format!("{}h{:02}m", minutes / 60, minutes % 60)
}

fn local<Tz>(at: DateTime<Utc>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.with_timezone(tz).format("%Y-%m-%d %H:%M").to_string()
}

/// One line per record, oldest first. Running records show `...` as stop.
pub fn render_records<Tz>(records: &[Record], now: DateTime<Utc>, tz: &Tz, show_keys: bool) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut sorted: Vec<&Record> = records.iter().collect();
    sorted.sort_by(|a, b| a.t_start.cmp(&b.t_start).then_with(|| a.key.cmp(&b.key)));

    let mut out = String::new();
    if sorted.is_empty() {
        out.push_str("No records.\n");
        return out;
    }
    for record in sorted {
        let stop = if record.is_running() {
            "...".to_string()
        } else {
            local(record.t_stop, tz)
        };
        let key = if show_keys {
            format!("{}  ", record.key)
        } else {
            String::new()
        };
        let hidden = if record.hidden { "  (hidden)" } else { "" };
        let _ = writeln!(
            out,
            "{key}{}  {:<16}  {:>8}  {}{hidden}",
            local(record.t_start, tz),
            stop,
            readable_duration(record.duration(now)),
            record.description,
        );
    }
    out
}

/// Total and per-tag time for the visible records.
pub fn render_summary(records: &[Record], window: &TimeWindow, now: DateTime<Utc>) -> String {
    let visible: Vec<Record> = records.iter().filter(|r| !r.hidden).cloned().collect();
    let total = total_time(&visible, window, now);
    let stats = tag_stats(&visible, now);
    let width = stats
        .iter()
        .map(|stat| stat.tag.len() + 1)
        .max()
        .unwrap_or(0)
        .max("Total:".len());

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<width$}  {:>5}  {}",
        "Total:",
        visible.len(),
        readable_duration(total)
    );
    for stat in stats {
        let _ = writeln!(
            out,
            "{:<width$}  {:>5}  {}",
            format!("{}:", stat.tag),
            stat.count,
            readable_duration(Duration::seconds(stat.total_secs))
        );
    }
    out
}

/// Period totals, the running record (or how many are running) and today's
/// records.
pub fn render_status<Tz>(report: &StatusReport, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let rows = [
        ("Total this month:", report.month_secs),
        ("Total this week:", report.week_secs),
        ("Total today:", report.today_secs),
    ];
    let mut out = String::new();
    for (label, secs) in rows {
        let _ = writeln!(out, "{label:<18} {:>8}", readable_duration(Duration::seconds(secs)));
    }
    out.push('\n');
    match report.running.as_slice() {
        [] => out.push_str("Running: nothing\n"),
        [record] => {
            let _ = writeln!(
                out,
                "Running: {}  {}",
                readable_duration(record.duration(report.now)),
                record.description
            );
        }
        many => {
            let _ = writeln!(out, "{} records are running.", many.len());
        }
    }
    out.push_str("\nToday's records:\n");
    out.push_str(&render_records(&report.today_records, report.now, tz, false));
    out
}

fn severity_label(finding: &Finding) -> &'static str {
    match finding.severity() {
        Severity::Fatal => "FATAL",
        Severity::Warning => "warn",
    }
}

pub fn render_report(report: &DiagnosticReport) -> String {
    let mut out = String::new();
    if report.is_clean() {
        let _ = writeln!(out, "No problems found in {} record(s).", report.checked);
        return out;
    }
    let counts = report.counts();
    let _ = writeln!(
        out,
        "{} finding(s) in {} record(s): {} overlap, {} stale, {} duplicate key, {} inverted, {} suspicious",
        report.findings.len(),
        report.checked,
        counts.overlaps,
        counts.stale_running,
        counts.duplicate_keys,
        counts.inverted,
        counts.suspicious
    );
    for finding in &report.findings {
        let _ = writeln!(
            out,
            "  [{}] {:<17} {}",
            severity_label(finding),
            finding.kind().as_str(),
            finding.summary()
        );
    }
    out
}

fn describe_action(action: &RepairAction) -> String {
    match action {
        RepairAction::Close { t_stop } => format!("close at {}", t_stop.to_rfc3339()),
        RepairAction::Trim { t_start, t_stop } => {
            format!("trim to {} .. {}", t_start.to_rfc3339(), t_stop.to_rfc3339())
        }
        RepairAction::Flag => "hide".to_string(),
    }
}

pub fn render_plan(plan: &Plan, commit: &CommitReport) -> String {
    let mut out = String::new();
    if plan.is_empty() {
        out.push_str("Nothing to repair automatically.\n");
    } else {
        let _ = writeln!(out, "Repair plan ({} change(s)):", plan.len());
        for change in &plan.changes {
            let status = commit
                .status_of(&change.before.key)
                .map(status_label)
                .unwrap_or_else(|| "pending".to_string());
            let _ = writeln!(
                out,
                "  {:<26} {:<40} [{}] {}",
                change.before.key,
                describe_action(&change.action),
                status,
                change.reasons.join("; ")
            );
        }
    }
    if !plan.manual_review.is_empty() {
        let _ = writeln!(out, "Needs manual review ({}):", plan.manual_review.len());
        for finding in &plan.manual_review {
            let _ = writeln!(out, "  {}", finding.summary());
        }
    }
    out
}

fn status_label(status: &CommitStatus) -> String {
    match status {
        CommitStatus::Pending => "pending".to_string(),
        CommitStatus::Applied { .. } => "applied".to_string(),
        CommitStatus::Failed { reason } => format!("failed: {reason}"),
    }
}

fn skip_label(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::Unchanged => "unchanged",
        SkipReason::Older => "older than stored record",
        SkipReason::Filtered => "filtered",
    }
}

pub fn render_import(outcome: &ImportOutcome) -> String {
    let mut out = String::new();
    for row in &outcome.plan.outcomes {
        let line = match row {
            RowOutcome::Insert { row, record } => {
                format!("row {row}: insert {} {}", record.key, record.description)
            }
            RowOutcome::Update { row, after, .. } => {
                format!("row {row}: update {} {}", after.key, after.description)
            }
            RowOutcome::Skipped { row, key, reason } => {
                format!("row {row}: skip {key} ({})", skip_label(*reason))
            }
            RowOutcome::Error(err) => format!("{err}"),
        };
        let status = row
            .mutation()
            .and_then(|record| outcome.commit.status_of(&record.key))
            .map(|status| format!(" [{}]", status_label(status)))
            .unwrap_or_default();
        let _ = writeln!(out, "  {line}{status}");
    }
    let counts = outcome.plan.counts();
    let _ = writeln!(
        out,
        "{} inserted, {} updated, {} unchanged, {} older, {} filtered, {} error(s){}",
        counts.inserted,
        counts.updated,
        counts.unchanged,
        counts.older,
        counts.filtered,
        counts.errors,
        if outcome.commit.mode == tagledger_core::commit::Mode::DryRun {
            " (dry run, nothing written)"
        } else {
            ""
        }
    );
    out
}

pub fn render_tracking(outcome: &TrackingOutcome) -> String {
    let mut out = String::new();
    for record in &outcome.stopped {
        let _ = writeln!(out, "Stopped: {}", record.description);
    }
    for record in &outcome.started {
        let _ = writeln!(out, "Started: {}", record.description);
    }
    for record in &outcome.changed {
        let verb = if record.hidden { "Removed" } else { "Restored" };
        let _ = writeln!(out, "{verb}: {} {}", record.key, record.description);
    }
    for key in &outcome.missing {
        let _ = writeln!(out, "Not found: {key}");
    }
    for entry in outcome.commit.failed() {
        let _ = writeln!(out, "Failed: {} ({})", entry.key, status_label(&entry.status));
    }
    out
}

fn row_json(outcome: &RowOutcome) -> Value {
    match outcome {
        RowOutcome::Insert { row, record } => json!({"row": row, "outcome": "insert", "record": record}),
        RowOutcome::Update { row, before, after } => {
            json!({"row": row, "outcome": "update", "before": before, "after": after})
        }
        RowOutcome::Skipped { row, key, reason } => {
            json!({"row": row, "outcome": "skipped", "key": key, "reason": reason})
        }
        RowOutcome::Error(err) => json!({
            "row": err.row(),
            "outcome": "error",
            "class": err.class(),
            "message": err.to_string(),
        }),
    }
}

pub fn import_json(outcome: &ImportOutcome) -> Value {
    json!({
        "anchor": outcome.anchor.to_rfc3339(),
        "rows": outcome.plan.outcomes.iter().map(row_json).collect::<Vec<_>>(),
        "counts": outcome.plan.counts(),
        "commit": outcome.commit,
    })
}

/// Pretty JSON for any serializable result.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, RenderError> {
    Ok(serde_json::to_string_pretty(value)?)
}
