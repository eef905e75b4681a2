//! Day-to-day tracking operations: start, stop, resume, hide and restore.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::commit::{commit, CommitReport, Mode};
use crate::record::{normalize_description, normalize_tag, Record, RecordError, TimeWindow};
use crate::repository::{RecordRepository, RepositoryError};
use crate::summary::{matches_tags, CalendarPeriods, StatusReport, TagMatch};
use crate::timeparse::default_range_start;

/// How far back `resume` looks for a record to continue.
pub const RESUME_LOOKBACK_DAYS: i64 = 28;

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("a description or at least one tag is required")]
    EmptyDescription,
    #[error("'{description}' is already running")]
    AlreadyRunning { description: String },
    #[error("no running records{}", tag_suffix(.tags))]
    NothingRunning { tags: Vec<String> },
    #[error("no record to resume{}", tag_suffix(.tags))]
    NothingToResume { tags: Vec<String> },
    #[error("cannot place {at} in the local calendar")]
    Calendar { at: DateTime<Utc> },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

fn tag_suffix(tags: &[String]) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!(" matching {}", tags.join(" "))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackingOutcome {
    pub started: Vec<Record>,
    pub stopped: Vec<Record>,
    pub changed: Vec<Record>,
    /// Keys that were asked for but not found.
    pub missing: Vec<String>,
    pub commit: CommitReport,
}

/// Combine tags and free text into one normalized description.
pub fn compose_description(tags: &[String], text: &str) -> String {
    let tags: Vec<String> = tags.iter().map(|tag| normalize_tag(tag)).collect();
    normalize_description(&format!("{} {}", tags.join(" "), text))
}

fn everything(now: DateTime<Utc>) -> TimeWindow {
    TimeWindow::new(default_range_start(), now + Duration::days(1))
}

/// Stop a running record at `now`. A record started in the same second
/// closes one second after its start so it no longer reads as running.
fn close(record: &Record, now: DateTime<Utc>) -> Result<Record, RecordError> {
    let at = if now > record.t_start {
        now
    } else {
        record.t_start + Duration::seconds(1)
    };
    record.stop(at, now)
}

/// Visible running records, oldest first.
pub fn running_records<R: RecordRepository + ?Sized>(
    repo: &mut R,
    now: DateTime<Utc>,
) -> Result<Vec<Record>, RepositoryError> {
    let mut running: Vec<Record> = repo
        .list_records(&everything(now))?
        .into_iter()
        .filter(|record| record.is_running() && !record.hidden)
        .collect();
    running.sort_by(|a, b| a.t_start.cmp(&b.t_start).then_with(|| a.key.cmp(&b.key)));
    Ok(running)
}

/// Start a new record. Unless `keep` is set, every running record is stopped
/// at the same instant.
pub fn start<R: RecordRepository + ?Sized>(
    repo: &mut R,
    description: &str,
    keep: bool,
) -> Result<TrackingOutcome, TrackingError> {
    let description = normalize_description(description);
    if description.is_empty() {
        return Err(TrackingError::EmptyDescription);
    }
    let now = repo.server_time()?;
    let running = running_records(repo, now)?;
    if running.iter().any(|record| record.description == description) {
        return Err(TrackingError::AlreadyRunning { description });
    }

    let started = Record::start(description, now);
    let mut stopped = Vec::new();
    if !keep {
        for record in &running {
            stopped.push(close(record, now)?);
        }
    }

    let mut batch = vec![started.clone()];
    batch.extend(stopped.iter().cloned());
    let commit = commit(repo, &batch, Mode::Apply)?;
    debug!(key = %started.key, stopped = stopped.len(), "started record");
    Ok(TrackingOutcome {
        started: vec![started],
        stopped,
        changed: Vec::new(),
        missing: Vec::new(),
        commit,
    })
}

/// Stop running records carrying any of `tags`, or all of them when empty.
pub fn stop<R: RecordRepository + ?Sized>(
    repo: &mut R,
    tags: &[String],
) -> Result<TrackingOutcome, TrackingError> {
    let now = repo.server_time()?;
    let targets: Vec<Record> = running_records(repo, now)?
        .into_iter()
        .filter(|record| matches_tags(record, tags, TagMatch::Any))
        .collect();
    if targets.is_empty() {
        return Err(TrackingError::NothingRunning {
            tags: tags.to_vec(),
        });
    }
    let stopped = targets
        .iter()
        .map(|record| close(record, now))
        .collect::<Result<Vec<_>, _>>()?;
    let commit = commit(repo, &stopped, Mode::Apply)?;
    Ok(TrackingOutcome {
        started: Vec::new(),
        stopped,
        changed: Vec::new(),
        missing: Vec::new(),
        commit,
    })
}

/// Restart the most recently finished record of the last four weeks that
/// carries all of `tags`.
pub fn resume<R: RecordRepository + ?Sized>(
    repo: &mut R,
    tags: &[String],
    keep: bool,
) -> Result<TrackingOutcome, TrackingError> {
    let now = repo.server_time()?;
    let window = TimeWindow::new(
        now - Duration::days(RESUME_LOOKBACK_DAYS),
        now + Duration::days(1),
    );
    let candidate = repo
        .list_records(&window)?
        .into_iter()
        .filter(|record| !record.hidden && !record.is_inverted())
        .filter(|record| matches_tags(record, tags, TagMatch::All))
        .max_by(|a, b| a.t_stop.cmp(&b.t_stop).then_with(|| a.key.cmp(&b.key)));
    match candidate {
        Some(record) => start(repo, &record.description, keep),
        None => Err(TrackingError::NothingToResume {
            tags: tags.to_vec(),
        }),
    }
}

/// Totals for the local day, week and month around the server clock.
pub fn status<R, Tz>(repo: &mut R, tz: &Tz) -> Result<StatusReport, TrackingError>
where
    R: RecordRepository + ?Sized,
    Tz: TimeZone,
{
    let now = repo.server_time()?;
    let periods = CalendarPeriods::containing(now, tz).ok_or(TrackingError::Calendar { at: now })?;
    let records = repo.list_records(&periods.covering())?;
    let running = running_records(repo, now)?;
    debug!(records = records.len(), running = running.len(), "status collected");
    Ok(StatusReport::build(&records, running, periods, now))
}

fn set_hidden<R: RecordRepository + ?Sized>(
    repo: &mut R,
    keys: &[String],
    hidden: bool,
) -> Result<TrackingOutcome, TrackingError> {
    let now = repo.server_time()?;
    let records = repo.list_records(&everything(now))?;
    let mut changed = Vec::new();
    let mut missing = Vec::new();
    for key in keys {
        match records.iter().find(|record| &record.key == key) {
            Some(record) if hidden => changed.push(record.hide(now)),
            Some(record) => changed.push(record.restore(now)),
            None => missing.push(key.clone()),
        }
    }
    let commit = commit(repo, &changed, Mode::Apply)?;
    Ok(TrackingOutcome {
        started: Vec::new(),
        stopped: Vec::new(),
        changed,
        missing,
        commit,
    })
}

/// Soft-delete records by key.
pub fn hide<R: RecordRepository + ?Sized>(
    repo: &mut R,
    keys: &[String],
) -> Result<TrackingOutcome, TrackingError> {
    set_hidden(repo, keys, true)
}

pub fn restore<R: RecordRepository + ?Sized>(
    repo: &mut R,
    keys: &[String],
) -> Result<TrackingOutcome, TrackingError> {
    set_hidden(repo, keys, false)
}
