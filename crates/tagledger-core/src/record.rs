use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Marker that opens a tag inside a description.
pub const TAG_MARKER: char = '#';

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record {key}: stop {stop} is before start {start}")]
    Inverted {
        key: String,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    },
    #[error("record {key} is not running")]
    NotRunning { key: String },
}

/// A single tracked time interval.
///
/// A record is running while `t_stop == t_start`. Deletion is soft: `hidden`
/// is set and the record stays in every collection that holds it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub description: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub t_start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub t_stop: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub hidden: bool,
}

/// Field changes accepted by [`Record::edit`]. `key` is deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordEdit {
    pub description: Option<String>,
    pub t_start: Option<DateTime<Utc>>,
    pub t_stop: Option<DateTime<Utc>>,
    pub hidden: Option<bool>,
}

pub fn new_key() -> String {
    Ulid::new().to_string().to_lowercase()
}

/// Truncate an instant to whole seconds.
pub fn to_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(at.timestamp(), 0).single().unwrap_or(at)
}

/// Compute the next `modified_at` so that it strictly advances past `previous`.
pub fn next_modified(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = to_seconds(now);
    if now > previous {
        now
    } else {
        previous + Duration::seconds(1)
    }
}

impl Record {
    /// Begin a new running record at `at`.
    pub fn start(description: impl Into<String>, at: DateTime<Utc>) -> Self {
        let at = to_seconds(at);
        Self {
            key: new_key(),
            description: normalize_description(&description.into()),
            t_start: at,
            t_stop: at,
            modified_at: at,
            hidden: false,
        }
    }

    /// Close a running record at `at`.
    pub fn stop(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<Self, RecordError> {
        if !self.is_running() {
            return Err(RecordError::NotRunning {
                key: self.key.clone(),
            });
        }
        let at = to_seconds(at);
        if at < self.t_start {
            return Err(RecordError::Inverted {
                key: self.key.clone(),
                start: self.t_start,
                stop: at,
            });
        }
        let mut next = self.clone();
        next.t_stop = at;
        next.modified_at = next_modified(self.modified_at, now);
        Ok(next)
    }

    /// Start a fresh record carrying this record's description and tags.
    pub fn resume(&self, at: DateTime<Utc>) -> Self {
        Self::start(self.description.clone(), at)
    }

    pub fn edit(&self, edit: RecordEdit, now: DateTime<Utc>) -> Result<Self, RecordError> {
        let mut next = self.clone();
        if let Some(description) = edit.description {
            next.description = normalize_description(&description);
        }
        if let Some(t_start) = edit.t_start {
            next.t_start = to_seconds(t_start);
        }
        if let Some(t_stop) = edit.t_stop {
            next.t_stop = to_seconds(t_stop);
        }
        if let Some(hidden) = edit.hidden {
            next.hidden = hidden;
        }
        if next.t_stop < next.t_start {
            return Err(RecordError::Inverted {
                key: next.key,
                start: next.t_start,
                stop: next.t_stop,
            });
        }
        next.modified_at = next_modified(self.modified_at, now);
        Ok(next)
    }

    pub fn hide(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.hidden = true;
        next.modified_at = next_modified(self.modified_at, now);
        next
    }

    pub fn restore(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.hidden = false;
        next.modified_at = next_modified(self.modified_at, now);
        next
    }

    pub fn is_running(&self) -> bool {
        self.t_stop == self.t_start
    }

    pub fn is_inverted(&self) -> bool {
        self.t_stop < self.t_start
    }

    /// End of the interval for overlap purposes. `None` means unbounded.
    pub fn open_end(&self) -> Option<DateTime<Utc>> {
        if self.is_running() {
            None
        } else {
            Some(self.t_stop)
        }
    }

    /// Elapsed time; running records are measured up to `now`.
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        let end = if self.is_running() { now } else { self.t_stop };
        let elapsed = end - self.t_start;
        if elapsed < Duration::zero() {
            Duration::zero()
        } else {
            elapsed
        }
    }

    pub fn tags(&self) -> Vec<String> {
        extract_tags(&self.description)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        let wanted = normalize_tag(tag);
        self.tags().iter().any(|t| t.eq_ignore_ascii_case(&wanted))
    }

    /// Same user-visible content, ignoring `key` and `modified_at`.
    pub fn same_content(&self, other: &Record) -> bool {
        self.description == other.description
            && self.t_start == other.t_start
            && self.t_stop == other.t_stop
            && self.hidden == other.hidden
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stop = if self.is_running() {
            "...".to_string()
        } else {
            self.t_stop.to_rfc3339()
        };
        write!(
            f,
            "{} [{} -> {}] {}",
            self.key,
            self.t_start.to_rfc3339(),
            stop,
            self.description
        )
    }
}

pub fn identity(a: &Record, b: &Record) -> bool {
    a.key == b.key
}

/// Half-open overlap test; running records extend without bound and touching
/// endpoints never overlap. Hidden records overlap nothing.
pub fn overlaps(a: &Record, b: &Record) -> bool {
    if a.hidden || b.hidden {
        return false;
    }
    let a_before_b_end = match b.open_end() {
        Some(end) => a.t_start < end,
        None => true,
    };
    let b_before_a_end = match a.open_end() {
        Some(end) => b.t_start < end,
        None => true,
    };
    a_before_b_end && b_before_a_end
}

/// Tags in order of first appearance, without duplicates.
pub fn extract_tags(description: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for word in description.split_whitespace() {
        if word.len() > 1 && word.starts_with(TAG_MARKER) {
            let tag = word.to_string();
            if !tags.iter().any(|existing| existing.eq_ignore_ascii_case(&tag)) {
                tags.push(tag);
            }
        }
    }
    tags
}

/// Prefix a bare tag with the marker.
pub fn normalize_tag(tag: &str) -> String {
    let trimmed = tag.trim();
    if trimmed.starts_with(TAG_MARKER) {
        trimmed.to_string()
    } else {
        format!("{}{}", TAG_MARKER, trimmed)
    }
}

/// Collapse whitespace runs (tabs and newlines included) into single spaces.
pub fn normalize_description(description: &str) -> String {
    description.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// True when the record shares any instant with the window.
    pub fn touches(&self, record: &Record) -> bool {
        let ends_after_start = match record.open_end() {
            Some(end) => end > self.start,
            None => true,
        };
        record.t_start < self.end && ends_after_start
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// Smallest window covering every record (running ones up to `now`).
    pub fn spanning(records: &[Record], now: DateTime<Utc>) -> Option<Self> {
        let start = records.iter().map(|r| r.t_start.min(r.t_stop)).min()?;
        let end = records
            .iter()
            .map(|r| if r.is_running() { now.max(r.t_start) } else { r.t_stop.max(r.t_start) })
            .max()?;
        Some(Self {
            start,
            end: end + Duration::seconds(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 12, h, m, 0).unwrap()
    }

    fn closed(key: &str, start: DateTime<Utc>, stop: DateTime<Utc>) -> Record {
        Record {
            key: key.to_string(),
            description: "work #dev".to_string(),
            t_start: start,
            t_stop: stop,
            modified_at: start,
            hidden: false,
        }
    }

    #[test]
    fn touching_boundaries_do_not_overlap() {
        let a = closed("a", at(9, 0), at(10, 0));
        let b = closed("b", at(10, 0), at(11, 0));
        assert!(!overlaps(&a, &b));
        assert!(!overlaps(&b, &a));
    }

    #[test]
    fn running_record_overlaps_anything_after_its_start() {
        let a = closed("a", at(9, 0), at(9, 0));
        let b = closed("b", at(9, 30), at(10, 0));
        let earlier = closed("c", at(7, 0), at(8, 0));
        assert!(overlaps(&a, &b));
        assert!(!overlaps(&a, &earlier));
    }

    #[test]
    fn hidden_records_never_overlap() {
        let a = closed("a", at(9, 0), at(11, 0));
        let mut b = closed("b", at(10, 0), at(12, 0));
        assert!(overlaps(&a, &b));
        b.hidden = true;
        assert!(!overlaps(&a, &b));
    }

    #[test]
    fn start_then_stop_advances_modified_at() {
        let record = Record::start("#dev  write\ttests", at(9, 0));
        assert!(record.is_running());
        assert_eq!(record.description, "#dev write tests");
        // A lagging clock must still advance modified_at.
        let stopped = record.stop(at(9, 45), at(9, 0)).expect("stop");
        assert!(!stopped.is_running());
        assert!(stopped.modified_at > record.modified_at);
    }

    #[test]
    fn stop_rejects_inverted_interval() {
        let record = Record::start("x", at(9, 0));
        let err = record.stop(at(8, 0), at(9, 5)).unwrap_err();
        assert!(matches!(err, RecordError::Inverted { .. }));
    }

    #[test]
    fn edit_keeps_key_and_rejects_inversion() {
        let record = closed("a", at(9, 0), at(10, 0));
        let edited = record
            .edit(
                RecordEdit {
                    description: Some("other".to_string()),
                    ..Default::default()
                },
                at(12, 0),
            )
            .expect("edit");
        assert_eq!(edited.key, "a");
        assert_eq!(edited.modified_at, at(12, 0));

        let err = record
            .edit(
                RecordEdit {
                    t_stop: Some(at(8, 0)),
                    ..Default::default()
                },
                at(12, 0),
            )
            .unwrap_err();
        assert!(matches!(err, RecordError::Inverted { .. }));
    }

    #[test]
    fn resume_issues_a_fresh_key() {
        let record = closed("a", at(9, 0), at(10, 0));
        let resumed = record.resume(at(11, 0));
        assert_ne!(resumed.key, record.key);
        assert_eq!(resumed.description, record.description);
        assert!(resumed.is_running());
    }

    #[test]
    fn hide_and_restore_round_trip_the_flag() {
        let record = closed("a", at(9, 0), at(10, 0));
        let hidden = record.hide(at(11, 0));
        assert!(hidden.hidden);
        let restored = hidden.restore(at(11, 0));
        assert!(!restored.hidden);
        assert!(restored.modified_at > hidden.modified_at);
    }

    #[test]
    fn extract_tags_deduplicates_in_order() {
        assert_eq!(
            extract_tags("fix #api and #db then #api again #"),
            vec!["#api".to_string(), "#db".to_string()]
        );
    }

    #[test]
    fn window_touches_running_records_started_before_it() {
        let window = TimeWindow::new(at(12, 0), at(13, 0));
        let running = closed("r", at(8, 0), at(8, 0));
        let before = closed("b", at(8, 0), at(12, 0));
        assert!(window.touches(&running));
        assert!(!window.touches(&before));
    }
}
