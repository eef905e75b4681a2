//! CSV export and row-level CSV parsing.
//!
//! Export output is accepted by [`parse_csv`] unchanged, so exporting and
//! re-importing a set of records is a no-op.

use std::collections::HashMap;

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use thiserror::Error;
use tracing::debug;

use crate::record::{extract_tags, normalize_description, normalize_tag, Record, TimeWindow};
use crate::summary::{matches_tags, TagMatch};
use crate::timeparse::{resolve_instant, ResolverOptions, TimeParseError};

pub const EXPORT_COLUMNS: [&str; 7] = [
    "key",
    "description",
    "tags",
    "start",
    "stop",
    "duration",
    "modified",
];
pub const REQUIRED_COLUMNS: [&str; 4] = ["key", "description", "start", "stop"];

/// Failure that prevents reading or writing the file as a whole.
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV output is not valid UTF-8")]
    Encoding,
    #[error("CSV header is missing required column(s): {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

/// Failure confined to one data row. `row` is 1-based and excludes the header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("row {row}: missing value for '{column}'")]
    Missing { row: usize, column: String },
    #[error("row {row}: '{column}' value '{value}': {source}")]
    Time {
        row: usize,
        column: String,
        value: String,
        source: TimeParseError,
    },
    #[error("row {row}: stop {stop} is before start {start}")]
    Inverted {
        row: usize,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    },
    #[error("row {row}: '{column}' value '{value}' is invalid, expected {expected}")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
        expected: String,
    },
    #[error("row {row}: key '{key}' already used in row {first_row}")]
    DuplicateKey {
        row: usize,
        key: String,
        first_row: usize,
    },
    #[error("row {row}: malformed CSV: {reason}")]
    Malformed { row: usize, reason: String },
}

impl RowError {
    pub fn row(&self) -> usize {
        match self {
            RowError::Missing { row, .. }
            | RowError::Time { row, .. }
            | RowError::Inverted { row, .. }
            | RowError::InvalidValue { row, .. }
            | RowError::DuplicateKey { row, .. }
            | RowError::Malformed { row, .. } => *row,
        }
    }

    /// Coarse error class: parse, validation or identity.
    pub fn class(&self) -> &'static str {
        match self {
            RowError::Missing { .. } | RowError::Time { .. } | RowError::Malformed { .. } => {
                "parse"
            }
            RowError::Inverted { .. } | RowError::InvalidValue { .. } => "validation",
            RowError::DuplicateKey { .. } => "identity",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub include_hidden: bool,
    pub delimiter: u8,
    /// Used to measure running records.
    pub now: DateTime<Utc>,
}

impl ExportOptions {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            include_hidden: false,
            delimiter: b',',
            now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub delimiter: u8,
    pub resolver: ResolverOptions,
    pub tags: Vec<String>,
    pub tag_match: TagMatch,
    pub window: Option<TimeWindow>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            resolver: ResolverOptions::default(),
            tags: Vec::new(),
            tag_match: TagMatch::Any,
            window: None,
        }
    }
}

impl ImportOptions {
    /// True when `record` passes the tag and window filters.
    pub fn accepts(&self, record: &Record) -> bool {
        let in_window = self
            .window
            .as_ref()
            .map(|window| window.touches(record))
            .unwrap_or(true);
        in_window && matches_tags(record, &self.tags, self.tag_match)
    }
}

/// A successfully parsed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRow {
    pub row: usize,
    pub record: Record,
    /// `None` when the file carries no `hidden` value for this row.
    pub hidden: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCsv {
    pub rows: Vec<Result<CandidateRow, RowError>>,
}

impl ParsedCsv {
    pub fn candidates(&self) -> impl Iterator<Item = &CandidateRow> {
        self.rows.iter().filter_map(|row| row.as_ref().ok())
    }

    pub fn errors(&self) -> impl Iterator<Item = &RowError> {
        self.rows.iter().filter_map(|row| row.as_ref().err())
    }
}

/// Format a duration as `HH:MM:SS`; hours may exceed 24.
pub fn format_hms(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

pub fn format_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Write `records` as CSV, sorted by start then key.
pub fn export_csv(records: &[Record], options: &ExportOptions) -> Result<String, CsvError> {
    let mut selected: Vec<&Record> = records
        .iter()
        .filter(|record| options.include_hidden || !record.hidden)
        .collect();
    selected.sort_by(|a, b| a.t_start.cmp(&b.t_start).then_with(|| a.key.cmp(&b.key)));

    let mut writer = WriterBuilder::new()
        .delimiter(options.delimiter)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    let mut header: Vec<&str> = EXPORT_COLUMNS.to_vec();
    if options.include_hidden {
        header.push("hidden");
    }
    writer.write_record(&header)?;

    for record in &selected {
        let stop = if record.is_running() {
            String::new()
        } else {
            format_instant(record.t_stop)
        };
        let mut row = vec![
            record.key.clone(),
            normalize_description(&record.description),
            record.tags().join(" "),
            format_instant(record.t_start),
            stop,
            format_hms(record.duration(options.now)),
            format_instant(record.modified_at),
        ];
        if options.include_hidden {
            row.push(record.hidden.to_string());
        }
        writer.write_record(&row)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| CsvError::Io(err.into_error()))?;
    debug!(rows = selected.len(), "exported records");
    String::from_utf8(bytes).map_err(|_| CsvError::Encoding)
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.trim().to_lowercase(), idx))
        .collect()
}

fn get_field<'r>(
    record: &'r StringRecord,
    header_map: &HashMap<String, usize>,
    column: &str,
) -> Option<&'r str> {
    header_map
        .get(column)
        .and_then(|&idx| record.get(idx))
        .map(str::trim)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "y" => Some(true),
        "false" | "no" | "0" | "n" => Some(false),
        _ => None,
    }
}

/// Parse CSV text into candidate records, one outcome per data row.
///
/// Times are resolved in `tz` against `anchor`, so relative expressions such
/// as `yesterday 9:00` are accepted in the `start` and `stop` columns.
pub fn parse_csv<Tz: TimeZone>(
    input: &str,
    anchor: DateTime<Utc>,
    tz: &Tz,
    options: &ImportOptions,
) -> Result<ParsedCsv, CsvError> {
    if input.trim().is_empty() {
        return Err(CsvError::MissingColumns(
            REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect(),
        ));
    }
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .delimiter(options.delimiter)
        .from_reader(input.as_bytes());

    let headers = reader.headers()?.clone();
    let header_map = build_header_map(&headers);
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|column| !header_map.contains_key(**column))
        .map(|column| column.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(CsvError::MissingColumns(missing));
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut parsed = ParsedCsv::default();
    for (idx, result) in reader.records().enumerate() {
        let row = idx + 1;
        let outcome = match result {
            Ok(fields) => parse_row(row, &fields, &header_map, anchor, tz, options),
            Err(err) => Err(RowError::Malformed {
                row,
                reason: err.to_string(),
            }),
        };
        let outcome = outcome.and_then(|candidate| {
            match seen.get(&candidate.record.key) {
                Some(&first_row) => Err(RowError::DuplicateKey {
                    row,
                    key: candidate.record.key.clone(),
                    first_row,
                }),
                None => {
                    seen.insert(candidate.record.key.clone(), row);
                    Ok(candidate)
                }
            }
        });
        if let Err(err) = &outcome {
            debug!(row, error = %err, "row rejected");
        }
        parsed.rows.push(outcome);
    }
    Ok(parsed)
}

fn parse_row<Tz: TimeZone>(
    row: usize,
    fields: &StringRecord,
    header_map: &HashMap<String, usize>,
    anchor: DateTime<Utc>,
    tz: &Tz,
    options: &ImportOptions,
) -> Result<CandidateRow, RowError> {
    let required = |column: &str| {
        get_field(fields, header_map, column).ok_or_else(|| RowError::Missing {
            row,
            column: column.to_string(),
        })
    };
    let time = |column: &str, value: &str| {
        resolve_instant(value, anchor, tz, &options.resolver).map_err(|source| RowError::Time {
            row,
            column: column.to_string(),
            value: value.to_string(),
            source,
        })
    };

    let key = required("key")?;
    if key.is_empty() {
        return Err(RowError::Missing {
            row,
            column: "key".to_string(),
        });
    }
    let mut description = normalize_description(required("description")?);
    let start_text = required("start")?;
    if start_text.is_empty() {
        return Err(RowError::Missing {
            row,
            column: "start".to_string(),
        });
    }
    let stop_text = required("stop")?;

    let t_start = time("start", start_text)?;
    let t_stop = if stop_text.is_empty() {
        t_start
    } else {
        time("stop", stop_text)?
    };
    if t_stop < t_start {
        return Err(RowError::Inverted {
            row,
            start: t_start,
            stop: t_stop,
        });
    }

    if let Some(tags) = get_field(fields, header_map, "tags") {
        let present = extract_tags(&description);
        for tag in tags.split_whitespace().map(normalize_tag) {
            if tag.len() > 1 && !present.iter().any(|p| p.eq_ignore_ascii_case(&tag)) {
                description = format!("{description} {tag}").trim().to_string();
            }
        }
    }

    let modified_at = match get_field(fields, header_map, "modified") {
        Some(value) if !value.is_empty() => time("modified", value)?,
        _ => crate::record::to_seconds(anchor),
    };

    let hidden = match get_field(fields, header_map, "hidden") {
        Some(value) if !value.is_empty() => {
            Some(parse_bool(value).ok_or_else(|| RowError::InvalidValue {
                row,
                column: "hidden".to_string(),
                value: value.to_string(),
                expected: "true or false".to_string(),
            })?)
        }
        _ => None,
    };

    Ok(CandidateRow {
        row,
        record: Record {
            key: key.to_string(),
            description,
            t_start,
            t_stop,
            modified_at,
            hidden: hidden.unwrap_or(false),
        },
        hidden,
    })
}
