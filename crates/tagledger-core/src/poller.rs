//! Periodic fetch-and-diagnose loop with change detection and prompt
//! cancellation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::diagnostics::{diagnose, DiagnoseOptions, DiagnosticReport};
use crate::record::{Record, TimeWindow};
use crate::repository::{RecordRepository, RepositoryError};

pub const DEFAULT_TICK: StdDuration = StdDuration::from_millis(100);

#[derive(Debug, Error)]
pub enum PollError {
    #[error("polling stopped after {failures} consecutive failure(s): {source}")]
    Repository {
        failures: u32,
        source: RepositoryError,
    },
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for registration with signal handlers.
    pub fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Sleep for `total` in `tick` slices. Returns `false` when cancelled.
pub fn wait_cancellable(cancel: &CancelFlag, total: StdDuration, tick: StdDuration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(tick.min(deadline - now));
    }
}

/// Identity of a fetched record set: every key with its modification time and
/// hidden flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint(BTreeMap<String, Vec<(DateTime<Utc>, bool)>>);

impl Fingerprint {
    pub fn of(records: &[Record]) -> Self {
        let mut map: BTreeMap<String, Vec<(DateTime<Utc>, bool)>> = BTreeMap::new();
        for record in records {
            map.entry(record.key.clone())
                .or_default()
                .push((record.modified_at, record.hidden));
        }
        for entries in map.values_mut() {
            entries.sort();
        }
        Self(map)
    }
}

/// Data handed to the update callback.
#[derive(Debug, Clone)]
pub struct PollUpdate {
    pub iteration: usize,
    pub now: DateTime<Utc>,
    pub window: TimeWindow,
    pub records: Vec<Record>,
    pub report: DiagnosticReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub iterations: usize,
    pub renders: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct PollerOptions {
    pub interval: StdDuration,
    pub tick: StdDuration,
    /// Failures tolerated in a row before giving up; 0 stops on the first.
    pub max_consecutive_failures: u32,
    /// Stop after this many fetches.
    pub max_iterations: Option<usize>,
    pub diagnose: DiagnoseOptions,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(5),
            tick: DEFAULT_TICK,
            max_consecutive_failures: 0,
            max_iterations: None,
            diagnose: DiagnoseOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LivePoller {
    options: PollerOptions,
    previous: Option<Fingerprint>,
}

impl LivePoller {
    pub fn new(interval: StdDuration, tick: StdDuration) -> Self {
        Self::with_options(PollerOptions {
            interval,
            tick,
            ..PollerOptions::default()
        })
    }

    pub fn with_options(options: PollerOptions) -> Self {
        Self {
            options,
            previous: None,
        }
    }

    pub fn options(&self) -> &PollerOptions {
        &self.options
    }

    /// Fetch and diagnose once. Returns `None` when nothing changed since the
    /// previous successful fetch.
    pub fn poll_once<R, W>(
        &mut self,
        repo: &mut R,
        window_for: &mut W,
        iteration: usize,
    ) -> Result<Option<PollUpdate>, RepositoryError>
    where
        R: RecordRepository + ?Sized,
        W: FnMut(DateTime<Utc>) -> TimeWindow,
    {
        let now = repo.server_time()?;
        let window = window_for(now);
        let records = repo.list_records(&window)?;
        let fingerprint = Fingerprint::of(&records);
        if self.previous.as_ref() == Some(&fingerprint) {
            debug!(iteration, "no changes since last fetch");
            return Ok(None);
        }
        self.previous = Some(fingerprint);
        let report = diagnose(&records, now, &self.options.diagnose);
        Ok(Some(PollUpdate {
            iteration,
            now,
            window,
            records,
            report,
        }))
    }

    /// Poll until cancelled, the iteration limit is reached, or the repository
    /// keeps failing. `on_update` runs only when the record set changed.
    pub fn run<R, W, F>(
        &mut self,
        repo: &mut R,
        mut window_for: W,
        cancel: &CancelFlag,
        mut on_update: F,
    ) -> Result<PollSummary, PollError>
    where
        R: RecordRepository + ?Sized,
        W: FnMut(DateTime<Utc>) -> TimeWindow,
        F: FnMut(&PollUpdate),
    {
        let mut summary = PollSummary::default();
        let mut failures: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            summary.iterations += 1;
            match self.poll_once(repo, &mut window_for, summary.iterations) {
                Ok(update) => {
                    failures = 0;
                    if let Some(update) = update {
                        if cancel.is_cancelled() {
                            summary.cancelled = true;
                            break;
                        }
                        on_update(&update);
                        summary.renders += 1;
                    }
                }
                Err(source) => {
                    failures += 1;
                    if failures > self.options.max_consecutive_failures {
                        return Err(PollError::Repository { failures, source });
                    }
                    warn!(failures, error = %source, "poll failed, retrying");
                }
            }
            if let Some(limit) = self.options.max_iterations {
                if summary.iterations >= limit {
                    break;
                }
            }
            if !wait_cancellable(cancel, self.options.interval, self.options.tick) {
                summary.cancelled = true;
                break;
            }
        }
        debug!(
            iterations = summary.iterations,
            renders = summary.renders,
            "poller stopped"
        );
        Ok(summary)
    }
}
