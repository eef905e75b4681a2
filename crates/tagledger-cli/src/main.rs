mod api;
mod snapshot;
mod version;

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Local, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::json;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use tagledger_core::audit::record_applied;
use tagledger_core::commit::{CommitReport, Mode};
use tagledger_core::config::{
    config_filename_candidates, global_config_path, parse_delimiter, resolve_config,
    resolve_tagledger_home_dir, write_default_config, ResolvedConfig,
};
use tagledger_core::diagnostics::{diagnose, DiagnoseOptions, Severity};
use tagledger_core::interchange::{export_csv, ExportOptions, ImportOptions};
use tagledger_core::poller::{CancelFlag, LivePoller, PollError, PollerOptions};
use tagledger_core::reconcile::{run_import, RowOutcome};
use tagledger_core::repair::{run_repair, RepairOutcome};
use tagledger_core::summary::{filter_by_tags, tag_stats, total_time, TagMatch};
use tagledger_core::timeparse::{resolve_range, ResolverOptions};
use tagledger_core::tracking::{self, compose_description, TrackingError, TrackingOutcome};
use tagledger_core::{ExitStatus, LedgerError, Record, RecordRepository, RepositoryError, TimeWindow};
use tagledger_render::{
    import_json, render_import, render_plan, render_records, render_report, render_status,
    render_summary, render_tracking, to_json,
};

use crate::api::HttpRepository;
use crate::snapshot::SnapshotRepository;

const DEFAULT_BASE_URL: &str = "https://timetagger.io/timetagger/";
const LOG_ENV: &str = "TAGLEDGER_LOG";

#[derive(Parser)]
#[command(
    name = "tagledger",
    version = version::FULL,
    about = "Diagnose, repair and reconcile TimeTagger records"
)]
struct Cli {
    /// Use a local JSON snapshot instead of the web API.
    #[arg(long, global = true, env = "TAGLEDGER_OFFLINE", value_name = "FILE")]
    offline: Option<PathBuf>,
    /// Machine-readable output.
    #[arg(long, global = true)]
    json: bool,
    /// Debug logging on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config file with the server URL and API token
    Setup {
        #[arg(long, default_value = DEFAULT_BASE_URL)]
        base_url: String,
        #[arg(long, default_value = "")]
        api_token: String,
        /// Write `.tagledger.toml` in the current directory instead of the global config
        #[arg(long)]
        project: bool,
        #[arg(long)]
        force: bool,
    },
    /// Report overlaps, stale running records and other problems
    Diagnose {
        /// Plan and commit repairs
        #[arg(long)]
        fix: bool,
        #[arg(long, requires = "fix")]
        dry_run: bool,
        /// Refuse to repair while fatal findings exist
        #[arg(long, requires = "fix")]
        strict: bool,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        threshold_hours: Option<u64>,
    },
    /// Write records as CSV
    Export {
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// Only running records, whenever they started
        #[arg(long, conflicts_with_all = ["start", "end"])]
        running: bool,
        /// Include hidden records and a `hidden` column
        #[arg(long)]
        hidden: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        delimiter: Option<String>,
        tags: Vec<String>,
    },
    /// Reconcile a CSV file against the stored records
    Import {
        /// Read from stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// `any` or `all`
        #[arg(long = "match", default_value = "any")]
        tag_match: String,
        #[arg(long)]
        delimiter: Option<String>,
        tags: Vec<String>,
    },
    /// List records with a per-tag summary
    Show {
        #[arg(long, default_value = "today")]
        start: String,
        #[arg(long)]
        end: Option<String>,
        /// Re-render whenever the records change
        #[arg(long)]
        follow: bool,
        #[arg(long)]
        hidden: bool,
        #[arg(long)]
        show_keys: bool,
        /// Only print the summary
        #[arg(long)]
        summary: bool,
        /// Seconds between fetches when following
        #[arg(long)]
        interval: Option<u64>,
        /// Stop following after this many fetches
        #[arg(long, requires = "follow")]
        polls: Option<usize>,
        #[arg(long = "match", default_value = "any")]
        tag_match: String,
        tags: Vec<String>,
    },
    /// Totals for today, this week and this month, and what is running
    Status,
    /// Start tracking; stops running records unless --keep
    Start {
        tags: Vec<String>,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(long)]
        keep: bool,
    },
    /// Stop running records, optionally only those with the given tags
    Stop { tags: Vec<String> },
    /// Restart the most recent record with the given tags
    Resume {
        tags: Vec<String>,
        #[arg(long)]
        keep: bool,
    },
    /// Hide records by key
    Remove {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Unhide records by key
    Restore {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Print version information
    Version,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and --version also arrive here, on stdout.
            let failed = err.use_stderr();
            let _ = err.print();
            return if failed {
                ExitCode::from(ExitStatus::Usage.code())
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(status) => ExitCode::from(status.code()),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_status_for(&err).code())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn exit_status_for(err: &anyhow::Error) -> ExitStatus {
    if let Some(err) = err.downcast_ref::<LedgerError>() {
        return err.exit_status();
    }
    if err.downcast_ref::<RepositoryError>().is_some() || err.downcast_ref::<PollError>().is_some()
    {
        return ExitStatus::RepositoryFailed;
    }
    if let Some(TrackingError::Repository(_)) = err.downcast_ref::<TrackingError>() {
        return ExitStatus::RepositoryFailed;
    }
    ExitStatus::Usage
}

fn run(cli: Cli) -> Result<ExitStatus> {
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(ExitStatus::Clean);
    };
    match command {
        Command::Version => {
            println!("tagledger {}", version::FULL);
            Ok(ExitStatus::Clean)
        }
        Command::Setup {
            base_url,
            api_token,
            project,
            force,
        } => setup(&base_url, &api_token, project, force, cli.json),
        command => {
            let cwd = std::env::current_dir().context("current directory")?;
            let config = resolve_config(&cwd).map_err(LedgerError::from)?;
            debug!(
                base_url = ?config.base_url.value,
                source = config.base_url.source,
                "configuration resolved"
            );
            let mut repo = open_repository(cli.offline.as_deref(), &config)?;
            let ctx = Session {
                json: cli.json,
                config,
            };
            dispatch(&ctx, repo.as_mut(), command)
        }
    }
}

struct Session {
    json: bool,
    config: ResolvedConfig,
}

impl Session {
    fn resolver(&self) -> ResolverOptions {
        ResolverOptions {
            date_order: self.config.date_order.value,
        }
    }

    fn window(
        &self,
        start: Option<&str>,
        end: Option<&str>,
        anchor: DateTime<Utc>,
    ) -> Result<TimeWindow, LedgerError> {
        Ok(resolve_range(start, end, anchor, &Local, &self.resolver())?)
    }

    fn delimiter(&self, flag: Option<&str>) -> Result<u8, LedgerError> {
        match flag {
            Some(text) => Ok(parse_delimiter(text)?),
            None => Ok(self.config.csv_delimiter.value),
        }
    }
}

fn open_repository(
    offline: Option<&Path>,
    config: &ResolvedConfig,
) -> Result<Box<dyn RecordRepository>> {
    if let Some(path) = offline {
        debug!(path = %path.display(), "using offline snapshot");
        return Ok(Box::new(SnapshotRepository::open(path)));
    }
    let base_url = config
        .base_url
        .value
        .as_deref()
        .ok_or_else(|| anyhow!("no base_url configured; run `tagledger setup` or pass --offline"))?;
    let token = config
        .api_token
        .value
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| anyhow!("no api_token configured; run `tagledger setup` or set TAGLEDGER_API_TOKEN"))?;
    Ok(Box::new(HttpRepository::new(
        base_url,
        token,
        config.request_timeout(),
    )))
}

fn dispatch(ctx: &Session, repo: &mut dyn RecordRepository, command: Command) -> Result<ExitStatus> {
    match command {
        Command::Diagnose {
            fix,
            dry_run,
            strict,
            start,
            end,
            threshold_hours,
        } => {
            let threshold = threshold_hours
                .map(|hours| Duration::hours(hours.min(876_000) as i64))
                .unwrap_or_else(|| ctx.config.stale_threshold());
            let options = DiagnoseOptions::default().with_stale_threshold(threshold);
            let anchor = repo.server_time()?;
            let window = ctx.window(start.as_deref(), end.as_deref(), anchor)?;
            if fix {
                repair(ctx, repo, &window, &options, strict, Mode::from_dry_run(dry_run))
            } else {
                let records = repo.list_records(&window)?;
                let report = diagnose(&records, anchor, &options);
                if ctx.json {
                    println!("{}", to_json(&report)?);
                } else {
                    print!("{}", render_report(&report));
                }
                Ok(report.exit_status())
            }
        }
        Command::Export {
            start,
            end,
            running,
            hidden,
            output,
            delimiter,
            tags,
        } => {
            let anchor = repo.server_time()?;
            let candidates = if running {
                tracking::running_records(repo, anchor)?
            } else {
                let window = ctx.window(start.as_deref(), end.as_deref(), anchor)?;
                repo.list_records(&window)?
            };
            let records = filter_by_tags(&candidates, &tags, TagMatch::Any);
            let options = ExportOptions {
                include_hidden: hidden,
                delimiter: ctx.delimiter(delimiter.as_deref())?,
                now: anchor,
            };
            let csv = export_csv(&records, &options).map_err(LedgerError::from)?;
            match output {
                Some(path) => {
                    fs::write(&path, &csv)
                        .with_context(|| format!("write {}", path.display()))?;
                    eprintln!("Exported {} record(s) to {}", records.len(), path.display());
                }
                None => io::stdout().write_all(csv.as_bytes())?,
            }
            Ok(ExitStatus::Clean)
        }
        Command::Import {
            file,
            dry_run,
            start,
            end,
            tag_match,
            delimiter,
            tags,
        } => {
            let input = match &file {
                Some(path) => fs::read_to_string(path)
                    .with_context(|| format!("read {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    io::stdin().read_to_string(&mut buf).context("read stdin")?;
                    buf
                }
            };
            let window = if start.is_some() || end.is_some() {
                let anchor = repo.server_time()?;
                Some(ctx.window(start.as_deref(), end.as_deref(), anchor)?)
            } else {
                None
            };
            let options = ImportOptions {
                delimiter: ctx.delimiter(delimiter.as_deref())?,
                resolver: ctx.resolver(),
                tags,
                tag_match: parse_match(&tag_match)?,
                window,
            };
            let mode = Mode::from_dry_run(dry_run);
            let outcome = run_import(repo, &input, &Local, &options, mode)?;
            let changes: Vec<(Option<Record>, Record)> = outcome
                .plan
                .outcomes
                .iter()
                .filter_map(|row| match row {
                    RowOutcome::Insert { record, .. } => Some((None, record.clone())),
                    RowOutcome::Update { before, after, .. } => {
                        Some((Some(before.clone()), after.clone()))
                    }
                    _ => None,
                })
                .collect();
            audit("import", &changes, &outcome.commit);
            if ctx.json {
                println!("{}", serde_json::to_string_pretty(&import_json(&outcome))?);
            } else {
                print!("{}", render_import(&outcome));
            }
            let mut status = ExitStatus::Clean;
            if outcome.plan.counts().errors > 0 {
                status = status.worst(ExitStatus::Findings);
            }
            Ok(status.worst(commit_status(&outcome.commit)))
        }
        Command::Show {
            start,
            end,
            follow,
            hidden,
            show_keys,
            summary,
            interval,
            polls,
            tag_match,
            tags,
        } => {
            let view = ShowView {
                hidden,
                show_keys,
                summary_only: summary,
                tags,
                tag_match: parse_match(&tag_match)?,
            };
            if follow {
                return follow_records(ctx, repo, &view, &start, end.as_deref(), interval, polls);
            }
            let anchor = repo.server_time()?;
            let window = ctx.window(Some(start.as_str()), end.as_deref(), anchor)?;
            let records = view.select(&repo.list_records(&window)?);
            print!("{}", view.frame(ctx.json, &records, &window, anchor)?);
            Ok(ExitStatus::Clean)
        }
        Command::Status => {
            let report = tracking::status(repo, &Local)?;
            if ctx.json {
                println!("{}", to_json(&report)?);
            } else {
                print!("{}", render_status(&report, &Local));
            }
            Ok(ExitStatus::Clean)
        }
        Command::Start {
            tags,
            description,
            keep,
        } => {
            let description = compose_description(&tags, description.as_deref().unwrap_or(""));
            let outcome = tracking::start(repo, &description, keep)?;
            print_tracking(ctx, &outcome)
        }
        Command::Stop { tags } => match tracking::stop(repo, &tags) {
            Err(err @ TrackingError::NothingRunning { .. }) => {
                println!("{err}");
                Ok(ExitStatus::Clean)
            }
            other => print_tracking(ctx, &other?),
        },
        Command::Resume { tags, keep } => {
            let outcome = tracking::resume(repo, &tags, keep)?;
            print_tracking(ctx, &outcome)
        }
        Command::Remove { keys } => {
            let outcome = tracking::hide(repo, &keys)?;
            print_tracking(ctx, &outcome)
        }
        Command::Restore { keys } => {
            let outcome = tracking::restore(repo, &keys)?;
            print_tracking(ctx, &outcome)
        }
        Command::Setup { .. } | Command::Version => Ok(ExitStatus::Clean),
    }
}

fn setup(base_url: &str, api_token: &str, project: bool, force: bool, json: bool) -> Result<ExitStatus> {
    let path = if project {
        std::env::current_dir()
            .context("current directory")?
            .join(config_filename_candidates()[0])
    } else {
        global_config_path().ok_or_else(|| anyhow!("cannot determine the tagledger home directory"))?
    };
    let written = write_default_config(&path, base_url, api_token, force).map_err(LedgerError::from)?;
    if json {
        println!("{}", json!({ "ok": true, "path": written.display().to_string() }));
    } else {
        println!("Wrote config to {}", written.display());
    }
    Ok(ExitStatus::Clean)
}

fn repair(
    ctx: &Session,
    repo: &mut dyn RecordRepository,
    window: &TimeWindow,
    options: &DiagnoseOptions,
    strict: bool,
    mode: Mode,
) -> Result<ExitStatus> {
    let outcome = run_repair(repo, window, options, strict, mode)?;
    let changes: Vec<(Option<Record>, Record)> = outcome
        .plan
        .changes
        .iter()
        .map(|change| (Some(change.before.clone()), change.after.clone()))
        .collect();
    audit("repair", &changes, &outcome.commit);
    if ctx.json {
        println!("{}", to_json(&outcome)?);
    } else {
        print!("{}", render_report(&outcome.report));
        print!("{}", render_plan(&outcome.plan, &outcome.commit));
    }
    Ok(repair_status(&outcome, mode))
}

/// A dry run reports what was found; a real run reports what is left.
fn repair_status(outcome: &RepairOutcome, mode: Mode) -> ExitStatus {
    let remaining = match mode {
        Mode::DryRun => outcome.report.exit_status(),
        Mode::Apply => {
            if outcome
                .plan
                .manual_review
                .iter()
                .any(|finding| finding.severity() == Severity::Fatal)
            {
                ExitStatus::Fatal
            } else if outcome.plan.manual_review.is_empty() {
                ExitStatus::Clean
            } else {
                ExitStatus::Findings
            }
        }
    };
    remaining.worst(commit_status(&outcome.commit))
}

fn commit_status(commit: &CommitReport) -> ExitStatus {
    if commit.has_failures() {
        ExitStatus::RepositoryFailed
    } else {
        ExitStatus::Clean
    }
}

fn audit(action: &str, changes: &[(Option<Record>, Record)], commit: &CommitReport) {
    if commit.applied_count() == 0 {
        return;
    }
    let Some(home) = resolve_tagledger_home_dir() else {
        warn!("no home directory; applied changes were not written to the audit log");
        return;
    };
    match record_applied(&home, action, changes, commit, Utc::now()) {
        Ok(written) => debug!(written, "audit log updated"),
        Err(err) => warn!(error = %err, "failed to write audit log"),
    }
}

fn parse_match(value: &str) -> Result<TagMatch, LedgerError> {
    TagMatch::parse(value)
        .ok_or_else(|| LedgerError::Invalid(format!("--match must be `any` or `all`, got '{value}'")))
}

fn print_tracking(ctx: &Session, outcome: &TrackingOutcome) -> Result<ExitStatus> {
    if ctx.json {
        println!("{}", to_json(outcome)?);
    } else {
        print!("{}", render_tracking(outcome));
    }
    let status = if outcome.missing.is_empty() {
        ExitStatus::Clean
    } else {
        ExitStatus::Findings
    };
    Ok(status.worst(commit_status(&outcome.commit)))
}

struct ShowView {
    hidden: bool,
    show_keys: bool,
    summary_only: bool,
    tags: Vec<String>,
    tag_match: TagMatch,
}

impl ShowView {
    fn select(&self, records: &[Record]) -> Vec<Record> {
        let visible: Vec<Record> = records
            .iter()
            .filter(|record| self.hidden || !record.hidden)
            .cloned()
            .collect();
        filter_by_tags(&visible, &self.tags, self.tag_match)
    }

    fn frame(
        &self,
        json: bool,
        records: &[Record],
        window: &TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<String> {
        if json {
            let value = json!({
                "window": window,
                "now": now.to_rfc3339(),
                "total_secs": total_time(records, window, now).num_seconds(),
                "tags": tag_stats(records, now),
                "records": if self.summary_only { Vec::new() } else { records.to_vec() },
            });
            return Ok(format!("{}\n", serde_json::to_string(&value)?));
        }
        let mut out = String::new();
        if !self.summary_only {
            out.push_str(&render_records(records, now, &Local, self.show_keys));
            out.push('\n');
        }
        out.push_str(&render_summary(records, window, now));
        Ok(out)
    }
}

/// Keep the previous window when a later resolution fails.
fn window_or(resolved: Result<TimeWindow, LedgerError>, fallback: TimeWindow) -> TimeWindow {
    match resolved {
        Ok(window) => window,
        Err(err) => {
            warn!(error = %err, "could not resolve the show range, keeping the previous window");
            fallback
        }
    }
}

fn follow_records(
    ctx: &Session,
    repo: &mut dyn RecordRepository,
    view: &ShowView,
    start: &str,
    end: Option<&str>,
    interval: Option<u64>,
    polls: Option<usize>,
) -> Result<ExitStatus> {
    // Validate the range once; later resolutions only move the anchor.
    let anchor = repo.server_time()?;
    let first = ctx.window(Some(start), end, anchor)?;

    let cancel = CancelFlag::new();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, cancel.handle())
            .context("install signal handler")?;
    }

    let options = PollerOptions {
        interval: interval
            .map(std::time::Duration::from_secs)
            .unwrap_or_else(|| ctx.config.poll_interval()),
        max_iterations: polls,
        diagnose: DiagnoseOptions::default().with_stale_threshold(ctx.config.stale_threshold()),
        ..PollerOptions::default()
    };
    let mut poller = LivePoller::with_options(options);
    let mut failed_render = None;
    let summary = poller.run(
        repo,
        |now| window_or(ctx.window(Some(start), end, now), first),
        &cancel,
        |update| {
            let records = view.select(&update.records);
            let frame = match view.frame(ctx.json, &records, &update.window, update.now) {
                Ok(frame) => frame,
                Err(err) => {
                    failed_render = Some(err);
                    cancel.cancel();
                    return;
                }
            };
            let clear = if ctx.json { "" } else { "\x1b[2J\x1b[H" };
            let mut stdout = io::stdout().lock();
            let _ = write!(stdout, "{clear}{frame}");
            let _ = stdout.flush();
        },
    )?;
    if let Some(err) = failed_render {
        return Err(err);
    }
    debug!(
        iterations = summary.iterations,
        renders = summary.renders,
        cancelled = summary.cancelled,
        "stopped following"
    );
    Ok(ExitStatus::Clean)
}
