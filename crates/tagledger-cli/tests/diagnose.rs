use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 12, h, m, 0).unwrap()
}

fn record(key: &str, start: DateTime<Utc>, stop: DateTime<Utc>) -> Value {
    json!({
        "key": key,
        "description": format!("#work {key}"),
        "t_start": start.timestamp(),
        "t_stop": stop.timestamp(),
        "modified_at": start.timestamp(),
        "hidden": false,
    })
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(records: Vec<Value>) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let snapshot = json!({ "server_time": at(12, 0).timestamp(), "records": records });
        std::fs::write(
            dir.path().join("records.json"),
            serde_json::to_string_pretty(&snapshot).expect("json"),
        )
        .expect("write snapshot");
        Self { dir }
    }

    fn snapshot(&self) -> PathBuf {
        self.dir.path().join("records.json")
    }

    fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_tagledger"))
            .current_dir(self.dir.path())
            .env("TZ", "UTC")
            .env("TAGLEDGER_HOME", self.home())
            .env_remove("TAGLEDGER_API_TOKEN")
            .env_remove("TAGLEDGER_LOG")
            .env_remove("RUST_LOG")
            .arg("--offline")
            .arg(self.snapshot())
            .args(args)
            .output()
            .expect("run tagledger")
    }

    fn records(&self) -> Vec<Value> {
        read_records(&self.snapshot())
    }
}

fn read_records(path: &Path) -> Vec<Value> {
    let text = std::fs::read_to_string(path).expect("read snapshot");
    let value: Value = serde_json::from_str(&text).expect("snapshot json");
    value["records"].as_array().cloned().unwrap_or_default()
}

fn overlapping() -> Vec<Value> {
    vec![
        record("a", at(9, 0), at(11, 0)),
        record("b", at(10, 0), at(12, 0)),
    ]
}

#[test]
fn clean_records_exit_zero() {
    let ws = Workspace::new(vec![
        record("a", at(8, 0), at(9, 0)),
        record("b", at(9, 0), at(10, 0)),
    ]);
    let out = ws.run(&["diagnose"]);
    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("No problems found in 2 record(s)"), "{stdout}");
}

#[test]
fn overlaps_exit_one_and_report_as_json() {
    let ws = Workspace::new(overlapping());
    let out = ws.run(&["diagnose", "--json"]);
    assert_eq!(out.status.code(), Some(1));
    let report: Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(report["checked"], 2);
    let findings = report["findings"].as_array().expect("findings");
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0]["kind"], "overlap_found");
}

#[test]
fn duplicate_keys_are_fatal() {
    let ws = Workspace::new(vec![
        record("dup", at(8, 0), at(9, 0)),
        record("dup", at(10, 0), at(11, 0)),
    ]);
    let out = ws.run(&["diagnose"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn fix_dry_run_leaves_the_snapshot_untouched() {
    let ws = Workspace::new(overlapping());
    let before = std::fs::read(ws.snapshot()).expect("read");

    let out = ws.run(&["diagnose", "--fix", "--dry-run"]);
    assert_eq!(out.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("trim"), "{stdout}");

    assert_eq!(std::fs::read(ws.snapshot()).expect("read"), before);
    assert!(!ws.home().join("audit.log").exists());
}

#[test]
fn fix_applies_repairs_and_writes_the_audit_log() {
    let ws = Workspace::new(overlapping());
    let out = ws.run(&["diagnose", "--fix"]);
    assert_eq!(
        out.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    let records = ws.records();
    let a = records
        .iter()
        .find(|r| r["key"] == "a")
        .expect("a still present");
    assert_eq!(a["t_stop"], at(10, 0).timestamp());

    let again = ws.run(&["diagnose"]);
    assert_eq!(again.status.code(), Some(0));

    let audit = std::fs::read_to_string(ws.home().join("audit.log")).expect("audit log");
    let lines: Vec<&str> = audit.lines().collect();
    assert_eq!(lines.len(), 1);
    let event: Value = serde_json::from_str(lines[0]).expect("event");
    assert_eq!(event["action"], "repair");
    assert_eq!(event["key"], "a");
    assert_eq!(event["before"]["t_stop"], at(11, 0).timestamp());
}

#[test]
fn strict_fix_refuses_fatal_findings() {
    let ws = Workspace::new(vec![
        record("dup", at(8, 0), at(9, 0)),
        record("dup", at(10, 0), at(11, 0)),
        record("x", at(9, 30), at(10, 30)),
    ]);
    let before = std::fs::read(ws.snapshot()).expect("read");
    let out = ws.run(&["diagnose", "--fix", "--strict"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("fatal"));
    assert_eq!(std::fs::read(ws.snapshot()).expect("read"), before);
}

fn kinds(out: &Output) -> Vec<String> {
    let report: Value = serde_json::from_slice(&out.stdout).expect("json");
    report["findings"]
        .as_array()
        .expect("findings")
        .iter()
        .map(|finding| finding["kind"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn stale_threshold_flag_overrides_config() {
    let ws = Workspace::new(vec![
        record("old", at(6, 0), at(6, 0)),
        record("new", at(11, 0), at(11, 0)),
    ]);
    let default = ws.run(&["diagnose", "--json"]);
    assert_eq!(kinds(&default), vec!["overlap_found"]);

    let tight = ws.run(&["diagnose", "--threshold-hours", "2", "--json"]);
    assert_eq!(tight.status.code(), Some(1));
    assert_eq!(kinds(&tight), vec!["overlap_found", "stale_running"]);
}

#[test]
fn unparseable_range_is_a_usage_error() {
    let ws = Workspace::new(overlapping());
    let out = ws.run(&["diagnose", "--start", "the day after never"]);
    assert_eq!(out.status.code(), Some(4));
}

#[test]
fn unreadable_snapshot_is_a_repository_failure() {
    let ws = Workspace::new(Vec::new());
    std::fs::write(ws.snapshot(), "{ broken").expect("write");
    let out = ws.run(&["diagnose"]);
    assert_eq!(out.status.code(), Some(3));
}

#[test]
fn missing_server_configuration_is_a_usage_error() {
    let dir = TempDir::new().expect("tempdir");
    let out = Command::new(env!("CARGO_BIN_EXE_tagledger"))
        .current_dir(dir.path())
        .env("TAGLEDGER_HOME", dir.path().join("home"))
        .env_remove("TAGLEDGER_API_TOKEN")
        .env_remove("TAGLEDGER_OFFLINE")
        .arg("diagnose")
        .output()
        .expect("run tagledger");
    assert_eq!(out.status.code(), Some(4));
    assert!(String::from_utf8_lossy(&out.stderr).contains("tagledger setup"));
}
