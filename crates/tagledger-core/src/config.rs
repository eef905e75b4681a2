use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timeparse::DateOrder;

pub const DEFAULT_STALE_THRESHOLD_HOURS: u64 = 24;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const API_TOKEN_ENV: &str = "TAGLEDGER_API_TOKEN";
pub const HOME_ENV: &str = "TAGLEDGER_HOME";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("Config file already exists: {0}")]
    Exists(PathBuf),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    /// TimeTagger server, e.g. `https://timetagger.io/timetagger/`.
    pub base_url: Option<String>,
    pub api_token: Option<String>,
    pub stale_threshold_hours: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub date_order: Option<DateOrder>,
    /// Single character; `\t` is accepted for tab.
    pub csv_delimiter: Option<String>,
}

pub fn config_filename_candidates() -> [&'static str; 2] {
    [".tagledger.toml", ".tagledgerrc"]
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(".tagledger.toml")
}

pub fn resolve_user_home_dir() -> Option<PathBuf> {
    ["HOME", "USERPROFILE"].iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    })
}

pub fn resolve_tagledger_home_dir() -> Option<PathBuf> {
    if let Ok(value) = std::env::var(HOME_ENV) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    resolve_user_home_dir().map(|home| home.join(".tagledger"))
}

pub fn global_config_path() -> Option<PathBuf> {
    resolve_tagledger_home_dir().map(|home| home.join("config.toml"))
}

pub fn find_config_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    start
        .ancestors()
        .find(|candidate| {
            config_filename_candidates()
                .iter()
                .any(|name| candidate.join(name).is_file())
        })
        .map(Path::to_path_buf)
}

fn read_config_file(path: &Path) -> Result<LedgerConfig, ConfigError> {
    let text = fs::read_to_string(path)?;
    Ok(toml::from_str::<LedgerConfig>(&text)?)
}

/// Project config in `root`. A file that exists but fails to parse is an error.
pub fn load_config(root: &Path) -> Result<Option<LedgerConfig>, ConfigError> {
    for name in config_filename_candidates() {
        let path = root.join(name);
        if path.is_file() {
            return read_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

pub fn load_global_config() -> Result<Option<LedgerConfig>, ConfigError> {
    match global_config_path() {
        Some(path) if path.is_file() => read_config_file(&path).map(Some),
        _ => Ok(None),
    }
}

pub fn write_config(path: &Path, config: &LedgerConfig) -> Result<PathBuf, ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}

/// Commented template written by `setup`.
pub fn default_config_template(base_url: &str, api_token: &str) -> String {
    format!(
        "# tagledger configuration\n\
         base_url = \"{base_url}\"\n\
         api_token = \"{api_token}\"\n\
         \n\
         # Running records older than this are reported as stale.\n\
         stale_threshold_hours = {DEFAULT_STALE_THRESHOLD_HOURS}\n\
         poll_interval_secs = {DEFAULT_POLL_INTERVAL_SECS}\n\
         request_timeout_secs = {DEFAULT_REQUEST_TIMEOUT_SECS}\n\
         # auto, month_first or day_first\n\
         date_order = \"auto\"\n\
         csv_delimiter = \",\"\n"
    )
}

pub fn write_default_config(
    path: &Path,
    base_url: &str,
    api_token: &str,
    force: bool,
) -> Result<PathBuf, ConfigError> {
    if path.exists() && !force {
        return Err(ConfigError::Exists(path.to_path_buf()));
    }
    validate_base_url(base_url)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, default_config_template(base_url, api_token))?;
    Ok(path.to_path_buf())
}

pub fn validate_base_url(value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field: "base_url".to_string(),
            reason: format!("'{value}' must start with http:// or https://"),
        })
    }
}

pub fn parse_delimiter(value: &str) -> Result<u8, ConfigError> {
    let invalid = || ConfigError::Invalid {
        field: "csv_delimiter".to_string(),
        reason: format!("'{value}' is not a single ASCII character"),
    };
    match value {
        "\\t" | "\t" | "tab" => Ok(b'\t'),
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii() => Ok(c as u8),
                _ => Err(invalid()),
            }
        }
    }
}

/// A resolved value and where it came from: `project`, `global`, `env` or
/// `default`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedConfig {
    pub base_url: Sourced<Option<String>>,
    pub api_token: Sourced<Option<String>>,
    pub stale_threshold_hours: Sourced<u64>,
    pub poll_interval_secs: Sourced<u64>,
    pub request_timeout_secs: Sourced<u64>,
    pub date_order: Sourced<DateOrder>,
    pub csv_delimiter: Sourced<u8>,
    /// Project config directory, when one was found.
    pub project_root: Option<PathBuf>,
}

impl ResolvedConfig {
    pub fn stale_threshold(&self) -> Duration {
        // Capped at roughly a century.
        Duration::hours(self.stale_threshold_hours.value.min(876_000) as i64)
    }

    pub fn poll_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.poll_interval_secs.value)
    }

    pub fn request_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.request_timeout_secs.value)
    }
}

fn pick<T: Clone>(
    project: Option<&LedgerConfig>,
    global: Option<&LedgerConfig>,
    field: impl Fn(&LedgerConfig) -> Option<T>,
) -> Option<(T, &'static str)> {
    if let Some(value) = project.and_then(&field) {
        return Some((value, "project"));
    }
    global.and_then(&field).map(|value| (value, "global"))
}

fn with_default<T>(picked: Option<(T, &'static str)>, default: T) -> Sourced<T> {
    match picked {
        Some((value, source)) => Sourced { value, source },
        None => Sourced {
            value: default,
            source: "default",
        },
    }
}

/// Layer project config (found from `start` upwards) over global config over
/// built-in defaults. The API token environment variable beats both files.
pub fn resolve_config(start: &Path) -> Result<ResolvedConfig, ConfigError> {
    let project_root = find_config_root(start);
    let project = match project_root.as_deref() {
        Some(root) => load_config(root)?,
        None => None,
    };
    let global = load_global_config()?;
    let (project, global) = (project.as_ref(), global.as_ref());

    let base_url = pick(project, global, |c| c.base_url.clone());
    if let Some((url, _)) = &base_url {
        validate_base_url(url)?;
    }
    let env_token = std::env::var(API_TOKEN_ENV)
        .ok()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());
    let api_token = match env_token {
        Some(token) => Sourced {
            value: Some(token),
            source: "env",
        },
        None => match pick(project, global, |c| c.api_token.clone()) {
            Some((token, source)) => Sourced {
                value: Some(token),
                source,
            },
            None => Sourced {
                value: None,
                source: "default",
            },
        },
    };
    let csv_delimiter = match pick(project, global, |c| c.csv_delimiter.clone()) {
        Some((text, source)) => Sourced {
            value: parse_delimiter(&text)?,
            source,
        },
        None => Sourced {
            value: b',',
            source: "default",
        },
    };

    Ok(ResolvedConfig {
        base_url: match base_url {
            Some((url, source)) => Sourced {
                value: Some(url),
                source,
            },
            None => Sourced {
                value: None,
                source: "default",
            },
        },
        api_token,
        stale_threshold_hours: with_default(
            pick(project, global, |c| c.stale_threshold_hours),
            DEFAULT_STALE_THRESHOLD_HOURS,
        ),
        poll_interval_secs: with_default(
            pick(project, global, |c| c.poll_interval_secs),
            DEFAULT_POLL_INTERVAL_SECS,
        ),
        request_timeout_secs: with_default(
            pick(project, global, |c| c.request_timeout_secs),
            DEFAULT_REQUEST_TIMEOUT_SECS,
        ),
        date_order: with_default(pick(project, global, |c| c.date_order), DateOrder::Auto),
        csv_delimiter,
        project_root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use tempfile::TempDir;

    fn with_env_lock<T>(f: impl FnOnce() -> T) -> T {
        let _guard = crate::test_env::lock();
        f()
    }

    struct EnvGuard {
        saved: Vec<(&'static str, Option<OsString>)>,
    }

    impl EnvGuard {
        fn capture() -> Self {
            Self {
                saved: [HOME_ENV, API_TOKEN_ENV, "HOME"]
                    .into_iter()
                    .map(|name| (name, std::env::var_os(name)))
                    .collect(),
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(value) => std::env::set_var(name, value),
                    None => std::env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn write_and_read_config() {
        let temp = TempDir::new().expect("tempdir");
        let config = LedgerConfig {
            base_url: Some("https://timetagger.io/timetagger/".to_string()),
            stale_threshold_hours: Some(8),
            date_order: Some(DateOrder::DayFirst),
            ..Default::default()
        };
        write_config(&config_path(temp.path()), &config).expect("write config");
        let loaded = load_config(temp.path()).expect("load").expect("present");
        assert_eq!(loaded, config);
    }

    #[test]
    fn broken_project_config_is_an_error() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join(".tagledgerrc"), "stale_threshold_hours = \"x\"\n")
            .expect("write");
        assert!(matches!(load_config(temp.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn resolve_prefers_project_over_global_then_default() {
        with_env_lock(|| {
            let _env = EnvGuard::capture();
            let repo = TempDir::new().expect("repo tempdir");
            let home = TempDir::new().expect("home tempdir");
            std::env::set_var(HOME_ENV, home.path());
            std::env::remove_var(API_TOKEN_ENV);

            let resolved = resolve_config(repo.path()).expect("resolve");
            assert_eq!(resolved.stale_threshold_hours.value, 24);
            assert_eq!(resolved.stale_threshold_hours.source, "default");
            assert_eq!(resolved.base_url.value, None);

            fs::write(
                home.path().join("config.toml"),
                "stale_threshold_hours = 12\napi_token = \"global-token\"\n",
            )
            .expect("global config");
            let resolved = resolve_config(repo.path()).expect("resolve");
            assert_eq!(resolved.stale_threshold_hours.value, 12);
            assert_eq!(resolved.stale_threshold_hours.source, "global");

            fs::write(
                repo.path().join(".tagledger.toml"),
                "stale_threshold_hours = 6\ncsv_delimiter = \"\\\\t\"\n",
            )
            .expect("project config");
            let nested = repo.path().join("a").join("b");
            fs::create_dir_all(&nested).expect("nested");
            let resolved = resolve_config(&nested).expect("resolve");
            assert_eq!(resolved.stale_threshold_hours.value, 6);
            assert_eq!(resolved.stale_threshold_hours.source, "project");
            assert_eq!(resolved.csv_delimiter.value, b'\t');
            assert_eq!(resolved.api_token.source, "global");

            std::env::set_var(API_TOKEN_ENV, "env-token");
            let resolved = resolve_config(repo.path()).expect("resolve");
            assert_eq!(resolved.api_token.value.as_deref(), Some("env-token"));
            assert_eq!(resolved.api_token.source, "env");
        });
    }

    #[test]
    fn default_template_parses_and_refuses_overwrite() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("config.toml");
        write_default_config(&path, "https://example.org/timetagger/", "tok", false)
            .expect("write");
        let loaded = read_config_file(&path).expect("parse");
        assert_eq!(loaded.api_token.as_deref(), Some("tok"));
        assert_eq!(loaded.date_order, Some(DateOrder::Auto));
        assert!(matches!(
            write_default_config(&path, "https://example.org/", "tok", false),
            Err(ConfigError::Exists(_))
        ));
        assert!(matches!(
            write_default_config(&path, "example.org", "tok", true),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
