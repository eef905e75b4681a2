//! TimeTagger web API client.
//!
//! The API has no hidden flag; hidden records carry a `HIDDEN` description
//! prefix instead.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tagledger_core::record::{Record, TimeWindow};
use tagledger_core::repository::{RecordRepository, RepositoryError, UpsertOutcome, UpsertResult};

const HIDDEN_PREFIX: &str = "HIDDEN";

/// Record as exchanged with the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireRecord {
    pub key: String,
    pub t1: i64,
    pub t2: i64,
    pub mt: i64,
    pub ds: String,
    #[serde(default)]
    pub st: f64,
}

impl WireRecord {
    pub fn from_record(record: &Record) -> Self {
        let ds = if record.hidden {
            format!("{HIDDEN_PREFIX} {}", record.description)
                .trim_end()
                .to_string()
        } else {
            record.description.clone()
        };
        Self {
            key: record.key.clone(),
            t1: record.t_start.timestamp(),
            t2: record.t_stop.timestamp(),
            mt: record.modified_at.timestamp(),
            ds,
            st: 0.0,
        }
    }

    pub fn into_record(self) -> Result<Record, RepositoryError> {
        let instant = |secs: i64, field: &str| {
            Utc.timestamp_opt(secs, 0).single().ok_or_else(|| {
                RepositoryError::Decode(format!("record {}: {field} {secs} out of range", self.key))
            })
        };
        let t_start = instant(self.t1, "t1")?;
        let t_stop = instant(self.t2, "t2")?;
        let modified_at = instant(self.mt, "mt")?;
        let (hidden, description) = match self.ds.strip_prefix(HIDDEN_PREFIX) {
            Some(rest) => (true, rest.trim().to_string()),
            None => (false, self.ds.clone()),
        };
        Ok(Record {
            key: self.key,
            description,
            t_start,
            t_stop,
            modified_at,
            hidden,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    #[serde(default)]
    records: Vec<WireRecord>,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    #[serde(default)]
    accepted: Vec<String>,
    #[serde(default)]
    failed: Vec<String>,
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    server_time: f64,
}

/// Normalize a configured server URL to the `api/v2/` root.
pub fn api_root(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    let trimmed = trimmed
        .strip_suffix("/api/v2")
        .unwrap_or(trimmed);
    format!("{trimmed}/api/v2/")
}

pub struct HttpRepository {
    agent: ureq::Agent,
    api_root: String,
    token: String,
}

impl HttpRepository {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            api_root: api_root(base_url),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_root, path)
    }
}

fn map_error(err: ureq::Error) -> RepositoryError {
    match err {
        ureq::Error::Status(status, response) => RepositoryError::Status {
            status,
            body: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => RepositoryError::Transport(transport.to_string()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(response: ureq::Response) -> Result<T, RepositoryError> {
    response
        .into_json::<T>()
        .map_err(|err| RepositoryError::Decode(err.to_string()))
}

impl RecordRepository for HttpRepository {
    fn list_records(&mut self, window: &TimeWindow) -> Result<Vec<Record>, RepositoryError> {
        let range = format!("{}-{}", window.start.timestamp(), window.end.timestamp());
        debug!(%range, "fetching records");
        let response = self
            .agent
            .get(&self.url("records"))
            .set("authtoken", &self.token)
            .query("timerange", &range)
            .call()
            .map_err(map_error)?;
        let body: RecordsResponse = decode(response)?;
        body.records
            .into_iter()
            .map(WireRecord::into_record)
            .collect::<Result<Vec<_>, _>>()
            .map(|records| {
                records
                    .into_iter()
                    .filter(|record| window.touches(record))
                    .collect()
            })
    }

    fn upsert_records(&mut self, records: &[Record]) -> Result<Vec<UpsertResult>, RepositoryError> {
        let wire: Vec<WireRecord> = records.iter().map(WireRecord::from_record).collect();
        debug!(count = wire.len(), "sending records");
        let response = self
            .agent
            .put(&self.url("records"))
            .set("authtoken", &self.token)
            .send_json(&wire)
            .map_err(map_error)?;
        let body: PutResponse = decode(response)?;
        Ok(upsert_results(records, &body))
    }

    fn server_time(&mut self) -> Result<DateTime<Utc>, RepositoryError> {
        let since = Utc::now().timestamp().to_string();
        let response = self
            .agent
            .get(&self.url("updates"))
            .set("authtoken", &self.token)
            .query("since", &since)
            .call()
            .map_err(map_error)?;
        let body: UpdatesResponse = decode(response)?;
        Utc.timestamp_opt(body.server_time.floor() as i64, 0)
            .single()
            .ok_or_else(|| RepositoryError::Decode(format!("bad server_time {}", body.server_time)))
    }
}

/// The API echoes accepted keys only; the stored modification time is the one
/// that was sent.
fn upsert_results(records: &[Record], body: &PutResponse) -> Vec<UpsertResult> {
    let failed: HashMap<&str, String> = body
        .failed
        .iter()
        .enumerate()
        .map(|(idx, key)| {
            let reason = body
                .errors
                .get(idx)
                .cloned()
                .unwrap_or_else(|| "rejected by server".to_string());
            (key.as_str(), reason)
        })
        .collect();
    records
        .iter()
        .map(|record| {
            let outcome = if body.accepted.iter().any(|key| key == &record.key) {
                UpsertOutcome::Accepted {
                    modified_at: record.modified_at,
                }
            } else {
                UpsertOutcome::Rejected {
                    reason: failed
                        .get(record.key.as_str())
                        .cloned()
                        .unwrap_or_else(|| "not acknowledged by server".to_string()),
                }
            };
            UpsertResult {
                key: record.key.clone(),
                outcome,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hidden: bool) -> Record {
        let at = Utc.with_ymd_and_hms(2025, 3, 12, 9, 0, 0).unwrap();
        Record {
            key: "k1".to_string(),
            description: "#dev work".to_string(),
            t_start: at,
            t_stop: at + chrono::Duration::hours(1),
            modified_at: at,
            hidden,
        }
    }

    #[test]
    fn hidden_flag_travels_as_description_prefix() {
        let wire = WireRecord::from_record(&record(true));
        assert_eq!(wire.ds, "HIDDEN #dev work");
        let back = wire.into_record().expect("decode");
        assert_eq!(back, record(true));

        let wire = WireRecord::from_record(&record(false));
        assert_eq!(wire.ds, "#dev work");
        assert_eq!(wire.into_record().expect("decode"), record(false));
    }

    #[test]
    fn api_root_accepts_common_forms() {
        assert_eq!(
            api_root("https://timetagger.io/timetagger/"),
            "https://timetagger.io/timetagger/api/v2/"
        );
        assert_eq!(
            api_root("http://localhost:8080/timetagger/api/v2"),
            "http://localhost:8080/timetagger/api/v2/"
        );
    }

    #[test]
    fn put_response_maps_failures_to_reasons() {
        let body = PutResponse {
            accepted: vec!["a".to_string()],
            failed: vec!["b".to_string()],
            errors: vec!["b: invalid t2".to_string()],
        };
        let mut a = record(false);
        a.key = "a".to_string();
        let mut b = record(false);
        b.key = "b".to_string();
        let mut c = record(false);
        c.key = "c".to_string();
        let results = upsert_results(&[a, b, c], &body);
        assert!(matches!(results[0].outcome, UpsertOutcome::Accepted { .. }));
        assert_eq!(
            results[1].outcome,
            UpsertOutcome::Rejected {
                reason: "b: invalid t2".to_string()
            }
        );
        assert!(matches!(results[2].outcome, UpsertOutcome::Rejected { .. }));
    }
}
