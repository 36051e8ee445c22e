//! Reconstruct one chronological log from the per-VM log artifacts.
//!
//! Site logs (`console.json`) are arrays of entries from every part of the
//! runner; only the `measure-*` and `prime-*` parts are kept. Job logs
//! (`measure.json`, `prime.json`) are objects carrying a `log` array.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const SITE_PART_PREFIXES: [&str; 2] = ["measure-", "prime-"];

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to read log file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse log file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub part: String,
    pub text: String,
}

impl LogEntry {
    fn is_measurement_part(&self) -> bool {
        SITE_PART_PREFIXES
            .iter()
            .any(|prefix| self.part.starts_with(prefix))
    }
}

#[derive(Debug, Deserialize)]
struct JobLog {
    log: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrepHit {
    /// Identifier of the step that wrote the log file.
    pub source_id: String,
    pub text: String,
}

/// Site entries outside the measurement parts are dropped; the rest is
/// stably sorted by time, site entries ahead of job entries on ties.
pub fn merge(site: Vec<Vec<LogEntry>>, job: Vec<Vec<LogEntry>>) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = site
        .into_iter()
        .flatten()
        .filter(LogEntry::is_measurement_part)
        .chain(job.into_iter().flatten())
        .collect();
    entries.sort_by_key(|entry| entry.time);
    entries
}

pub fn merge_files(
    site_files: &BTreeMap<String, PathBuf>,
    job_files: &BTreeMap<String, PathBuf>,
) -> Result<Vec<LogEntry>, LogError> {
    let site = site_files
        .values()
        .map(|path| read_site_log(path))
        .collect::<Result<Vec<_>, _>>()?;
    let job = job_files
        .values()
        .map(|path| read_job_log(path))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(merge(site, job))
}

/// Case-insensitive substring search over every entry of every file. Files
/// are visited in key order across both kinds.
pub fn grep(
    pattern: &str,
    site_files: &BTreeMap<String, PathBuf>,
    job_files: &BTreeMap<String, PathBuf>,
) -> Result<Vec<GrepHit>, LogError> {
    let needle = pattern.to_lowercase();
    let mut files: Vec<(&String, &PathBuf, bool)> = site_files
        .iter()
        .map(|(key, path)| (key, path, false))
        .chain(job_files.iter().map(|(key, path)| (key, path, true)))
        .collect();
    files.sort_by(|a, b| a.0.cmp(b.0));

    let mut hits = Vec::new();
    for (key, path, is_job) in files {
        let entries = if is_job {
            read_job_log(path)?
        } else {
            read_site_log(path)?
        };
        let source_id = key
            .rsplit_once('/')
            .map(|(parent, _)| parent)
            .unwrap_or_default()
            .to_string();
        hits.extend(
            entries
                .into_iter()
                .filter(|entry| entry.text.to_lowercase().contains(&needle))
                .map(|entry| GrepHit {
                    source_id: source_id.clone(),
                    text: entry.text,
                }),
        );
    }
    Ok(hits)
}

pub fn read_site_log(path: &Path) -> Result<Vec<LogEntry>, LogError> {
    parse_file(path)
}

pub fn read_job_log(path: &Path) -> Result<Vec<LogEntry>, LogError> {
    parse_file::<JobLog>(path).map(|job| job.log)
}

fn parse_file<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, LogError> {
    let bytes = std::fs::read(path).map_err(|source| LogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| LogError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(time: &str, part: &str, text: &str) -> LogEntry {
        LogEntry {
            time: time.parse().expect("valid timestamp"),
            part: part.to_string(),
            text: text.to_string(),
        }
    }

    fn write_json(dir: &Path, name: &str, value: serde_json::Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_vec(&value).expect("json")).expect("write");
        path
    }

    #[test]
    fn merge_filters_site_parts_and_sorts_by_time() {
        let site = vec![vec![
            entry("2021-10-20T12:00:03Z", "measure-visit", "visit"),
            entry("2021-10-20T12:00:01Z", "setup", "dropped"),
            entry("2021-10-20T12:00:00Z", "prime-search", "prime"),
        ]];
        let job = vec![vec![entry("2021-10-20T12:00:02Z", "job", "job line")]];

        let texts: Vec<String> = merge(site, job).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["prime", "job line", "visit"]);
    }

    #[test]
    fn merge_keeps_site_before_job_on_equal_times() {
        let site = vec![vec![entry("2021-10-20T12:00:00Z", "measure-a", "site")]];
        let job = vec![vec![entry("2021-10-20T12:00:00Z", "job", "job")]];
        let texts: Vec<String> = merge(site, job).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["site", "job"]);
    }

    #[test]
    fn merge_files_reads_both_shapes() {
        let dir = tempfile::tempdir().expect("temp dir");
        let site = write_json(
            dir.path(),
            "console.json",
            json!([
                {"time": "2021-10-20T12:00:01.500Z", "part": "measure-visit", "text": "b"},
                {"time": "2021-10-20T12:00:00.000Z", "part": "browser", "text": "noise"}
            ]),
        );
        let job = write_json(
            dir.path(),
            "measure.json",
            json!({"log": [{"time": "2021-10-20T12:00:00.250Z", "part": "job", "text": "a"}], "ok": true}),
        );

        let entries = merge_files(
            &BTreeMap::from([("eval/x/console.json".to_string(), site)]),
            &BTreeMap::from([("eval/x/measure.json".to_string(), job)]),
        )
        .expect("merge should succeed");
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn merge_files_reports_offending_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let broken = dir.path().join("console.json");
        std::fs::write(&broken, b"{not json").expect("write");

        let error = merge_files(
            &BTreeMap::from([("k/console.json".to_string(), broken.clone())]),
            &BTreeMap::new(),
        )
        .expect_err("broken file should fail");
        assert!(matches!(error, LogError::Parse { ref path, .. } if path == &broken));
    }

    #[test]
    fn grep_matches_case_insensitively_in_key_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let site = write_json(
            dir.path(),
            "b-console.json",
            json!([{"time": "2021-10-20T12:00:00Z", "part": "setup", "text": "Consent Dialog found"}]),
        );
        let job = write_json(
            dir.path(),
            "a-measure.json",
            json!({"log": [{"time": "2021-10-20T12:00:00Z", "part": "job", "text": "no dialog"}]}),
        );

        let hits = grep(
            "DIALOG",
            &BTreeMap::from([("eval/b/3/console.json".to_string(), site)]),
            &BTreeMap::from([("eval/a/1/measure.json".to_string(), job)]),
        )
        .expect("grep should succeed");
        assert_eq!(
            hits,
            vec![
                GrepHit {
                    source_id: "eval/a/1".to_string(),
                    text: "no dialog".to_string()
                },
                GrepHit {
                    source_id: "eval/b/3".to_string(),
                    text: "Consent Dialog found".to_string()
                },
            ]
        );
    }
}
