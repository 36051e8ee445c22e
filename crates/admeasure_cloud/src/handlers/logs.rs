use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use admeasure_core::normalize;
use admeasure_core::storage_keys::ArtifactFile;

use super::artifacts::ArtifactClient;
use super::fetch::{fetch_all, FetchError, FetchOptions};

/// Local copies of the log artifacts under one prefix, keyed by object key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFiles {
    pub site: BTreeMap<String, PathBuf>,
    pub job: BTreeMap<String, PathBuf>,
}

impl LogFiles {
    pub fn len(&self) -> usize {
        self.site.len() + self.job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.site.is_empty() && self.job.is_empty()
    }
}

/// List log artifacts under the normalized `prefix` and fetch them into `dir`.
pub fn collect_log_files(
    client: &ArtifactClient,
    dir: &Path,
    prefix: &str,
    options: &FetchOptions,
) -> Result<LogFiles, FetchError> {
    let prefix = normalize(prefix);
    let mut site_keys = Vec::new();
    let mut job_keys = Vec::new();
    for key in client.list_keys(prefix.as_str())? {
        match ArtifactFile::classify(&key) {
            Some(kind) if kind.is_site_log() => site_keys.push(key),
            Some(kind) if kind.is_job_log() => job_keys.push(key),
            _ => {}
        }
    }
    tracing::info!(
        component = "log_collector",
        event = "log_files_found",
        prefix = prefix.as_str(),
        site = site_keys.len(),
        job = job_keys.len(),
    );

    Ok(LogFiles {
        site: fetch_all(client, dir, &site_keys, options)?.files,
        job: fetch_all(client, dir, &job_keys, options)?.files,
    })
}
