//! Cached bulk download of artifacts into a local directory.
//!
//! A key's local file is `<dir>/<key with ':' replaced>`. An existing file is
//! a cache hit and is never revalidated; objects are immutable once written.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use admeasure_core::to_local_path;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tempfile::NamedTempFile;

use super::artifacts::ArtifactClient;
use crate::adapters::object_store::StoreError;

pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to start download pool: {0}")]
    Pool(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Skip absent objects instead of failing the whole fetch.
    pub ignore_missing: bool,
    pub concurrency: usize,
    pub show_progress: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            ignore_missing: true,
            concurrency: DEFAULT_CONCURRENCY,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub cached: usize,
    pub downloaded: usize,
    pub missing: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub files: BTreeMap<String, PathBuf>,
    pub stats: FetchStats,
}

enum Fetched {
    Cached(PathBuf),
    Downloaded(PathBuf),
    Missing,
}

/// Local file for `key` under `dir`. Root, `.` and `..` components of the
/// key are dropped so the result never leaves `dir`.
pub fn local_path_for(dir: &Path, key: &str) -> PathBuf {
    let relative = to_local_path(key);
    Path::new(&relative)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .fold(dir.to_path_buf(), |path, part| path.join(part))
}

/// Download every key not already present under `dir`.
///
/// With `ignore_missing`, absent objects are counted and left out of the
/// result; otherwise the first absence aborts the fetch. Other storage and
/// filesystem errors always abort.
pub fn fetch_all(
    client: &ArtifactClient,
    dir: &Path,
    keys: &[String],
    options: &FetchOptions,
) -> Result<FetchOutcome, FetchError> {
    let started_at = Instant::now();
    let unique: Vec<&String> = keys.iter().collect::<BTreeSet<_>>().into_iter().collect();

    let progress = if options.show_progress && !unique.is_empty() {
        let bar = ProgressBar::new(unique.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .map_err(|error| FetchError::Pool(error.to_string()))?
                .progress_chars("#>-"),
        );
        bar
    } else {
        ProgressBar::hidden()
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.concurrency.max(1))
        .build()
        .map_err(|error| FetchError::Pool(error.to_string()))?;

    let results: Vec<(String, Fetched)> = pool.install(|| {
        unique
            .par_iter()
            .map(|key| -> Result<(String, Fetched), FetchError> {
                let fetched = fetch_one(client, dir, key, options.ignore_missing)?;
                progress.inc(1);
                Ok(((*key).clone(), fetched))
            })
            .collect::<Result<Vec<_>, FetchError>>()
    })?;
    progress.finish_and_clear();

    let mut outcome = FetchOutcome::default();
    for (key, fetched) in results {
        match fetched {
            Fetched::Cached(path) => {
                outcome.stats.cached += 1;
                outcome.files.insert(key, path);
            }
            Fetched::Downloaded(path) => {
                outcome.stats.downloaded += 1;
                outcome.files.insert(key, path);
            }
            Fetched::Missing => outcome.stats.missing += 1,
        }
    }

    tracing::info!(
        component = "bulk_fetch",
        event = "fetch_completed",
        requested = unique.len(),
        cached = outcome.stats.cached,
        downloaded = outcome.stats.downloaded,
        missing = outcome.stats.missing,
        duration_ms = started_at.elapsed().as_millis() as u64,
    );
    Ok(outcome)
}

fn fetch_one(
    client: &ArtifactClient,
    dir: &Path,
    key: &str,
    ignore_missing: bool,
) -> Result<Fetched, FetchError> {
    let target = local_path_for(dir, key);
    if target.exists() {
        return Ok(Fetched::Cached(target));
    }

    let body = match client.get(key) {
        Ok(body) => body,
        Err(StoreError::NotFound { .. }) if ignore_missing => {
            tracing::debug!(component = "bulk_fetch", event = "object_missing", key);
            return Ok(Fetched::Missing);
        }
        Err(error) => return Err(error.into()),
    };

    let parent = target.parent().unwrap_or(dir);
    std::fs::create_dir_all(parent).map_err(|source| FetchError::Io {
        path: parent.to_path_buf(),
        source,
    })?;
    let io_error = |source| FetchError::Io {
        path: target.clone(),
        source,
    };
    let mut staged = NamedTempFile::new_in(parent).map_err(io_error)?;
    staged.write_all(&body).map_err(io_error)?;
    staged
        .persist(&target)
        .map_err(|error| io_error(error.error))?;
    Ok(Fetched::Downloaded(target))
}
