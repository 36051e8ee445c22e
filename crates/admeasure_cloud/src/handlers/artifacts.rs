//! Artifact access on top of an [`ArtifactStore`]: transparent gzip
//! decoding, prefix-wide deletes, paginated enumeration and runner resources.

use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use admeasure_core::identity::IdentifierError;
use admeasure_core::storage_keys::resource_key;
use admeasure_core::{normalize, StepRef};
use flate2::read::MultiGzDecoder;
use serde_json::Value;

use crate::adapters::object_store::{ArtifactStore, StoreError, StoredObject};

/// Most keys a single delete call accepts.
pub const DELETE_BATCH_SIZE: usize = 1000;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error("part file {key} is not valid JSON: {source}")]
    Json {
        key: String,
        source: serde_json::Error,
    },
    #[error("part file {key} has no url at index {index}")]
    MissingUrl { key: String, index: usize },
}

#[derive(Clone)]
pub struct ArtifactClient {
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactClient {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Object body, gzip-decoded when the object is compressed.
    pub fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let object = self.store.get_object(key)?;
        decode_body(key, object)
    }

    /// Like [`get`](Self::get), but an absent object yields `default`.
    pub fn get_or(&self, key: &str, default: Vec<u8>) -> Result<Vec<u8>, StoreError> {
        match self.get(key) {
            Err(StoreError::NotFound { .. }) => Ok(default),
            other => other,
        }
    }

    pub fn put(&self, key: &str, body: &[u8], public: bool) -> Result<(), StoreError> {
        self.store.put_object(key, body, public)
    }

    /// Every key under `prefix`, across all pages.
    pub fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self.store.list_keys(prefix, continuation.as_deref())?;
            keys.extend(page.keys);
            match page.next {
                Some(token) => continuation = Some(token),
                None => return Ok(keys),
            }
        }
    }

    /// Remove every object under `prefix`. Irreversible; callers confirm.
    pub fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let started_at = Instant::now();
        let mut deleted = 0usize;
        let mut continuation: Option<String> = None;
        loop {
            let page = self.store.list_keys(prefix, continuation.as_deref())?;
            for batch in page.keys.chunks(DELETE_BATCH_SIZE) {
                self.store.delete_keys(batch)?;
                deleted += batch.len();
            }
            match page.next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        tracing::info!(
            component = "artifact_client",
            event = "prefix_deleted",
            prefix,
            deleted,
            duration_ms = started_at.elapsed().as_millis() as u64,
        );
        Ok(deleted)
    }

    /// Lazily walk the common prefixes below `prefix`, one page per store call.
    pub fn enumerate_prefixes<'a>(&'a self, prefix: &str, delimiter: &str) -> PrefixIter<'a> {
        PrefixIter {
            store: self.store.as_ref(),
            prefix: prefix.to_string(),
            delimiter: delimiter.to_string(),
            buffered: VecDeque::new(),
            continuation: None,
            exhausted: false,
            pages: 0,
            entries: 0,
            started_at: Instant::now(),
        }
    }

    /// Public URL of a runner resource: presigned, with the signature
    /// query string removed.
    pub fn resource_url(&self, name: &str) -> Result<String, StoreError> {
        let presigned = self.store.presigned_get_url(&resource_key(name))?;
        Ok(strip_query(&presigned).to_string())
    }

    /// Upload a local file as a public resource named after its file name.
    pub fn upload_resource(&self, path: &Path) -> Result<String, StoreError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                ))
            })?;
        let body = std::fs::read(path)?;
        let key = resource_key(name);
        self.put(&key, &body, true)?;
        tracing::info!(
            component = "artifact_client",
            event = "resource_uploaded",
            key = key.as_str(),
            bytes = body.len(),
        );
        Ok(key)
    }

    /// Target URL of a visited step, read from `{plan}/{part}.json`.
    pub fn step_url(&self, id: &str) -> Result<String, LookupError> {
        let step = StepRef::parse(&normalize(id))?;
        let key = step.part_key();
        let body = self.get(&key)?;
        let part: Value =
            serde_json::from_slice(&body).map_err(|source| LookupError::Json {
                key: key.clone(),
                source,
            })?;
        part.get("urls")
            .and_then(|urls| urls.get(step.index))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(LookupError::MissingUrl {
                key,
                index: step.index,
            })
    }
}

pub struct PrefixIter<'a> {
    store: &'a dyn ArtifactStore,
    prefix: String,
    delimiter: String,
    buffered: VecDeque<String>,
    continuation: Option<String>,
    exhausted: bool,
    pages: usize,
    entries: usize,
    started_at: Instant,
}

impl PrefixIter<'_> {
    fn fetch_page(&mut self) -> Result<(), StoreError> {
        let page = self.store.list_prefixes(
            &self.prefix,
            &self.delimiter,
            self.continuation.as_deref(),
        )?;
        self.pages += 1;
        self.entries += page.prefixes.len();
        self.buffered.extend(page.prefixes);
        self.exhausted = page.next.is_none();
        self.continuation = page.next;

        let elapsed = self.started_at.elapsed().as_secs_f64();
        tracing::info!(
            component = "artifact_client",
            event = "enumerate_progress",
            entries = self.entries,
            pages = self.pages,
            entries_per_second = if elapsed > 0.0 {
                self.entries as f64 / elapsed
            } else {
                self.entries as f64
            },
        );
        Ok(())
    }
}

impl Iterator for PrefixIter<'_> {
    type Item = Result<String, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffered.is_empty() && !self.exhausted {
            if let Err(error) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(error));
            }
        }
        self.buffered.pop_front().map(Ok)
    }
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}

/// Declared gzip must decode; sniffed gzip falls back to the raw bytes.
fn decode_body(key: &str, object: StoredObject) -> Result<Vec<u8>, StoreError> {
    let declared = object
        .content_encoding
        .as_deref()
        .map(|encoding| encoding.trim().eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    if !declared && !object.body.starts_with(&GZIP_MAGIC) {
        return Ok(object.body);
    }

    let mut decoded = Vec::new();
    match MultiGzDecoder::new(object.body.as_slice()).read_to_end(&mut decoded) {
        Ok(_) => Ok(decoded),
        Err(_) if !declared => Ok(object.body),
        Err(source) => Err(StoreError::Decode {
            key: key.to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::*;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).expect("compress");
        encoder.finish().expect("finish gzip stream")
    }

    fn object(body: Vec<u8>, encoding: Option<&str>) -> StoredObject {
        StoredObject {
            body,
            content_encoding: encoding.map(str::to_string),
        }
    }

    #[test]
    fn decodes_declared_gzip() {
        let decoded = decode_body("k", object(gzip(b"{\"a\":1}"), Some("gzip"))).expect("decode");
        assert_eq!(decoded, b"{\"a\":1}");
    }

    #[test]
    fn decodes_sniffed_gzip_without_header() {
        let decoded = decode_body("k", object(gzip(b"plain"), None)).expect("decode");
        assert_eq!(decoded, b"plain");
    }

    #[test]
    fn passes_raw_bodies_through() {
        let decoded = decode_body("k", object(b"raw".to_vec(), None)).expect("decode");
        assert_eq!(decoded, b"raw");
    }

    #[test]
    fn sniffed_magic_that_is_not_gzip_stays_raw() {
        let body = vec![0x1f, 0x8b, 0x00, 0x01];
        let decoded = decode_body("k", object(body.clone(), None)).expect("decode");
        assert_eq!(decoded, body);
    }

    #[test]
    fn declared_gzip_that_fails_to_decode_is_an_error() {
        let error = decode_body("eval/x/console.json", object(b"not gzip".to_vec(), Some("gzip")))
            .expect_err("corrupt gzip should fail");
        assert!(matches!(error, StoreError::Decode { ref key, .. } if key == "eval/x/console.json"));
    }

    #[test]
    fn strips_signature_query() {
        assert_eq!(
            strip_query("https://s3.example/admeasure/resources/main.js?X-Amz-Signature=abc"),
            "https://s3.example/admeasure/resources/main.js"
        );
        assert_eq!(strip_query("https://plain/x"), "https://plain/x");
    }
}
