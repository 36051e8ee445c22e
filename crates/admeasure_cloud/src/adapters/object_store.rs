//! Object storage boundary used by every artifact workflow.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object '{key}' does not exist")]
    NotFound { key: String },
    #[error("object store request failed: {0}")]
    Transport(String),
    #[error("failed to decode object '{key}': {source}")]
    Decode {
        key: String,
        source: std::io::Error,
    },
    #[error("local i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_encoding: Option<String>,
}

/// One page of a key listing; `next` is the continuation token for the
/// following page, `None` on the last page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPage {
    pub keys: Vec<String>,
    pub next: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixPage {
    pub prefixes: Vec<String>,
    pub next: Option<String>,
}

pub trait ArtifactStore: Send + Sync {
    fn get_object(&self, key: &str) -> Result<StoredObject, StoreError>;

    fn put_object(&self, key: &str, body: &[u8], public: bool) -> Result<(), StoreError>;

    fn list_keys(&self, prefix: &str, continuation: Option<&str>) -> Result<KeyPage, StoreError>;

    fn list_prefixes(
        &self,
        prefix: &str,
        delimiter: &str,
        continuation: Option<&str>,
    ) -> Result<PrefixPage, StoreError>;

    /// Delete up to one batch of keys in a single call.
    fn delete_keys(&self, keys: &[String]) -> Result<(), StoreError>;

    fn presigned_get_url(&self, key: &str) -> Result<String, StoreError>;
}
