//! S3-backed [`ArtifactStore`].
//!
//! The SDK is async; the store drives each call to completion on a runtime
//! handle owned by the caller. Methods must not be called from inside that
//! runtime's async context.

use std::future::Future;
use std::time::Duration;

use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectCannedAcl, ObjectIdentifier};
use aws_sdk_s3::Client;
use tokio::runtime::Handle;

use super::object_store::{ArtifactStore, KeyPage, PrefixPage, StoreError, StoredObject};
use crate::config::StoreConfig;

#[derive(Debug, Clone)]
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
    presign_ttl: Duration,
    runtime: Handle,
}

impl S3ArtifactStore {
    pub fn new(client: Client, bucket: impl Into<String>, presign_ttl: Duration, runtime: Handle) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            presign_ttl,
            runtime,
        }
    }

    /// Load credentials (optionally from a named profile) and point the
    /// client at the configured endpoint.
    pub fn connect(config: &StoreConfig, runtime: Handle) -> Self {
        let client = runtime.block_on(async {
            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_config::Region::new(config.region.clone()));
            if let Some(profile) = &config.profile {
                loader = loader.profile_name(profile);
            }
            let shared = loader.load().await;
            let s3_config = aws_sdk_s3::config::Builder::from(&shared)
                .endpoint_url(&config.endpoint)
                .build();
            Client::from_conf(s3_config)
        });
        Self::new(client, config.bucket.clone(), config.presign_ttl, runtime)
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl ArtifactStore for S3ArtifactStore {
    fn get_object(&self, key: &str) -> Result<StoredObject, StoreError> {
        self.block_on(async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|error| {
                    let missing = error
                        .as_service_error()
                        .map(|service| service.is_no_such_key())
                        .unwrap_or(false);
                    if missing {
                        StoreError::NotFound {
                            key: key.to_string(),
                        }
                    } else {
                        transport(format!("get {key}"), DisplayErrorContext(&error))
                    }
                })?;
            let content_encoding = output.content_encoding().map(str::to_string);
            let body = output
                .body
                .collect()
                .await
                .map_err(|error| transport(format!("read body of {key}"), error))?
                .into_bytes()
                .to_vec();
            Ok::<_, StoreError>(StoredObject {
                body,
                content_encoding,
            })
        })
    }

    fn put_object(&self, key: &str, body: &[u8], public: bool) -> Result<(), StoreError> {
        self.block_on(async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .set_acl(public.then_some(ObjectCannedAcl::PublicRead))
                .body(ByteStream::from(body.to_vec()))
                .send()
                .await
                .map(|_| ())
                .map_err(|error| transport(format!("put {key}"), DisplayErrorContext(&error)))
        })
    }

    fn list_keys(&self, prefix: &str, continuation: Option<&str>) -> Result<KeyPage, StoreError> {
        self.block_on(async {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.map(str::to_string))
                .send()
                .await
                .map_err(|error| transport(format!("list {prefix}"), DisplayErrorContext(&error)))?;
            Ok::<_, StoreError>(KeyPage {
                keys: output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string))
                    .collect(),
                next: output.next_continuation_token().map(str::to_string),
            })
        })
    }

    fn list_prefixes(
        &self,
        prefix: &str,
        delimiter: &str,
        continuation: Option<&str>,
    ) -> Result<PrefixPage, StoreError> {
        self.block_on(async {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter(delimiter)
                .set_continuation_token(continuation.map(str::to_string))
                .send()
                .await
                .map_err(|error| transport(format!("list {prefix}"), DisplayErrorContext(&error)))?;
            Ok::<_, StoreError>(PrefixPage {
                prefixes: output
                    .common_prefixes()
                    .iter()
                    .filter_map(|common| common.prefix().map(str::to_string))
                    .collect(),
                next: output.next_continuation_token().map(str::to_string),
            })
        })
    }

    fn delete_keys(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| transport("build delete request", error))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|error| transport("build delete request", error))?;

        self.block_on(async {
            let output = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|error| transport("delete objects", DisplayErrorContext(&error)))?;
            match output.errors().first() {
                Some(failed) => Err(StoreError::Transport(format!(
                    "delete {} failed: {} ({} keys rejected)",
                    failed.key().unwrap_or("<unknown>"),
                    failed.message().unwrap_or("no message"),
                    output.errors().len(),
                ))),
                None => Ok(()),
            }
        })
    }

    fn presigned_get_url(&self, key: &str) -> Result<String, StoreError> {
        let presigning = PresigningConfig::expires_in(self.presign_ttl)
            .map_err(|error| transport("presigning config", error))?;
        self.block_on(async {
            let request = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .presigned(presigning)
                .await
                .map_err(|error| transport(format!("presign {key}"), DisplayErrorContext(&error)))?;
            Ok::<_, StoreError>(request.uri().to_string())
        })
    }
}

fn transport(action: impl std::fmt::Display, error: impl std::fmt::Display) -> StoreError {
    StoreError::Transport(format!("{action}: {error}"))
}
