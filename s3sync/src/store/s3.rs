//! Amazon S3 (and S3-compatible) remote store.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::MetadataDirective;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{partial_path, prepare_parent, RemoteFingerprint, RemoteStore, Transfer, CONTENT_DIGEST_METADATA};
use crate::fs::fingerprint::{self, is_content_digest};
use crate::inventory::{Destination, FileRecord, Inventory, InventorySource, PathFilter, RelPath};
use crate::utils::errors::{Result, SyncError};

/// Concurrent HeadObject requests when resolving content digests.
const DEFAULT_HEAD_CONCURRENCY: usize = 32;

/// Characters escaped in a CopyObject source; `/` stays as the key separator.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Connection settings shared by every S3 client this tool builds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    pub region: Option<String>,
    /// Named profile from the shared AWS config files.
    pub profile: Option<String>,
    /// Custom endpoint (MinIO, LocalStack). Enables path-style addressing.
    pub endpoint_url: Option<String>,
    pub max_attempts: Option<u32>,
}

/// Build an S3 client using the standard credential chain.
pub async fn build_client(options: &ClientOptions) -> Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());

    if let Some(region) = &options.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    if let Some(profile) = &options.profile {
        loader = loader.profile_name(profile);
    }
    if let Some(attempts) = options.max_attempts {
        loader = loader.retry_config(aws_config::retry::RetryConfig::standard().with_max_attempts(attempts));
    }

    let sdk_config = loader.load().await;
    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
    if let Some(endpoint) = &options.endpoint_url {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }

    Client::from_conf(builder.build())
}

/// Names of all buckets visible to the configured credentials.
pub async fn list_buckets(client: &Client) -> Result<Vec<String>> {
    let output = client
        .list_buckets()
        .send()
        .await
        .map_err(|e| SyncError::source_unavailable("s3", DisplayErrorContext(&e)))?;

    Ok(output
        .buckets()
        .iter()
        .filter_map(|b| b.name().map(|n| n.to_string()))
        .collect())
}

/// Configuration for [`S3Store`].
#[derive(Debug, Clone)]
pub struct S3StoreConfig {
    pub destination: Destination,
    pub client: ClientOptions,
    pub fingerprint: RemoteFingerprint,
    pub filter: PathFilter,
    pub head_concurrency: usize,
}

impl S3StoreConfig {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            client: ClientOptions::default(),
            fingerprint: RemoteFingerprint::default(),
            filter: PathFilter::default(),
            head_concurrency: DEFAULT_HEAD_CONCURRENCY,
        }
    }

    pub fn with_client(mut self, client: ClientOptions) -> Self {
        self.client = client;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: RemoteFingerprint) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// An object as seen in a listing page.
struct ListedObject {
    key: String,
    relative_path: RelPath,
    size: u64,
    modified_at: DateTime<Utc>,
    etag: String,
}

/// S3 bucket (optionally under a key prefix) as a sync root.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    destination: Destination,
    fingerprint: RemoteFingerprint,
    filter: PathFilter,
    head_concurrency: usize,
}

impl S3Store {
    pub async fn connect(config: S3StoreConfig) -> Self {
        let client = build_client(&config.client).await;
        Self::with_client(client, config)
    }

    pub fn with_client(client: Client, config: S3StoreConfig) -> Self {
        Self {
            client,
            destination: config.destination,
            fingerprint: config.fingerprint,
            filter: config.filter,
            head_concurrency: config.head_concurrency.max(1),
        }
    }

    fn unavailable(&self, reason: impl ToString) -> SyncError {
        SyncError::source_unavailable(self.destination.to_string(), reason)
    }

    /// Page through every object under the destination prefix.
    async fn list_objects(&self) -> Result<Vec<ListedObject>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.destination.bucket)
                .set_prefix(self.destination.list_prefix())
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| self.unavailable(DisplayErrorContext(&e)))?;

            for obj in output.contents() {
                let Some(key) = obj.key() else { continue };
                if let Some(listed) = self.accept(key, obj) {
                    objects.push(listed);
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(|s| s.to_string());
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(objects)
    }

    /// Map a listed key into the sync root, dropping directory markers,
    /// excluded keys and keys that are not valid relative paths.
    fn accept(&self, key: &str, obj: &aws_sdk_s3::types::Object) -> Option<ListedObject> {
        let relative = self.destination.relative_key(key)?;
        if relative.is_empty() || relative.ends_with('/') || self.filter.excludes_key(relative) {
            return None;
        }
        let relative_path = match RelPath::new(relative) {
            Ok(path) => path,
            Err(e) => {
                debug!("Skipping object {}: {}", key, e);
                return None;
            }
        };

        let modified_at = obj
            .last_modified()
            .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
            .unwrap_or_default();

        Some(ListedObject {
            key: key.to_string(),
            relative_path,
            size: obj.size().unwrap_or(0).max(0) as u64,
            modified_at,
            etag: obj.e_tag().unwrap_or_default().trim_matches('"').to_string(),
        })
    }

    /// Content digest recorded on upload, if the object carries one.
    async fn content_digest(&self, key: &str) -> Result<Option<String>> {
        let output = self
            .client
            .head_object()
            .bucket(&self.destination.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.unavailable(format!("head {}: {}", key, DisplayErrorContext(&e))))?;

        Ok(output
            .metadata()
            .and_then(|m| m.get(CONTENT_DIGEST_METADATA))
            .filter(|digest| is_content_digest(digest))
            .cloned())
    }

    async fn resolve(&self, object: ListedObject) -> Result<FileRecord> {
        let content_fingerprint = match self.fingerprint {
            RemoteFingerprint::Etag => object.etag,
            RemoteFingerprint::ContentDigest => self.content_digest(&object.key).await?.unwrap_or(object.etag),
        };

        Ok(FileRecord {
            relative_path: object.relative_path,
            size: object.size,
            modified_at: object.modified_at,
            content_fingerprint,
        })
    }
}

#[async_trait]
impl InventorySource for S3Store {
    async fn list(&self) -> Result<Inventory> {
        let objects = self.list_objects().await?;

        let records: Vec<FileRecord> = stream::iter(objects)
            .map(|object| self.resolve(object))
            .buffer_unordered(self.head_concurrency)
            .try_collect()
            .await?;

        let mut inventory: Inventory = records.into_iter().collect();
        inventory.set_destination(Some(self.destination.clone()));

        info!(
            "Listed {}: {} objects, {} bytes",
            self.destination,
            inventory.len(),
            inventory.total_bytes()
        );
        Ok(inventory)
    }
}

#[async_trait]
impl Transfer for S3Store {
    async fn put(&self, local_path: &Path, key: &RelPath, fingerprint: &str) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| SyncError::transfer_failed(key.as_str(), e))?;

        self.client
            .put_object()
            .bucket(&self.destination.bucket)
            .key(self.destination.object_key(key))
            .metadata(CONTENT_DIGEST_METADATA, fingerprint)
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::transfer_failed(key.as_str(), DisplayErrorContext(&e)))?;

        debug!("Uploaded {} to {}", key, self.destination);
        Ok(())
    }

    async fn get(&self, key: &RelPath, local_path: &Path) -> Result<String> {
        let object_key = self.destination.object_key(key);
        let response = self
            .client
            .get_object()
            .bucket(&self.destination.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| SyncError::transfer_failed(key.as_str(), DisplayErrorContext(&e)))?;

        let recorded = response
            .metadata()
            .and_then(|m| m.get(CONTENT_DIGEST_METADATA))
            .cloned();

        prepare_parent(key, local_path).await?;
        let partial = partial_path(local_path);

        let digest = match write_body(response.body, &partial).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(SyncError::transfer_failed(key.as_str(), e));
            }
        };

        tokio::fs::rename(&partial, local_path)
            .await
            .map_err(|e| SyncError::transfer_failed(key.as_str(), e))?;

        if recorded.as_deref() != Some(digest.as_str()) {
            self.tag_digest(&object_key, &digest).await;
        }

        debug!("Downloaded {} from {}", key, self.destination);
        Ok(digest)
    }
}

impl S3Store {
    /// Attach the content digest to an existing object through a self copy.
    /// Failures are logged and not returned.
    async fn tag_digest(&self, object_key: &str, digest: &str) {
        let source = format!(
            "{}/{}",
            self.destination.bucket,
            utf8_percent_encode(object_key, COPY_SOURCE)
        );

        let result = self
            .client
            .copy_object()
            .bucket(&self.destination.bucket)
            .key(object_key)
            .copy_source(source)
            .metadata_directive(MetadataDirective::Replace)
            .metadata(CONTENT_DIGEST_METADATA, digest)
            .send()
            .await;

        match result {
            Ok(_) => debug!("Tagged {} with {}", object_key, digest),
            Err(e) => warn!(
                "Could not tag {} with its content digest: {}",
                object_key,
                DisplayErrorContext(&e)
            ),
        }
    }
}

/// Stream a body to `path`, returning the fingerprint of what was written.
async fn write_body(mut body: ByteStream, path: &Path) -> anyhow::Result<String> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    while let Some(chunk) = body.try_next().await? {
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(fingerprint::finish(hasher))
}

#[async_trait]
impl RemoteStore for S3Store {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn ensure_accessible(&self) -> Result<()> {
        match self
            .client
            .head_bucket()
            .bucket(&self.destination.bucket)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Err(self.unavailable("bucket does not exist")),
            Err(e) => Err(self.unavailable(DisplayErrorContext(&e))),
        }
    }
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(e) if e.raw().status().as_u16() == 404)
}
