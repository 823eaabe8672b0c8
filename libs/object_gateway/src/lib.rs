//! A thin gateway over an S3-compatible object store.
//!
//! [`ObjectStore`] is a CRUD-plus-multipart abstraction with two
//! implementations:
//!   * [`s3::S3Gateway`] talks to any S3-compatible endpoint through the AWS SDK
//!   * [`mem::MemGateway`] keeps everything in memory, for tests and local runs
//!
//! No higher-level semantics live here: directories, owners, manifests and
//! caches are all layered on top by the service crate. The gateway only knows
//! keys, bytes, metadata and pages.
#![deny(unsafe_code)]

mod config;
mod error;
pub mod mem;
pub mod s3;

use std::{collections::HashMap, fmt::Debug, pin::Pin, sync::Arc, time::Duration, time::SystemTime};

use bytes::Bytes;
use futures::stream::Stream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use mem::MemGateway;
pub use s3::S3Gateway;

/// ListObjectsV2 pages are capped at 1000 keys by every S3-compatible
/// implementation we target.
pub const MAX_KEYS_PER_LIST_PAGE: i32 = 1000;

/// One `ListObjectsV2` request. `delimited` controls whether common prefixes
/// are folded; `continuation_token` continues a previous page and takes
/// precedence over `start_after`.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub prefix: String,
    pub delimited: bool,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub max_keys: Option<i32>,
}

/// A single object summary as returned by a list page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: SystemTime,
}

#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ListedObject>,
    pub common_prefixes: Vec<String>,
    pub next_continuation_token: Option<String>,
}

/// Extra key-value pairs stored alongside an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageMetadata(pub HashMap<String, String>);

impl<const N: usize> From<[(&str, &str); N]> for StorageMetadata {
    fn from(arr: [(&str, &str); N]) -> Self {
        let map: HashMap<String, String> = arr
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self(map)
    }
}

impl StorageMetadata {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// HeadObject output.
#[derive(Debug, Clone)]
pub struct ObjectHead {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: SystemTime,
    pub content_type: Option<String>,
    pub metadata: StorageMetadata,
}

/// The byte stream yielded by [`ObjectStore::get`]; item type is compatible
/// with `tokio::io::copy_buf` via `StreamReader`.
pub type DownloadStream =
    Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static>>;

pub struct ObjectBody {
    pub stream: DownloadStream,
    pub size: u64,
    pub etag: String,
    pub last_modified: SystemTime,
    pub content_type: Option<String>,
    pub metadata: StorageMetadata,
}

impl Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("size", &self.size)
            .field("etag", &self.etag)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Byte range for partial GETs: `[start, end)`, open-ended when `end` is None.
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub metadata: Option<StorageMetadata>,
}

/// Mirrors the S3 `MetadataDirective` on CopyObject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataDirective {
    /// Target inherits the source's metadata.
    Copy,
    /// Target gets exactly the metadata provided in the copy options.
    Replace,
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub directive: MetadataDirective,
    pub content_type: Option<String>,
    pub metadata: Option<StorageMetadata>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            directive: MetadataDirective::Copy,
            content_type: None,
            metadata: None,
        }
    }
}

/// One part of a multipart completion request, client-supplied in ascending
/// part-number order.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PartSpec {
    pub part_number: i32,
    pub etag: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompletedUpload {
    pub etag: String,
    pub location: String,
}

/// Storage API to manage a flat keyspace of objects.
///
/// Every operation suspends at the wire and obeys the cancellation token;
/// cancelled or timed-out calls surface as [`GatewayError::Cancelled`] /
/// [`GatewayError::Timeout`]. A missing key is always
/// [`GatewayError::NotFound`], no matter which operation noticed it.
#[allow(async_fn_in_trait)]
pub trait ObjectStore: Send + Sync + 'static {
    /// One page of ListObjectsV2, at most [`MAX_KEYS_PER_LIST_PAGE`] entries.
    /// Callers drive pagination through `continuation_token` themselves.
    async fn list_page(
        &self,
        request: &ListRequest,
        cancel: &CancellationToken,
    ) -> Result<ListPage, GatewayError>;

    async fn head(&self, key: &str, cancel: &CancellationToken)
        -> Result<ObjectHead, GatewayError>;

    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<ObjectBody, GatewayError>;

    /// Streams `from` into the object at `key`. The content length must be
    /// known up front; S3 PUT requires it.
    async fn put(
        &self,
        key: &str,
        from: impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
        size_bytes: u64,
        opts: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError>;

    async fn copy(
        &self,
        from: &str,
        to: &str,
        opts: &CopyOptions,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError>;

    async fn delete_object(&self, key: &str, cancel: &CancellationToken)
        -> Result<(), GatewayError>;

    /// Starts a multipart upload, returning the upload id.
    async fn create_multipart(
        &self,
        key: &str,
        opts: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError>;

    /// Uploads one part, returning its etag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartSpec],
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload, GatewayError>;

    async fn abort_multipart(
        &self,
        key: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError>;

    /// Presigned GET URL for `key`, valid for `expires`. The gateway rewrites
    /// the endpoint host to the configured public hostname.
    async fn presign_get(&self, key: &str, expires: Duration) -> Result<String, GatewayError>;

    /// Presigned UploadPart URL for a pending multipart upload.
    async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires: Duration,
    ) -> Result<String, GatewayError>;
}

/// Every store we support, as a simple way to pass the gateway around without
/// generics at every call site.
#[derive(Clone)]
pub enum GenericObjectStore {
    AwsS3(Arc<S3Gateway>),
    InMemory(Arc<MemGateway>),
}

impl GenericObjectStore {
    pub fn config(&self) -> &GatewayConfig {
        match self {
            Self::AwsS3(s) => s.config(),
            Self::InMemory(s) => s.config(),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.config().bucket_name
    }

    pub fn public_hostname(&self) -> &str {
        &self.config().public_hostname
    }

    /// Public (unsigned) URL for a key, served from the CDN hostname.
    pub fn public_url(&self, key: &str) -> String {
        format!("https://{}/{}", self.public_hostname(), key)
    }

    pub async fn list_page(
        &self,
        request: &ListRequest,
        cancel: &CancellationToken,
    ) -> Result<ListPage, GatewayError> {
        match self {
            Self::AwsS3(s) => s.list_page(request, cancel).await,
            Self::InMemory(s) => s.list_page(request, cancel).await,
        }
    }

    pub async fn head(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectHead, GatewayError> {
        match self {
            Self::AwsS3(s) => s.head(key, cancel).await,
            Self::InMemory(s) => s.head(key, cancel).await,
        }
    }

    pub async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<ObjectBody, GatewayError> {
        match self {
            Self::AwsS3(s) => s.get(key, range, cancel).await,
            Self::InMemory(s) => s.get(key, range, cancel).await,
        }
    }

    pub async fn put(
        &self,
        key: &str,
        from: impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
        size_bytes: u64,
        opts: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        match self {
            Self::AwsS3(s) => s.put(key, from, size_bytes, opts, cancel).await,
            Self::InMemory(s) => s.put(key, from, size_bytes, opts, cancel).await,
        }
    }

    /// Buffered convenience wrapper over [`Self::put`].
    pub async fn put_bytes(
        &self,
        key: &str,
        body: Bytes,
        opts: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let size = body.len() as u64;
        self.put(key, futures::stream::once(async move { Ok(body) }), size, opts, cancel)
            .await
    }

    pub async fn copy(
        &self,
        from: &str,
        to: &str,
        opts: &CopyOptions,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        match self {
            Self::AwsS3(s) => s.copy(from, to, opts, cancel).await,
            Self::InMemory(s) => s.copy(from, to, opts, cancel).await,
        }
    }

    pub async fn delete_object(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        match self {
            Self::AwsS3(s) => s.delete_object(key, cancel).await,
            Self::InMemory(s) => s.delete_object(key, cancel).await,
        }
    }

    pub async fn create_multipart(
        &self,
        key: &str,
        opts: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        match self {
            Self::AwsS3(s) => s.create_multipart(key, opts, cancel).await,
            Self::InMemory(s) => s.create_multipart(key, opts, cancel).await,
        }
    }

    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        match self {
            Self::AwsS3(s) => s.upload_part(key, upload_id, part_number, body, cancel).await,
            Self::InMemory(s) => s.upload_part(key, upload_id, part_number, body, cancel).await,
        }
    }

    pub async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartSpec],
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload, GatewayError> {
        match self {
            Self::AwsS3(s) => s.complete_multipart(key, upload_id, parts, cancel).await,
            Self::InMemory(s) => s.complete_multipart(key, upload_id, parts, cancel).await,
        }
    }

    pub async fn abort_multipart(
        &self,
        key: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        match self {
            Self::AwsS3(s) => s.abort_multipart(key, upload_id, cancel).await,
            Self::InMemory(s) => s.abort_multipart(key, upload_id, cancel).await,
        }
    }

    pub async fn presign_get(&self, key: &str, expires: Duration) -> Result<String, GatewayError> {
        match self {
            Self::AwsS3(s) => s.presign_get(key, expires).await,
            Self::InMemory(s) => s.presign_get(key, expires).await,
        }
    }

    pub async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires: Duration,
    ) -> Result<String, GatewayError> {
        match self {
            Self::AwsS3(s) => s.presign_upload_part(key, upload_id, part_number, expires).await,
            Self::InMemory(s) => {
                s.presign_upload_part(key, upload_id, part_number, expires).await
            }
        }
    }
}

pub(crate) enum RequestKind {
    Get,
    Put,
    List,
    Delete,
    Copy,
    Head,
}

/// S3-compatible endpoints throttle by requests per second; keep the client
/// below the threshold instead of surfacing 503s to callers.
pub(crate) struct ConcurrencyLimiter {
    write: Arc<Semaphore>,
    read: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    pub(crate) fn for_kind(&self, kind: RequestKind) -> &Arc<Semaphore> {
        match kind {
            RequestKind::Get => &self.read,
            RequestKind::List => &self.read,
            RequestKind::Head => &self.read,
            RequestKind::Put => &self.write,
            RequestKind::Delete => &self.write,
            RequestKind::Copy => &self.write,
        }
    }

    pub(crate) async fn acquire(
        &self,
        kind: RequestKind,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, tokio::sync::AcquireError> {
        self.for_kind(kind).acquire().await
    }

    pub(crate) async fn acquire_owned(
        &self,
        kind: RequestKind,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, tokio::sync::AcquireError> {
        Arc::clone(self.for_kind(kind)).acquire_owned().await
    }

    pub(crate) fn new(limit: usize) -> ConcurrencyLimiter {
        Self {
            read: Arc::new(Semaphore::new(limit)),
            write: Arc::new(Semaphore::new(limit)),
        }
    }
}
