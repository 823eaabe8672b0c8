//! Archive pipeline: format handlers, durable job queues and the extract /
//! create orchestrators.
//!
//! Handlers speak streams. An extract delivers entries in source order, each
//! entry's bytes flowing through a bounded channel so nothing ever buffers a
//! whole archive in memory (RAR excepted, see `rar.rs`). The orchestrators
//! run the handlers on queue workers with progress reporting, cooperative
//! cancellation and the safety limits enforced on every extract.

pub mod create;
pub mod extract;
pub mod orchestrator;
pub mod queue;
pub mod rar;
pub mod tar;
pub mod zip;

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{ArchiveConfig, ExtractLimits};
use crate::error::ApiError;

/// Stream of archive bytes or entry bytes; the same shape the gateway uses
/// for object bodies.
pub type ByteStream =
    Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    Rar,
}

impl ArchiveFormat {
    pub const ALL: &'static [ArchiveFormat] = &[Self::Zip, Self::Tar, Self::TarGz, Self::Rar];

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Zip => &["zip"],
            Self::Tar => &["tar"],
            Self::TarGz => &["tar.gz", "tgz"],
            Self::Rar => &["rar"],
        }
    }

    /// Detect a format from a file name. Compound extensions are matched
    /// before simple ones, so `x.tar.gz` is TarGz, not a gzip mystery.
    pub fn detect(key: &str) -> Option<Self> {
        let name = utils::path::file_name(key).to_ascii_lowercase();
        for format in Self::ALL {
            for ext in format.extensions() {
                if name.ends_with(&format!(".{ext}")) {
                    return Some(*format);
                }
            }
        }
        None
    }

    pub fn supports_creation(&self) -> bool {
        !matches!(self, Self::Rar)
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::Rar => "rar",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry as reported by preview/listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryInfo {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// One entry during extraction. `stream` is empty for directories. Bytes
/// arrive with back-pressure; the handler does not read ahead of the
/// consumer further than the channel capacity.
pub struct ExtractedEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub stream: ByteStream,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractSummary {
    pub entries: u64,
    pub uncompressed_bytes: u64,
}

/// Consumer of extracted entries. Called in source order; returns once the
/// entry has an owner (its bytes may still be in flight).
#[async_trait]
pub trait EntrySink: Send {
    async fn entry(&mut self, entry: ExtractedEntry) -> Result<(), ApiError>;
}

/// One file going into a created archive.
#[derive(Debug, Clone)]
pub struct CreateEntry {
    /// Path inside the archive.
    pub archive_path: String,
    /// Absolute storage key to read from.
    pub source_key: String,
    pub size: u64,
}

/// Lazily opens entry contents for archive creation.
#[async_trait]
pub trait EntryContentSource: Send + Sync {
    async fn open(&self, source_key: &str) -> Result<ByteStream, ApiError>;
}

/// What `create` hands back: the archive byte stream plus a task handle that
/// resolves once the writer side is done (or failed).
pub struct CreateOutput {
    pub stream: ByteStream,
    pub completion: tokio::task::JoinHandle<Result<(), ApiError>>,
}

#[async_trait]
pub trait ArchiveHandler: Send + Sync {
    fn format(&self) -> ArchiveFormat;

    /// Enumerate entries without writing anything anywhere.
    async fn list_entries(
        &self,
        source: ByteStream,
        total_bytes: u64,
        limits: &ExtractLimits,
    ) -> Result<Vec<EntryInfo>, ApiError>;

    /// Stream entries into `sink`, enforcing the safety limits. Aborts as
    /// soon as the cancellation token fires or a limit is crossed.
    async fn extract(
        &self,
        source: ByteStream,
        total_bytes: u64,
        limits: &ExtractLimits,
        sink: &mut dyn EntrySink,
        cancel: &CancellationToken,
    ) -> Result<ExtractSummary, ApiError>;

    /// Build an archive from `entries`. Unsupported for formats that cannot
    /// be created (RAR).
    async fn create(
        &self,
        entries: Vec<CreateEntry>,
        source: Arc<dyn EntryContentSource>,
        cancel: &CancellationToken,
    ) -> Result<CreateOutput, ApiError> {
        let _ = (entries, source, cancel);
        Err(ApiError::BadRequest(
            format!("{} archives cannot be created", self.format()).into(),
        ))
    }
}

/// The handler set, built once from config.
pub struct HandlerRegistry {
    zip: zip::ZipHandler,
    tar: tar::TarHandler,
    tar_gz: tar::TarHandler,
    rar: rar::RarHandler,
}

impl HandlerRegistry {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            zip: zip::ZipHandler,
            tar: tar::TarHandler::plain(),
            tar_gz: tar::TarHandler::gzipped(),
            rar: rar::RarHandler::new(config.rar_max_buffer_bytes),
        }
    }

    pub fn handler(&self, format: ArchiveFormat) -> &dyn ArchiveHandler {
        match format {
            ArchiveFormat::Zip => &self.zip,
            ArchiveFormat::Tar => &self.tar,
            ArchiveFormat::TarGz => &self.tar_gz,
            ArchiveFormat::Rar => &self.rar,
        }
    }
}

/// Limit bookkeeping shared by every extract path. The compressed counter
/// usually comes from a [`CountingStream`] wrapped around the source.
pub struct LimitTracker {
    limits: ExtractLimits,
    compressed_read: Arc<AtomicU64>,
    pub entries: u64,
    pub total_uncompressed: u64,
}

impl LimitTracker {
    pub fn new(limits: ExtractLimits, compressed_read: Arc<AtomicU64>) -> Self {
        Self {
            limits,
            compressed_read,
            entries: 0,
            total_uncompressed: 0,
        }
    }

    pub fn on_entry(&mut self, declared_size: u64) -> Result<(), ApiError> {
        self.entries += 1;
        if self.entries > self.limits.max_entries {
            return Err(ApiError::BadRequest("archive has too many entries".into()));
        }
        if declared_size > self.limits.max_entry_bytes {
            return Err(ApiError::BadRequest("archive entry too large".into()));
        }
        Ok(())
    }

    /// Account uncompressed bytes; `entry_total` is the running size of the
    /// current entry.
    pub fn on_bytes(&mut self, n: u64, entry_total: u64) -> Result<(), ApiError> {
        self.total_uncompressed += n;
        if entry_total > self.limits.max_entry_bytes {
            return Err(ApiError::BadRequest("archive entry too large".into()));
        }
        if self.total_uncompressed > self.limits.max_total_bytes {
            return Err(ApiError::BadRequest("archive too large".into()));
        }
        self.check_ratio()
    }

    pub fn check_ratio(&self) -> Result<(), ApiError> {
        let compressed = self.compressed_read.load(Ordering::Relaxed).max(1);
        let ratio = self.total_uncompressed as f64 / compressed as f64;
        if ratio > self.limits.max_compression_ratio {
            return Err(ApiError::BadRequest(
                "compression ratio limit exceeded".into(),
            ));
        }
        Ok(())
    }

    pub fn summary(&self) -> ExtractSummary {
        ExtractSummary {
            entries: self.entries,
            uncompressed_bytes: self.total_uncompressed,
        }
    }
}

pin_project_lite::pin_project! {
    /// Counts the bytes flowing through a stream; used to measure how much
    /// compressed input an extraction has consumed.
    pub struct CountingStream<S> {
        counter: Arc<AtomicU64>,
        #[pin]
        inner: S,
    }
}

impl<S> CountingStream<S> {
    pub fn new(inner: S) -> (Self, Arc<AtomicU64>) {
        let counter = Arc::new(AtomicU64::new(0));
        (
            Self {
                counter: counter.clone(),
                inner,
            },
            counter,
        )
    }
}

impl<S: Stream<Item = std::io::Result<Bytes>>> Stream for CountingStream<S> {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let res = std::task::ready!(this.inner.poll_next(cx));
        if let Some(Ok(chunk)) = &res {
            this.counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        Poll::Ready(res)
    }
}

/// An empty entry stream, for directory entries.
pub fn empty_stream() -> ByteStream {
    Box::pin(futures::stream::empty())
}

/// A single-chunk stream over an in-memory buffer (RAR entries).
pub fn buffer_stream(data: Vec<u8>) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(Bytes::from(data)) }))
}
