//! TAR and TAR.GZ handlers, fully streaming in both directions.
//!
//! Reading goes source stream -> (gunzip) -> tar entries; each entry's bytes
//! are forwarded chunk by chunk into the sink's bounded channel. Writing
//! goes tar builder -> (gzip) -> duplex pipe, which the create orchestrator
//! drains into a multipart upload. Nothing buffers more than a chunk.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

use crate::archive::{
    empty_stream, ArchiveFormat, ArchiveHandler, ByteStream, CountingStream, CreateEntry,
    CreateOutput, EntryContentSource, EntryInfo, EntryKind, EntrySink, ExtractSummary,
    ExtractedEntry, LimitTracker,
};
use crate::config::ExtractLimits;
use crate::error::ApiError;

const CHUNK_SIZE: usize = 64 * 1024;

fn malformed(err: impl std::fmt::Display) -> ApiError {
    ApiError::BadRequest(format!("malformed tar archive: {err}").into())
}

pub struct TarHandler {
    gzipped: bool,
}

impl TarHandler {
    pub fn plain() -> Self {
        Self { gzipped: false }
    }

    pub fn gzipped() -> Self {
        Self { gzipped: true }
    }

    fn reader(
        &self,
        source: ByteStream,
    ) -> (Box<dyn AsyncRead + Send + Sync + Unpin>, Arc<AtomicU64>) {
        let (counting, compressed) = CountingStream::new(source);
        let reader = StreamReader::new(counting);
        if self.gzipped {
            (Box::new(GzipDecoder::new(reader)), compressed)
        } else {
            (Box::new(reader), compressed)
        }
    }
}

#[async_trait]
impl ArchiveHandler for TarHandler {
    fn format(&self) -> ArchiveFormat {
        if self.gzipped {
            ArchiveFormat::TarGz
        } else {
            ArchiveFormat::Tar
        }
    }

    async fn list_entries(
        &self,
        source: ByteStream,
        _total_bytes: u64,
        limits: &ExtractLimits,
    ) -> Result<Vec<EntryInfo>, ApiError> {
        let (reader, compressed) = self.reader(source);
        let mut tracker = LimitTracker::new(limits.clone(), compressed);

        let mut archive = tokio_tar::Archive::new(reader);
        let mut entries = archive.entries().map_err(malformed)?;
        let mut infos = Vec::new();
        while let Some(entry) = entries.next().await {
            let entry = entry.map_err(malformed)?;
            let header = entry.header();
            let size = header.size().map_err(malformed)?;
            tracker.on_entry(size)?;
            let kind = if header.entry_type().is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            let path = entry.path().map_err(malformed)?.to_string_lossy().into_owned();
            infos.push(EntryInfo { path, kind, size });
        }
        Ok(infos)
    }

    async fn extract(
        &self,
        source: ByteStream,
        _total_bytes: u64,
        limits: &ExtractLimits,
        sink: &mut dyn EntrySink,
        cancel: &CancellationToken,
    ) -> Result<ExtractSummary, ApiError> {
        let (reader, compressed) = self.reader(source);
        let mut tracker = LimitTracker::new(limits.clone(), compressed);

        let mut archive = tokio_tar::Archive::new(reader);
        let mut entries = archive.entries().map_err(malformed)?;
        while let Some(entry) = entries.next().await {
            if cancel.is_cancelled() {
                return Err(ApiError::Internal(anyhow::anyhow!("extraction cancelled")));
            }
            let mut entry = entry.map_err(malformed)?;
            let path = entry.path().map_err(malformed)?.to_string_lossy().into_owned();
            let header = entry.header();
            let size = header.size().map_err(malformed)?;
            let is_dir = header.entry_type().is_dir();
            tracker.on_entry(size)?;

            if is_dir {
                sink.entry(ExtractedEntry {
                    path,
                    kind: EntryKind::Directory,
                    size: 0,
                    stream: empty_stream(),
                })
                .await?;
                continue;
            }

            let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
            sink.entry(ExtractedEntry {
                path,
                kind: EntryKind::File,
                size,
                stream: Box::pin(ReceiverStream::new(rx)),
            })
            .await?;

            let mut entry_total = 0u64;
            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut receiver_gone = false;
            loop {
                let n = entry.read(&mut buf).await.map_err(malformed)?;
                if n == 0 {
                    break;
                }
                entry_total += n as u64;
                if let Err(err) = tracker.on_bytes(n as u64, entry_total) {
                    // poison the entry stream so a partial body is never
                    // committed downstream
                    let _ = tx
                        .send(Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "extraction aborted",
                        )))
                        .await;
                    return Err(err);
                }
                if !receiver_gone
                    && tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err()
                {
                    // consumer went away; keep reading so the archive cursor
                    // advances past this entry
                    receiver_gone = true;
                }
            }
        }
        Ok(tracker.summary())
    }

    async fn create(
        &self,
        entries: Vec<CreateEntry>,
        source: Arc<dyn EntryContentSource>,
        cancel: &CancellationToken,
    ) -> Result<CreateOutput, ApiError> {
        let (read_half, write_half) = tokio::io::duplex(CHUNK_SIZE);
        let gzipped = self.gzipped;
        let cancel = cancel.clone();

        let completion = tokio::spawn(async move {
            let writer: Box<dyn AsyncWrite + Send + Sync + Unpin> = if gzipped {
                Box::new(GzipEncoder::new(write_half))
            } else {
                Box::new(write_half)
            };
            let mut builder = tokio_tar::Builder::new(writer);
            for entry in entries {
                if cancel.is_cancelled() {
                    return Err(ApiError::Internal(anyhow::anyhow!(
                        "archive creation cancelled"
                    )));
                }
                let mut header = tokio_tar::Header::new_gnu();
                header.set_size(entry.size);
                header.set_mode(0o644);
                header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
                let stream = source.open(&entry.source_key).await?;
                let reader = StreamReader::new(stream);
                builder
                    .append_data(&mut header, entry.archive_path.as_str(), reader)
                    .await
                    .map_err(|e| {
                        ApiError::Internal(anyhow::Error::new(e).context("append tar entry"))
                    })?;
            }
            let mut inner = builder
                .into_inner()
                .await
                .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("finish tar")))?;
            inner
                .shutdown()
                .await
                .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("flush archive")))?;
            Ok(())
        });

        Ok(CreateOutput {
            stream: Box::pin(ReaderStream::new(read_half)),
            completion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::buffer_stream;
    use futures::TryStreamExt;
    use parking_lot::Mutex;

    fn limits() -> ExtractLimits {
        ExtractLimits {
            max_entries: 100,
            max_entry_bytes: 1 << 20,
            max_total_bytes: 1 << 24,
            max_compression_ratio: 1000.0,
        }
    }

    /// Collects extracted entries into memory for assertions.
    struct CollectingSink {
        entries: Arc<Mutex<Vec<(String, EntryKind, Vec<u8>)>>>,
        tasks: Vec<tokio::task::JoinHandle<()>>,
    }

    impl CollectingSink {
        fn new() -> Self {
            Self {
                entries: Arc::new(Mutex::new(Vec::new())),
                tasks: Vec::new(),
            }
        }

        async fn finish(self) -> Vec<(String, EntryKind, Vec<u8>)> {
            for task in self.tasks {
                task.await.unwrap();
            }
            Arc::try_unwrap(self.entries).unwrap().into_inner()
        }
    }

    #[async_trait]
    impl EntrySink for CollectingSink {
        async fn entry(&mut self, entry: ExtractedEntry) -> Result<(), ApiError> {
            let entries = self.entries.clone();
            self.tasks.push(tokio::spawn(async move {
                let data: Vec<u8> = entry
                    .stream
                    .try_fold(Vec::new(), |mut acc, chunk| {
                        acc.extend_from_slice(&chunk);
                        async move { Ok(acc) }
                    })
                    .await
                    .unwrap();
                entries.lock().push((entry.path, entry.kind, data));
            }));
            Ok(())
        }
    }

    async fn tar_fixture(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tokio_tar::Builder::new(std::io::Cursor::new(Vec::new()));
        for (path, data) in entries {
            let mut header = tokio_tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, *path, *data).await.unwrap();
        }
        builder.into_inner().await.unwrap().into_inner()
    }

    #[tokio::test]
    async fn roundtrip_extract() {
        let raw = tar_fixture(&[("a.txt", b"alpha"), ("dir/b.txt", b"beta")]).await;
        let handler = TarHandler::plain();
        let mut sink = CollectingSink::new();
        let summary = handler
            .extract(
                buffer_stream(raw),
                0,
                &limits(),
                &mut sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.uncompressed_bytes, 9);

        let mut collected = sink.finish().await;
        collected.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(collected[0].0, "a.txt");
        assert_eq!(collected[0].2, b"alpha");
        assert_eq!(collected[1].0, "dir/b.txt");
    }

    #[tokio::test]
    async fn list_reports_entries() {
        let raw = tar_fixture(&[("x", b"1234")]).await;
        let handler = TarHandler::plain();
        let infos = handler
            .list_entries(buffer_stream(raw), 0, &limits())
            .await
            .unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].path, "x");
        assert_eq!(infos[0].size, 4);
        assert_eq!(infos[0].kind, EntryKind::File);
    }

    #[tokio::test]
    async fn entry_limit_aborts() {
        let raw = tar_fixture(&[("a", b"1"), ("b", b"2"), ("c", b"3")]).await;
        let handler = TarHandler::plain();
        let mut sink = CollectingSink::new();
        let restrictive = ExtractLimits {
            max_entries: 2,
            ..limits()
        };
        let err = handler
            .extract(
                buffer_stream(raw),
                0,
                &restrictive,
                &mut sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn garbage_is_bad_request() {
        let handler = TarHandler::plain();
        let mut sink = CollectingSink::new();
        let err = handler
            .extract(
                buffer_stream(vec![0xde; 100]),
                0,
                &limits(),
                &mut sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    struct MemSource(std::collections::HashMap<String, Vec<u8>>);

    #[async_trait]
    impl EntryContentSource for MemSource {
        async fn open(&self, source_key: &str) -> Result<ByteStream, ApiError> {
            let data = self
                .0
                .get(source_key)
                .cloned()
                .ok_or_else(ApiError::file_not_found)?;
            Ok(buffer_stream(data))
        }
    }

    #[tokio::test]
    async fn create_then_extract_roundtrip() {
        let mut files = std::collections::HashMap::new();
        files.insert("u1/a.txt".to_string(), b"hello".to_vec());
        files.insert("u1/d/b.txt".to_string(), b"world!".to_vec());
        let source = Arc::new(MemSource(files));

        let entries = vec![
            CreateEntry {
                archive_path: "a.txt".to_string(),
                source_key: "u1/a.txt".to_string(),
                size: 5,
            },
            CreateEntry {
                archive_path: "d/b.txt".to_string(),
                source_key: "u1/d/b.txt".to_string(),
                size: 6,
            },
        ];

        for handler in [TarHandler::plain(), TarHandler::gzipped()] {
            let output = handler
                .create(entries.clone(), source.clone(), &CancellationToken::new())
                .await
                .unwrap();
            let archive_bytes: Vec<u8> = output
                .stream
                .try_fold(Vec::new(), |mut acc, chunk| {
                    acc.extend_from_slice(&chunk);
                    async move { Ok(acc) }
                })
                .await
                .unwrap();
            output.completion.await.unwrap().unwrap();
            assert!(!archive_bytes.is_empty());

            let mut sink = CollectingSink::new();
            let summary = handler
                .extract(
                    buffer_stream(archive_bytes),
                    0,
                    &limits(),
                    &mut sink,
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(summary.entries, 2);
            let mut collected = sink.finish().await;
            collected.sort_by(|a, b| a.0.cmp(&b.0));
            assert_eq!(collected[0].2, b"hello");
            assert_eq!(collected[1].2, b"world!");
        }
    }
}
