//! RAR handler, read-only.
//!
//! The unrar binding works against a file on disk and decodes whole entries
//! at a time, so this handler is the documented exception to the streaming
//! rule: the archive body is spooled to an unlinked temp file (bounded by
//! `RAR_MAX_BUFFER_BYTES`) and entries are handed to the sink as single
//! in-memory buffers. Creation is not supported; the default `create`
//! rejection stands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::archive::{
    buffer_stream, empty_stream, ArchiveFormat, ArchiveHandler, ByteStream, EntryInfo, EntryKind,
    EntrySink, ExtractSummary, ExtractedEntry,
};
use crate::config::ExtractLimits;
use crate::error::ApiError;

fn malformed(err: impl std::fmt::Display) -> ApiError {
    ApiError::BadRequest(format!("malformed rar archive: {err}").into())
}

fn internal(context: &'static str) -> impl FnOnce(std::io::Error) -> ApiError {
    move |e| ApiError::Internal(anyhow::Error::new(e).context(context))
}

pub struct RarHandler {
    max_buffer_bytes: u64,
}

impl RarHandler {
    pub fn new(max_buffer_bytes: u64) -> Self {
        Self { max_buffer_bytes }
    }

    /// Spool the source stream into an unlinked temp file the binding can
    /// open by path. `total_bytes` is checked up front, the spooled size
    /// again while writing (the declared size may lie).
    async fn spool(
        &self,
        mut source: ByteStream,
        total_bytes: u64,
    ) -> Result<tempfile::TempPath, ApiError> {
        if total_bytes > self.max_buffer_bytes {
            return Err(ApiError::BadRequest(
                "rar archive exceeds the buffering limit".into(),
            ));
        }
        let spool = tempfile::NamedTempFile::new().map_err(internal("create rar spool"))?;
        let path = spool.into_temp_path();
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(internal("open rar spool"))?;

        let mut written = 0u64;
        while let Some(chunk) = source.next().await {
            let chunk = chunk.map_err(internal("read rar source"))?;
            written += chunk.len() as u64;
            if written > self.max_buffer_bytes {
                return Err(ApiError::BadRequest(
                    "rar archive exceeds the buffering limit".into(),
                ));
            }
            file.write_all(&chunk)
                .await
                .map_err(internal("write rar spool"))?;
        }
        file.flush().await.map_err(internal("flush rar spool"))?;
        Ok(path)
    }
}

struct RarEntry {
    path: String,
    kind: EntryKind,
    data: Vec<u8>,
}

#[async_trait]
impl ArchiveHandler for RarHandler {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Rar
    }

    async fn list_entries(
        &self,
        source: ByteStream,
        total_bytes: u64,
        limits: &ExtractLimits,
    ) -> Result<Vec<EntryInfo>, ApiError> {
        let spool = self.spool(source, total_bytes).await?;
        let max_entries = limits.max_entries;

        let infos = tokio::task::spawn_blocking(move || -> Result<Vec<EntryInfo>, ApiError> {
            let archive = unrar::Archive::new(&spool)
                .open_for_listing()
                .map_err(malformed)?;
            let mut infos = Vec::new();
            for entry in archive {
                let entry = entry.map_err(malformed)?;
                if infos.len() as u64 >= max_entries {
                    return Err(ApiError::BadRequest("archive has too many entries".into()));
                }
                let kind = if entry.is_directory() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                infos.push(EntryInfo {
                    path: entry.filename.to_string_lossy().into_owned(),
                    kind,
                    size: entry.unpacked_size as u64,
                });
            }
            Ok(infos)
        })
        .await
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("rar listing panicked")))?;

        infos
    }

    async fn extract(
        &self,
        source: ByteStream,
        total_bytes: u64,
        limits: &ExtractLimits,
        sink: &mut dyn EntrySink,
        cancel: &CancellationToken,
    ) -> Result<ExtractSummary, ApiError> {
        let spool = self.spool(source, total_bytes).await?;
        let compressed = total_bytes.max(1);
        let abort = Arc::new(AtomicBool::new(false));
        let (entry_tx, mut entry_rx) = mpsc::channel::<RarEntry>(1);

        let walker = {
            let abort = abort.clone();
            let limits = limits.clone();
            tokio::task::spawn_blocking(move || -> Result<(u64, u64), ApiError> {
                let mut archive = unrar::Archive::new(&spool)
                    .open_for_processing()
                    .map_err(malformed)?;
                let mut entries = 0u64;
                let mut total = 0u64;
                while let Some(header) = archive.read_header().map_err(malformed)? {
                    if abort.load(Ordering::Relaxed) {
                        return Err(ApiError::Internal(anyhow::anyhow!(
                            "extraction cancelled"
                        )));
                    }
                    let entry = header.entry();
                    let path = entry.filename.to_string_lossy().into_owned();
                    let is_dir = entry.is_directory();
                    let declared = entry.unpacked_size as u64;

                    entries += 1;
                    if entries > limits.max_entries {
                        return Err(ApiError::BadRequest("archive has too many entries".into()));
                    }
                    if declared > limits.max_entry_bytes {
                        return Err(ApiError::BadRequest("archive entry too large".into()));
                    }

                    archive = if is_dir {
                        entry_tx
                            .blocking_send(RarEntry {
                                path,
                                kind: EntryKind::Directory,
                                data: Vec::new(),
                            })
                            .map_err(|_| {
                                ApiError::Internal(anyhow::anyhow!("extraction cancelled"))
                            })?;
                        header.skip().map_err(malformed)?
                    } else {
                        let (data, rest) = header.read().map_err(malformed)?;
                        total += data.len() as u64;
                        if data.len() as u64 > limits.max_entry_bytes {
                            return Err(ApiError::BadRequest("archive entry too large".into()));
                        }
                        if total > limits.max_total_bytes {
                            return Err(ApiError::BadRequest("archive too large".into()));
                        }
                        if total as f64 / compressed as f64 > limits.max_compression_ratio {
                            return Err(ApiError::BadRequest(
                                "compression ratio limit exceeded".into(),
                            ));
                        }
                        entry_tx
                            .blocking_send(RarEntry {
                                path,
                                kind: EntryKind::File,
                                data,
                            })
                            .map_err(|_| {
                                ApiError::Internal(anyhow::anyhow!("extraction cancelled"))
                            })?;
                        rest
                    };
                }
                Ok((entries, total))
            })
        };

        let mut sink_error: Option<ApiError> = None;
        while let Some(entry) = entry_rx.recv().await {
            if cancel.is_cancelled() {
                abort.store(true, Ordering::Relaxed);
                break;
            }
            let size = entry.data.len() as u64;
            let stream = if entry.data.is_empty() {
                empty_stream()
            } else {
                buffer_stream(entry.data)
            };
            if let Err(err) = sink
                .entry(ExtractedEntry {
                    path: entry.path,
                    kind: entry.kind,
                    size,
                    stream,
                })
                .await
            {
                abort.store(true, Ordering::Relaxed);
                sink_error = Some(err);
                break;
            }
        }
        drop(entry_rx);

        let walked = walker
            .await
            .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("rar walker panicked")))?;

        if let Some(err) = sink_error {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(ApiError::Internal(anyhow::anyhow!("extraction cancelled")));
        }
        let (entries, uncompressed_bytes) = walked?;
        Ok(ExtractSummary {
            entries,
            uncompressed_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversized_archive_is_rejected_before_spooling() {
        let handler = RarHandler::new(1024);
        let err = handler
            .spool(buffer_stream(vec![0u8; 10]), 4096)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn lying_size_is_caught_while_spooling() {
        let handler = RarHandler::new(16);
        let err = handler
            .spool(buffer_stream(vec![0u8; 64]), 0)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn garbage_is_bad_request() {
        let handler = RarHandler::new(1 << 20);
        let limits = ExtractLimits {
            max_entries: 10,
            max_entry_bytes: 1 << 20,
            max_total_bytes: 1 << 20,
            max_compression_ratio: 100.0,
        };
        let err = handler
            .list_entries(buffer_stream(b"Rar!\x1a\x07but no".to_vec()), 12, &limits)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
