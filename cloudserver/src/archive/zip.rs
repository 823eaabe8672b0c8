//! ZIP handler.
//!
//! The `zip` parser is synchronous, so reads run on a blocking thread behind
//! a `SyncIoBridge`, with entries and their data chunks crossing back over
//! bounded channels. The async side keeps source order and back-pressure:
//! the parser cannot run ahead of the consumer by more than the channel
//! capacities. Creation needs a seekable sink for the central directory, so
//! archives are spooled to an unlinked temp file and streamed out after
//! `finish`.

use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;

use crate::archive::{
    ArchiveFormat, ArchiveHandler, ByteStream, CountingStream, CreateEntry, CreateOutput,
    EntryContentSource, EntryInfo, EntryKind, EntrySink, ExtractSummary, ExtractedEntry,
};
use crate::config::ExtractLimits;
use crate::error::ApiError;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug)]
enum ParseError {
    Limit(&'static str),
    Malformed(String),
    Aborted,
}

impl ParseError {
    fn into_api_error(self) -> ApiError {
        match self {
            Self::Limit(msg) => ApiError::BadRequest(msg.into()),
            Self::Malformed(msg) => {
                ApiError::BadRequest(format!("malformed zip archive: {msg}").into())
            }
            Self::Aborted => ApiError::Internal(anyhow::anyhow!("extraction cancelled")),
        }
    }
}

struct ParsedEntry {
    path: String,
    kind: EntryKind,
    size: u64,
    data: mpsc::Receiver<std::io::Result<Bytes>>,
}

pub struct ZipHandler;

#[async_trait]
impl ArchiveHandler for ZipHandler {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }

    async fn list_entries(
        &self,
        source: ByteStream,
        _total_bytes: u64,
        limits: &ExtractLimits,
    ) -> Result<Vec<EntryInfo>, ApiError> {
        let reader = SyncIoBridge::new(StreamReader::new(source));
        let max_entries = limits.max_entries;

        let infos = tokio::task::spawn_blocking(move || -> Result<Vec<EntryInfo>, ParseError> {
            let mut reader = reader;
            let mut infos = Vec::new();
            loop {
                let file = zip::read::read_zipfile_from_stream(&mut reader)
                    .map_err(|e| ParseError::Malformed(e.to_string()))?;
                let Some(file) = file else { break };
                if infos.len() as u64 >= max_entries {
                    return Err(ParseError::Limit("archive has too many entries"));
                }
                let name = file.name().to_string();
                let kind = if name.ends_with('/') {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                infos.push(EntryInfo {
                    path: name,
                    kind,
                    size: file.size(),
                });
                // dropping the entry drains its data so the next header is
                // reachable
            }
            Ok(infos)
        })
        .await
        .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("zip listing panicked")))?;

        infos.map_err(ParseError::into_api_error)
    }

    async fn extract(
        &self,
        source: ByteStream,
        _total_bytes: u64,
        limits: &ExtractLimits,
        sink: &mut dyn EntrySink,
        cancel: &CancellationToken,
    ) -> Result<ExtractSummary, ApiError> {
        let (counting, compressed) = CountingStream::new(source);
        let reader = SyncIoBridge::new(StreamReader::new(counting));

        let abort = Arc::new(AtomicBool::new(false));
        let (entry_tx, mut entry_rx) = mpsc::channel::<ParsedEntry>(2);

        let parser = {
            let abort = abort.clone();
            let limits = limits.clone();
            let compressed = compressed.clone();
            tokio::task::spawn_blocking(move || -> Result<(u64, u64), ParseError> {
                let mut reader = reader;
                let mut entries = 0u64;
                let mut total = 0u64;
                loop {
                    if abort.load(Ordering::Relaxed) {
                        return Err(ParseError::Aborted);
                    }
                    let file = zip::read::read_zipfile_from_stream(&mut reader)
                        .map_err(|e| ParseError::Malformed(e.to_string()))?;
                    let Some(mut file) = file else { break };

                    entries += 1;
                    if entries > limits.max_entries {
                        return Err(ParseError::Limit("archive has too many entries"));
                    }
                    let name = file.name().to_string();
                    let declared = file.size();
                    if declared > limits.max_entry_bytes {
                        return Err(ParseError::Limit("archive entry too large"));
                    }

                    if name.ends_with('/') {
                        let (_tx, rx) = mpsc::channel(1);
                        entry_tx
                            .blocking_send(ParsedEntry {
                                path: name,
                                kind: EntryKind::Directory,
                                size: 0,
                                data: rx,
                            })
                            .map_err(|_| ParseError::Aborted)?;
                        continue;
                    }

                    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
                    entry_tx
                        .blocking_send(ParsedEntry {
                            path: name,
                            kind: EntryKind::File,
                            size: declared,
                            data: rx,
                        })
                        .map_err(|_| ParseError::Aborted)?;

                    let mut entry_total = 0u64;
                    let mut receiver_gone = false;
                    let mut buf = vec![0u8; CHUNK_SIZE];
                    loop {
                        if abort.load(Ordering::Relaxed) {
                            return Err(ParseError::Aborted);
                        }
                        let n = file
                            .read(&mut buf)
                            .map_err(|e| ParseError::Malformed(e.to_string()))?;
                        if n == 0 {
                            break;
                        }
                        entry_total += n as u64;
                        total += n as u64;
                        let violation = if entry_total > limits.max_entry_bytes {
                            Some(ParseError::Limit("archive entry too large"))
                        } else if total > limits.max_total_bytes {
                            Some(ParseError::Limit("archive too large"))
                        } else {
                            let compressed_read = compressed.load(Ordering::Relaxed).max(1);
                            if total as f64 / compressed_read as f64
                                > limits.max_compression_ratio
                            {
                                Some(ParseError::Limit("compression ratio limit exceeded"))
                            } else {
                                None
                            }
                        };
                        if let Some(err) = violation {
                            // poison the entry stream so a partial body is
                            // never committed downstream
                            let _ = tx.blocking_send(Err(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                "extraction aborted",
                            )));
                            return Err(err);
                        }
                        if !receiver_gone
                            && tx
                                .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                                .is_err()
                        {
                            receiver_gone = true;
                        }
                    }
                }
                Ok((entries, total))
            })
        };

        let mut sink_error: Option<ApiError> = None;
        while let Some(parsed) = entry_rx.recv().await {
            if cancel.is_cancelled() {
                abort.store(true, Ordering::Relaxed);
                break;
            }
            let entry = ExtractedEntry {
                path: parsed.path,
                kind: parsed.kind,
                size: parsed.size,
                stream: Box::pin(ReceiverStream::new(parsed.data)),
            };
            if let Err(err) = sink.entry(entry).await {
                abort.store(true, Ordering::Relaxed);
                sink_error = Some(err);
                break;
            }
        }
        // drain remaining headers so the parser can exit
        drop(entry_rx);

        let parsed = parser
            .await
            .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("zip parser panicked")))?;

        if let Some(err) = sink_error {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(ApiError::Internal(anyhow::anyhow!("extraction cancelled")));
        }
        match parsed {
            Ok((entries, uncompressed_bytes)) => Ok(ExtractSummary {
                entries,
                uncompressed_bytes,
            }),
            Err(err) => Err(err.into_api_error()),
        }
    }

    async fn create(
        &self,
        entries: Vec<CreateEntry>,
        source: Arc<dyn EntryContentSource>,
        cancel: &CancellationToken,
    ) -> Result<CreateOutput, ApiError> {
        type BridgedReader = SyncIoBridge<StreamReader<ByteStream, Bytes>>;

        let (req_tx, mut req_rx) = mpsc::channel::<String>(1);
        let (resp_tx, resp_rx) = mpsc::channel::<Result<BridgedReader, ApiError>>(1);

        // Opens entry streams on the runtime on behalf of the blocking
        // writer thread.
        let opener = tokio::spawn(async move {
            while let Some(key) = req_rx.recv().await {
                let bridged = source
                    .open(&key)
                    .await
                    .map(|stream| SyncIoBridge::new(StreamReader::new(stream)));
                if resp_tx.send(bridged).await.is_err() {
                    break;
                }
            }
        });

        let cancel = cancel.clone();
        let writer_task =
            tokio::task::spawn_blocking(move || -> Result<std::fs::File, ApiError> {
                let mut resp_rx = resp_rx;
                let spool = tempfile::tempfile().map_err(|e| {
                    ApiError::Internal(anyhow::Error::new(e).context("create zip spool file"))
                })?;
                let mut writer = zip::ZipWriter::new(spool);
                let options = SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Deflated);
                for entry in entries {
                    if cancel.is_cancelled() {
                        return Err(ApiError::Internal(anyhow::anyhow!(
                            "archive creation cancelled"
                        )));
                    }
                    writer
                        .start_file(entry.archive_path.as_str(), options)
                        .map_err(|e| {
                            ApiError::Internal(anyhow::Error::new(e).context("start zip entry"))
                        })?;
                    req_tx
                        .blocking_send(entry.source_key.clone())
                        .map_err(|_| ApiError::Internal(anyhow::anyhow!("entry opener gone")))?;
                    let mut reader = resp_rx
                        .blocking_recv()
                        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("entry opener gone")))??;
                    std::io::copy(&mut reader, &mut writer).map_err(|e| {
                        ApiError::Internal(anyhow::Error::new(e).context("write zip entry"))
                    })?;
                }
                let mut spool = writer.finish().map_err(|e| {
                    ApiError::Internal(anyhow::Error::new(e).context("finish zip"))
                })?;
                spool.seek(SeekFrom::Start(0)).map_err(|e| {
                    ApiError::Internal(anyhow::Error::new(e).context("rewind zip spool"))
                })?;
                Ok(spool)
            });

        let (out_tx, out_rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
        let completion = tokio::spawn(async move {
            let spool = match writer_task.await {
                Ok(Ok(file)) => file,
                Ok(Err(err)) => {
                    opener.abort();
                    return Err(err);
                }
                Err(join_err) => {
                    opener.abort();
                    return Err(ApiError::Internal(
                        anyhow::Error::new(join_err).context("zip writer panicked"),
                    ));
                }
            };
            opener.abort();

            let mut file = tokio::fs::File::from_std(spool);
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await.map_err(|e| {
                    ApiError::Internal(anyhow::Error::new(e).context("read zip spool"))
                })?;
                if n == 0 {
                    break;
                }
                if out_tx
                    .send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .is_err()
                {
                    return Err(ApiError::Internal(anyhow::anyhow!(
                        "archive consumer went away"
                    )));
                }
            }
            Ok(())
        });

        Ok(CreateOutput {
            stream: Box::pin(ReceiverStream::new(out_rx)),
            completion,
        })
    }
}
