//! Create job execution: resolve the requested keys into archive entries
//! (expanding directories), stream the handler's output into a multipart
//! upload, and publish the result for durable status polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use object_gateway::{GenericObjectStore, ListRequest, PartSpec, PutOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::archive::orchestrator::{ArchiveOrchestrator, ProgressReporter};
use crate::archive::queue::{JobProgress, JobRecord, JobState};
use crate::archive::{ArchiveFormat, ByteStream, CreateEntry, EntryContentSource};
use crate::context::OwnerId;
use crate::error::ApiError;
use crate::{cache_keys, is_internal_key};

/// S3 requires every part except the last to be at least 5 MiB; 8 keeps the
/// part count low for big archives.
const PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJob {
    pub owner_id: String,
    /// Owner-relative keys: files, or directories to be expanded.
    pub keys: Vec<String>,
    pub output_format: ArchiveFormat,
    /// Owner-relative key the finished archive lands at.
    pub output_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResult {
    pub archive_key: String,
    pub archive_size: u64,
}

/// Opens entry bodies for the handler and tracks which entry is in flight
/// so progress reporting can name it.
struct GatewaySource {
    store: GenericObjectStore,
    cancel: CancellationToken,
    opened: Arc<AtomicU64>,
    current: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl EntryContentSource for GatewaySource {
    async fn open(&self, source_key: &str) -> Result<ByteStream, ApiError> {
        self.opened.fetch_add(1, Ordering::Relaxed);
        *self.current.lock() = Some(source_key.to_string());
        let body = self.store.get(source_key, None, &self.cancel).await?;
        Ok(body.stream)
    }
}

pub(super) async fn run(
    orch: &ArchiveOrchestrator,
    mut record: JobRecord<CreateJob>,
    shutdown: &CancellationToken,
) {
    let owner = OwnerId::from_raw(record.payload.owner_id.clone());
    let job_cancel = shutdown.child_token();

    let canceller = {
        let kv = orch.kv.clone();
        let flag_key = cache_keys::create_cancel(&record.id);
        let token = job_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {}
                }
                if matches!(kv.get_raw(&flag_key).await, Ok(Some(_))) {
                    token.cancel();
                    break;
                }
            }
        })
    };

    let outcome = execute(orch, &owner, &record, &job_cancel).await;
    canceller.abort();

    match outcome {
        Ok((result, mut progress)) => {
            record.state = JobState::Completed;
            progress.phase = "completed".to_string();
            progress.current_entry = None;
            record.progress = Some(progress);
            if let Err(err) = orch
                .kv
                .set_json(
                    &cache_keys::create_result(&record.id),
                    &result,
                    Some(orch.config.result_ttl),
                )
                .await
            {
                tracing::warn!("could not cache create result for {}: {err}", record.id);
            }
            if let Err(err) = orch.listing.invalidate_listing(&owner).await {
                tracing::warn!("listing invalidation failed after create: {err}");
            }
        }
        Err(_) if shutdown.is_cancelled() => {
            record.state = JobState::Waiting;
            if let Err(err) = orch.create_queue.save(&mut record).await {
                tracing::error!("could not persist create job {}: {err}", record.id);
            }
            if let Err(err) = orch.create_queue.requeue(&record.id).await {
                tracing::error!("could not requeue create job {}: {err}", record.id);
            }
            return;
        }
        Err(_) if job_cancel.is_cancelled() => {
            record.state = JobState::Cancelled;
            tracing::info!("create job {} cancelled", record.id);
        }
        Err(err) => {
            record.state = JobState::Failed;
            record.failed_reason = Some(err.to_string());
            tracing::warn!("create job {} failed: {err}", record.id);
        }
    }

    if let Err(err) = orch.create_queue.save(&mut record).await {
        tracing::error!("could not persist create job {}: {err}", record.id);
    }
}

/// Expand the requested keys into concrete archive entries. A key that
/// heads as an object becomes one entry; otherwise it is treated as a
/// directory and every object under it is pulled in (placeholders and
/// `.secure/` excluded).
async fn resolve_entries(
    orch: &ArchiveOrchestrator,
    owner: &OwnerId,
    keys: &[String],
    cancel: &CancellationToken,
) -> Result<Vec<CreateEntry>, ApiError> {
    let mut entries = Vec::new();
    let mut total_bytes = 0u64;

    for key in keys {
        let abs = owner.key(key);
        match orch.store.head(&abs, cancel).await {
            Ok(head) => {
                total_bytes += head.size;
                entries.push(CreateEntry {
                    archive_path: utils::path::file_name(key).to_string(),
                    source_key: abs,
                    size: head.size,
                });
            }
            Err(e) if e.is_not_found() => {
                let dir = utils::path::normalize_dir(key);
                let dir_prefix = format!("{}{}/", owner.key_prefix(), dir);
                let dir_name = utils::path::file_name(&dir).to_string();
                let mut found_any = false;
                let mut continuation_token = None;
                loop {
                    let page = orch
                        .store
                        .list_page(
                            &ListRequest {
                                prefix: dir_prefix.clone(),
                                continuation_token,
                                ..Default::default()
                            },
                            cancel,
                        )
                        .await?;
                    for object in page.objects {
                        let relative = object
                            .key
                            .strip_prefix(&owner.key_prefix())
                            .unwrap_or(&object.key);
                        if is_internal_key(relative) {
                            continue;
                        }
                        let inner = &object.key[dir_prefix.len()..];
                        found_any = true;
                        total_bytes += object.size;
                        entries.push(CreateEntry {
                            archive_path: format!("{dir_name}/{inner}"),
                            source_key: object.key.clone(),
                            size: object.size,
                        });
                    }
                    match page.next_continuation_token {
                        Some(token) => continuation_token = Some(token),
                        None => break,
                    }
                }
                if !found_any {
                    return Err(ApiError::NotFound(
                        format!("source {key} not found").into(),
                    ));
                }
            }
            Err(e) => return Err(e.into()),
        }

        if entries.len() as u64 > orch.config.create_max_files {
            return Err(ApiError::BadRequest("too many files for archive".into()));
        }
        if total_bytes > orch.config.create_max_total_bytes {
            return Err(ApiError::BadRequest("archive sources too large".into()));
        }
    }
    Ok(entries)
}

fn content_type_for(format: ArchiveFormat) -> &'static str {
    match format {
        ArchiveFormat::Zip => "application/zip",
        ArchiveFormat::Tar => "application/x-tar",
        ArchiveFormat::TarGz => "application/gzip",
        ArchiveFormat::Rar => "application/vnd.rar",
    }
}

async fn execute(
    orch: &ArchiveOrchestrator,
    owner: &OwnerId,
    record: &JobRecord<CreateJob>,
    job_cancel: &CancellationToken,
) -> Result<(CreateResult, JobProgress), ApiError> {
    let job = &record.payload;
    let entries = resolve_entries(orch, owner, &job.keys, job_cancel).await?;
    let total_bytes: u64 = entries.iter().map(|e| e.size).sum();

    let mut progress = ProgressReporter::new(
        orch.create_queue.clone(),
        record.clone(),
        orch.config.progress_entries_step,
        orch.config.progress_bytes_step,
    );
    progress.set_total_entries(entries.len() as u64);
    progress.begin("creating", total_bytes).await?;

    let opened = Arc::new(AtomicU64::new(0));
    let current = Arc::new(Mutex::new(None));
    let source = Arc::new(GatewaySource {
        store: orch.store.clone(),
        cancel: job_cancel.clone(),
        opened: opened.clone(),
        current: current.clone(),
    });

    let handler = orch.registry.handler(job.output_format);
    let output = handler.create(entries, source, job_cancel).await?;

    let out_abs = owner.key(&job.output_key);
    let opts = PutOptions {
        content_type: Some(content_type_for(job.output_format).to_string()),
        metadata: None,
    };
    let upload_id = orch
        .store
        .create_multipart(&out_abs, &opts, job_cancel)
        .await?;

    let uploaded = pump_multipart(
        orch,
        &out_abs,
        &upload_id,
        output.stream,
        job_cancel,
        &mut progress,
        &opened,
        &current,
    )
    .await;

    // the writer task's error is more precise than a broken-pipe read
    let writer_result = match output.completion.await {
        Ok(result) => result,
        Err(join_err) => Err(ApiError::Internal(
            anyhow::Error::new(join_err).context("archive writer panicked"),
        )),
    };

    let (parts, archive_size) = match (writer_result, uploaded) {
        (Ok(()), Ok(done)) => done,
        (Err(err), _) | (Ok(()), Err(err)) => {
            if let Err(abort_err) = orch
                .store
                .abort_multipart(&out_abs, &upload_id, &CancellationToken::new())
                .await
            {
                tracing::warn!("could not abort multipart upload {upload_id}: {abort_err}");
            }
            return Err(err);
        }
    };
    orch.store
        .complete_multipart(&out_abs, &upload_id, &parts, job_cancel)
        .await?;

    progress.flush().await?;
    Ok((
        CreateResult {
            archive_key: job.output_key.clone(),
            archive_size,
        },
        progress.snapshot(),
    ))
}

#[allow(clippy::too_many_arguments)]
async fn pump_multipart(
    orch: &ArchiveOrchestrator,
    key: &str,
    upload_id: &str,
    mut stream: ByteStream,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<CreateJob>,
    opened: &AtomicU64,
    current: &Mutex<Option<String>>,
) -> Result<(Vec<PartSpec>, u64), ApiError> {
    let mut buffer = BytesMut::new();
    let mut parts: Vec<PartSpec> = Vec::new();
    let mut uploaded_bytes = 0u64;

    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => {
                return Err(ApiError::Internal(anyhow::anyhow!(
                    "archive creation cancelled"
                )));
            }
        };
        let Some(chunk) = chunk else { break };
        let chunk =
            chunk.map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("read archive")))?;
        buffer.extend_from_slice(&chunk);

        while buffer.len() >= PART_SIZE {
            let part = buffer.split_to(PART_SIZE).freeze();
            let part_number = parts.len() as i32 + 1;
            uploaded_bytes += part.len() as u64;
            let etag = orch
                .store
                .upload_part(key, upload_id, part_number, part, cancel)
                .await?;
            parts.push(PartSpec { part_number, etag });
        }

        let current_value = current.lock().clone();
        progress
            .set_counters(
                opened.load(Ordering::Relaxed),
                uploaded_bytes + buffer.len() as u64,
                current_value,
            )
            .await?;
    }

    if !buffer.is_empty() || parts.is_empty() {
        let part = buffer.freeze();
        let part_number = parts.len() as i32 + 1;
        uploaded_bytes += part.len() as u64;
        let etag = orch
            .store
            .upload_part(key, upload_id, part_number, part, cancel)
            .await?;
        parts.push(PartSpec { part_number, etag });
    }

    Ok((parts, uploaded_bytes))
}
