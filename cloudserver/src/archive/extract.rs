//! Extract job execution: pull the archive, stream entries through the
//! format handler, upload each entry with bounded concurrency, account the
//! bytes and invalidate caches.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::archive::orchestrator::{ArchiveOrchestrator, ProgressReporter};
use crate::archive::queue::{JobRecord, JobState};
use crate::archive::{ArchiveFormat, EntryKind, EntrySink, ExtractedEntry};
use crate::context::OwnerId;
use crate::error::ApiError;
use crate::{cache_keys, metadata};

use futures::StreamExt;
use object_gateway::{GenericObjectStore, PutOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractJob {
    pub owner_id: String,
    /// Owner-relative key of the archive object.
    pub key: String,
    pub format: ArchiveFormat,
    /// When present, only these entry paths (or entries under these
    /// directory paths) are written; everything else is skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_entries: Option<Vec<String>>,
}

/// Uploads extracted entries as they arrive. Entries reach `entry()` in
/// source order; uploads run in parallel up to the configured width, with
/// the permit acquired before the handler may feed the next entry, which is
/// what bounds decode read-ahead.
pub(super) struct UploadSink {
    store: GenericObjectStore,
    owner: OwnerId,
    extract_prefix: String,
    /// Archive base name; a single top-level folder with this name is
    /// stripped from entry paths.
    strip_top: String,
    selected: Option<HashSet<String>>,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Result<(), ApiError>>,
    cancel: CancellationToken,
    progress: ProgressReporter<ExtractJob>,
}

impl UploadSink {
    pub(super) fn new(
        store: GenericObjectStore,
        owner: OwnerId,
        extract_prefix: String,
        selected: Option<Vec<String>>,
        concurrency: usize,
        cancel: CancellationToken,
        progress: ProgressReporter<ExtractJob>,
    ) -> Self {
        let strip_top = utils::path::file_name(&extract_prefix).to_string();
        Self {
            store,
            owner,
            strip_top,
            extract_prefix,
            selected: selected.map(|s| s.into_iter().collect()),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: JoinSet::new(),
            cancel,
            progress,
        }
    }

    /// Entry path -> target path under the extract prefix, or `None` when
    /// the entry must be skipped (unsafe path, deselected, directory).
    fn target_path(&self, entry: &ExtractedEntry) -> Option<String> {
        if entry.kind == EntryKind::Directory {
            return None;
        }
        let safe = utils::path::normalize_archive_entry_path(&entry.path)?;

        let stripped = match safe.split_once('/') {
            Some((first, rest)) if first == self.strip_top => rest.to_string(),
            _ => safe,
        };

        if let Some(selected) = &self.selected {
            let direct = selected.contains(&stripped);
            let under_selected_dir = selected
                .iter()
                .any(|sel| stripped.starts_with(&format!("{sel}/")));
            if !direct && !under_selected_dir {
                return None;
            }
        }
        Some(format!("{}/{}", self.extract_prefix, stripped))
    }

    /// Wait for all in-flight uploads; first error wins.
    pub(super) async fn finish(mut self) -> Result<ProgressReporter<ExtractJob>, ApiError> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => first_error = first_error.or(Some(err)),
                Err(join_err) => {
                    first_error = first_error.or(Some(ApiError::Internal(
                        anyhow::Error::new(join_err).context("entry upload panicked"),
                    )))
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(self.progress),
        }
    }
}

#[async_trait]
impl EntrySink for UploadSink {
    async fn entry(&mut self, entry: ExtractedEntry) -> Result<(), ApiError> {
        // surface upload failures as early as possible
        while let Some(joined) = self.tasks.try_join_next() {
            joined
                .map_err(|e| ApiError::Internal(anyhow::Error::new(e).context("entry upload")))??;
        }

        self.progress
            .step(1, entry.size, Some(entry.path.clone()))
            .await?;

        let Some(target) = self.target_path(&entry) else {
            // the decoder still needs the bytes consumed to move on
            let mut stream = entry.stream;
            self.tasks.spawn(async move {
                while stream.next().await.is_some() {}
                Ok(())
            });
            return Ok(());
        };

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        let store = self.store.clone();
        let key = self.owner.key(&target);
        let size = entry.size;
        let stream = entry.stream;
        let cancel = self.cancel.clone();
        let content_type = metadata::mime_type_for(&target, None);
        let is_image = utils::path::extension(&target)
            .map(|e| metadata::is_image_extension(&e))
            .unwrap_or(false);

        self.tasks.spawn(async move {
            let _permit = permit;
            store
                .put(
                    &key,
                    stream,
                    size,
                    &PutOptions {
                        content_type: Some(content_type),
                        metadata: None,
                    },
                    &cancel,
                )
                .await?;
            if is_image {
                if let Err(err) = metadata::process_image(&store, &key, &cancel).await {
                    tracing::warn!("image metadata processing failed for {key}: {err}");
                }
            }
            Ok(())
        });
        Ok(())
    }
}

/// Execute one extract job end to end and persist its terminal state.
pub(super) async fn run(
    orch: &ArchiveOrchestrator,
    mut record: JobRecord<ExtractJob>,
    shutdown: &CancellationToken,
) {
    let owner = OwnerId::from_raw(record.payload.owner_id.clone());
    let job_cancel = shutdown.child_token();

    // poll the shared cancel flag and trip the token cooperatively
    let canceller = {
        let kv = orch.kv.clone();
        let flag_key = cache_keys::extract_cancel(&record.id);
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
        Ok((uncompressed_bytes, mut progress)) => {
            record.state = JobState::Completed;
            progress.phase = "completed".to_string();
            progress.current_entry = None;
            record.progress = Some(progress);
            if let Err(err) = orch.usage.add(&owner, uncompressed_bytes).await {
                tracing::warn!("usage increment failed after extract: {err}");
            }
            let prefix = utils::path::archive_extract_prefix(
                &record.payload.key,
                record.payload.format.extensions(),
            );
            if let Err(err) = orch
                .listing
                .invalidate_thumbnails_for_dir(&owner, &prefix)
                .await
            {
                tracing::warn!("thumbnail invalidation failed after extract: {err}");
            }
            if let Err(err) = orch.listing.invalidate_listing(&owner).await {
                tracing::warn!("listing invalidation failed after extract: {err}");
            }
        }
        Err(_) if shutdown.is_cancelled() => {
            // worker is going away: hand the job back for a re-run, which
            // is safe because entry uploads are idempotent overwrites
            record.state = JobState::Waiting;
            if let Err(err) = orch.extract_queue.save(&mut record).await {
                tracing::error!("could not persist extract job {}: {err}", record.id);
            }
            if let Err(err) = orch.extract_queue.requeue(&record.id).await {
                tracing::error!("could not requeue extract job {}: {err}", record.id);
            }
            return;
        }
        Err(_) if job_cancel.is_cancelled() => {
            record.state = JobState::Cancelled;
            tracing::info!("extract job {} cancelled", record.id);
        }
        Err(err) => {
            record.state = JobState::Failed;
            record.failed_reason = Some(err.to_string());
            tracing::warn!("extract job {} failed: {err}", record.id);
        }
    }

    if let Err(err) = orch.extract_queue.save(&mut record).await {
        tracing::error!("could not persist extract job {}: {err}", record.id);
    }
}

async fn execute(
    orch: &ArchiveOrchestrator,
    owner: &OwnerId,
    record: &JobRecord<ExtractJob>,
    job_cancel: &CancellationToken,
) -> Result<(u64, crate::archive::queue::JobProgress), ApiError> {
    let job = &record.payload;
    let abs_key = owner.key(&job.key);
    let body = orch
        .store
        .get(&abs_key, None, job_cancel)
        .await
        .map_err(|e| match e {
            object_gateway::GatewayError::NotFound => {
                ApiError::NotFound("archive not found".into())
            }
            other => other.into(),
        })?;

    let extract_prefix =
        utils::path::archive_extract_prefix(&job.key, job.format.extensions());

    let mut progress = ProgressReporter::new(
        orch.extract_queue.clone(),
        record.clone(),
        orch.config.progress_entries_step,
        orch.config.progress_bytes_step,
    );
    progress.begin("extracting", body.size).await?;

    let mut sink = UploadSink::new(
        orch.store.clone(),
        owner.clone(),
        extract_prefix,
        job.selected_entries.clone(),
        orch.config.entry_concurrency,
        job_cancel.clone(),
        progress,
    );

    let handler = orch.registry.handler(job.format);
    let summary = handler
        .extract(
            body.stream,
            body.size,
            &orch.config.extract_limits,
            &mut sink,
            job_cancel,
        )
        .await;

    // uploads must settle regardless of how the decode ended
    let finished = sink.finish().await;
    let summary = summary?;
    let mut progress = finished?;
    progress.flush().await?;

    Ok((summary.uncompressed_bytes, progress.snapshot()))
}
