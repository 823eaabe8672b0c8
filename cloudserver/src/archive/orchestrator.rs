//! Archive job orchestration: queue workers, progress reporting, the public
//! start/status/cancel surface and synchronous preview.

use std::sync::Arc;
use std::time::Duration;

use kv_store::GenericKvStore;
use object_gateway::GenericObjectStore;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::archive::create::{self, CreateJob, CreateResult};
use crate::archive::extract::{self, ExtractJob};
use crate::archive::queue::{JobProgress, JobQueue, JobRecord, JobState};
use crate::archive::{ArchiveFormat, EntryInfo, HandlerRegistry};
use crate::cache_keys;
use crate::config::ArchiveConfig;
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::listing::ListingService;
use crate::usage::UsageTracker;

const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Job state as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CreateResult>,
}

pub struct ArchiveOrchestrator {
    pub(super) store: GenericObjectStore,
    pub(super) kv: GenericKvStore,
    pub(super) usage: UsageTracker,
    pub(super) listing: ListingService,
    pub(super) config: ArchiveConfig,
    pub(super) registry: HandlerRegistry,
    pub(super) extract_queue: JobQueue,
    pub(super) create_queue: JobQueue,
}

impl ArchiveOrchestrator {
    pub fn new(
        store: GenericObjectStore,
        kv: GenericKvStore,
        usage: UsageTracker,
        listing: ListingService,
        config: ArchiveConfig,
    ) -> Self {
        let registry = HandlerRegistry::new(&config);
        let extract_queue = JobQueue::new(kv.clone(), "archive-extract", config.result_ttl);
        let create_queue = JobQueue::new(kv.clone(), "archive-create", config.result_ttl);
        Self {
            store,
            kv,
            usage,
            listing,
            config,
            registry,
            extract_queue,
            create_queue,
        }
    }

    /// Spawn the extract and create worker pools. Workers drain their queue,
    /// then park until notified or the poll interval elapses.
    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for worker in 0..self.config.extract_job_concurrency.max(1) {
            let orch = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                tracing::info!("archive extract worker {worker} started");
                while !shutdown.is_cancelled() {
                    match orch.extract_queue.take_next::<ExtractJob>().await {
                        Ok(Some(record)) => extract::run(&orch, record, &shutdown).await,
                        Ok(None) => {
                            orch.extract_queue
                                .wait_for_work(WORKER_POLL_INTERVAL, &shutdown)
                                .await
                        }
                        Err(err) => {
                            tracing::error!("extract queue read failed: {err}");
                            orch.extract_queue
                                .wait_for_work(WORKER_POLL_INTERVAL, &shutdown)
                                .await
                        }
                    }
                }
            }));
        }
        for worker in 0..self.config.create_job_concurrency.max(1) {
            let orch = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                tracing::info!("archive create worker {worker} started");
                while !shutdown.is_cancelled() {
                    match orch.create_queue.take_next::<CreateJob>().await {
                        Ok(Some(record)) => create::run(&orch, record, &shutdown).await,
                        Ok(None) => {
                            orch.create_queue
                                .wait_for_work(WORKER_POLL_INTERVAL, &shutdown)
                                .await
                        }
                        Err(err) => {
                            tracing::error!("create queue read failed: {err}");
                            orch.create_queue
                                .wait_for_work(WORKER_POLL_INTERVAL, &shutdown)
                                .await
                        }
                    }
                }
            }));
        }
        handles
    }

    fn resolve_format(key: &str, format: Option<ArchiveFormat>) -> Result<ArchiveFormat, ApiError> {
        format
            .or_else(|| ArchiveFormat::detect(key))
            .ok_or_else(|| ApiError::BadRequest("unsupported archive format".into()))
    }

    /// Enqueue an extraction; returns the job id for status polling.
    pub async fn start_extract(
        &self,
        ctx: &RequestContext,
        key: &str,
        format: Option<ArchiveFormat>,
        selected_entries: Option<Vec<String>>,
    ) -> Result<String, ApiError> {
        let key = utils::path::normalize_dir(key);
        let format = Self::resolve_format(&key, format)?;
        // fail fast on a missing archive instead of queueing a doomed job
        self.store.head(&ctx.owner.key(&key), &ctx.cancel).await?;

        self.extract_queue
            .enqueue(ExtractJob {
                owner_id: ctx.owner.as_str().to_string(),
                key,
                format,
                selected_entries,
            })
            .await
    }

    pub async fn extract_status(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<JobStatus, ApiError> {
        let record = self
            .extract_queue
            .get::<ExtractJob>(job_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("job not found".into()))?;
        if record.payload.owner_id != ctx.owner.as_str() {
            return Err(ApiError::Forbidden("job belongs to another owner".into()));
        }
        Ok(JobStatus {
            id: record.id,
            state: record.state,
            progress: record.progress,
            failed_reason: record.failed_reason,
            result: None,
        })
    }

    /// Cancel an extract job: atomically when still queued, cooperatively
    /// (via the KV flag the worker polls) when already running.
    pub async fn cancel_extract(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<(), ApiError> {
        let record = self
            .extract_queue
            .get::<ExtractJob>(job_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("job not found".into()))?;
        if record.payload.owner_id != ctx.owner.as_str() {
            return Err(ApiError::Forbidden("job belongs to another owner".into()));
        }
        if self.extract_queue.cancel_waiting::<ExtractJob>(job_id).await? {
            return Ok(());
        }
        self.kv
            .set_raw(
                &cache_keys::extract_cancel(job_id),
                "1",
                Some(self.config.cancel_flag_ttl),
            )
            .await?;
        Ok(())
    }

    pub async fn start_create(
        &self,
        ctx: &RequestContext,
        keys: Vec<String>,
        output_format: ArchiveFormat,
        archive_name: Option<&str>,
    ) -> Result<String, ApiError> {
        if !output_format.supports_creation() {
            return Err(ApiError::BadRequest(
                format!("{output_format} archives cannot be created").into(),
            ));
        }
        if keys.is_empty() {
            return Err(ApiError::BadRequest("no source keys provided".into()));
        }
        let name = archive_name
            .map(utils::path::normalize_dir)
            .filter(|n| !n.is_empty() && utils::path::is_valid_leaf_name(n))
            .unwrap_or_else(|| "archive".to_string());
        let output_key = format!(
            ".archives/{}/{}.{}",
            uuid::Uuid::new_v4(),
            name,
            output_format.extensions()[0],
        );

        self.create_queue
            .enqueue(CreateJob {
                owner_id: ctx.owner.as_str().to_string(),
                keys: keys.iter().map(|k| utils::path::normalize_dir(k)).collect(),
                output_format,
                output_key,
            })
            .await
    }

    pub async fn create_status(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<JobStatus, ApiError> {
        let record = self
            .create_queue
            .get::<CreateJob>(job_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("job not found".into()))?;
        if record.payload.owner_id != ctx.owner.as_str() {
            return Err(ApiError::Forbidden("job belongs to another owner".into()));
        }
        // the result outlives the job record eviction window for pollers
        let result = self
            .kv
            .get_json::<CreateResult>(&cache_keys::create_result(job_id))
            .await?;
        Ok(JobStatus {
            id: record.id,
            state: record.state,
            progress: record.progress,
            failed_reason: record.failed_reason,
            result,
        })
    }

    pub async fn cancel_create(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<(), ApiError> {
        let record = self
            .create_queue
            .get::<CreateJob>(job_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("job not found".into()))?;
        if record.payload.owner_id != ctx.owner.as_str() {
            return Err(ApiError::Forbidden("job belongs to another owner".into()));
        }
        if self.create_queue.cancel_waiting::<CreateJob>(job_id).await? {
            return Ok(());
        }
        self.kv
            .set_raw(
                &cache_keys::create_cancel(job_id),
                "1",
                Some(self.config.cancel_flag_ttl),
            )
            .await?;
        Ok(())
    }

    /// Synchronous entry listing of an archive, for preview UIs.
    pub async fn preview(
        &self,
        ctx: &RequestContext,
        key: &str,
        format: Option<ArchiveFormat>,
    ) -> Result<Vec<EntryInfo>, ApiError> {
        let key = utils::path::normalize_dir(key);
        let format = Self::resolve_format(&key, format)?;
        let abs_key = ctx.owner.key(&key);

        let head = self.store.head(&abs_key, &ctx.cancel).await?;
        if head.size > self.config.preview_max_bytes {
            return Err(ApiError::BadRequest(
                "archive too large to preview".into(),
            ));
        }

        let body = self.store.get(&abs_key, None, &ctx.cancel).await?;
        self.registry
            .handler(format)
            .list_entries(body.stream, body.size, &self.config.extract_limits)
            .await
    }
}

/// Writes job progress, rate-limited: an update goes out only when the
/// entry delta or the byte delta since the last write crosses its step.
pub(super) struct ProgressReporter<T> {
    queue: JobQueue,
    record: JobRecord<T>,
    entries_step: u64,
    bytes_step: u64,
    last_entries: u64,
    last_bytes: u64,
}

impl<T: Clone + Serialize> ProgressReporter<T> {
    pub(super) fn new(
        queue: JobQueue,
        record: JobRecord<T>,
        entries_step: u64,
        bytes_step: u64,
    ) -> Self {
        Self {
            queue,
            record,
            entries_step: entries_step.max(1),
            bytes_step: bytes_step.max(1),
            last_entries: 0,
            last_bytes: 0,
        }
    }

    fn progress_mut(&mut self) -> &mut JobProgress {
        self.record.progress.get_or_insert_with(JobProgress::default)
    }

    pub(super) async fn begin(&mut self, phase: &str, total_bytes: u64) -> Result<(), ApiError> {
        let progress = self.progress_mut();
        progress.phase = phase.to_string();
        progress.total_bytes = total_bytes;
        self.queue.save(&mut self.record).await
    }

    /// Advance by deltas (extract path).
    pub(super) async fn step(
        &mut self,
        entries_delta: u64,
        bytes_delta: u64,
        current_entry: Option<String>,
    ) -> Result<(), ApiError> {
        let progress = self.progress_mut();
        progress.entries_processed += entries_delta;
        progress.bytes_processed += bytes_delta;
        progress.current_entry = current_entry;
        self.maybe_save().await
    }

    /// Set absolute counters (create path, where totals are read off shared
    /// counters).
    pub(super) async fn set_counters(
        &mut self,
        entries_processed: u64,
        bytes_processed: u64,
        current_entry: Option<String>,
    ) -> Result<(), ApiError> {
        let progress = self.progress_mut();
        progress.entries_processed = entries_processed;
        progress.bytes_processed = bytes_processed;
        progress.current_entry = current_entry;
        self.maybe_save().await
    }

    pub(super) fn set_total_entries(&mut self, total: u64) {
        self.progress_mut().total_entries = Some(total);
    }

    async fn maybe_save(&mut self) -> Result<(), ApiError> {
        let progress = self.record.progress.as_ref().expect("progress initialized");
        let due = progress.entries_processed - self.last_entries >= self.entries_step
            || progress.bytes_processed - self.last_bytes >= self.bytes_step;
        if due {
            self.last_entries = progress.entries_processed;
            self.last_bytes = progress.bytes_processed;
            self.queue.save(&mut self.record).await?;
        }
        Ok(())
    }

    pub(super) async fn flush(&mut self) -> Result<(), ApiError> {
        let progress = self.record.progress.as_ref().expect("progress initialized");
        self.last_entries = progress.entries_processed;
        self.last_bytes = progress.bytes_processed;
        self.queue.save(&mut self.record).await
    }

    pub(super) fn snapshot(&self) -> JobProgress {
        self.record.progress.clone().unwrap_or_default()
    }
}
