//! The service facade: composition root for every subsystem, plus the
//! cross-cutting behavior that wraps each public operation: encrypted
//! folder access checks, the idempotency envelope for mutations, and cache
//! invalidation fan-out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kv_store::GenericKvStore;
use object_gateway::{GenericObjectStore, PartSpec};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;

use crate::archive::orchestrator::{ArchiveOrchestrator, JobStatus};
use crate::archive::{ArchiveFormat, EntryInfo};
use crate::config::Config;
use crate::context::RequestContext;
use crate::directory::{DeleteOutcome, DirectoryService, SessionGrant};
use crate::download::{self, ThrottledDownload};
use crate::error::ApiError;
use crate::listing::search::{SearchRequest, SearchResults};
use crate::listing::{ListResult, ListingService, PagedDirectories, PagedObjects};
use crate::model::{Breadcrumb, ObjectRecord};
use crate::object::ObjectService;
use crate::scanner::{self, Scanner, ScannerHandle, ScanStatus};
use crate::upload::{CompletedUploadRecord, CreatedUpload, UploadService};
use crate::usage::{self, SubscriptionProvider, UsageTracker, UsageReport};
use crate::{cache_keys, model};

pub struct CloudService {
    config: Config,
    store: GenericObjectStore,
    kv: GenericKvStore,
    directories: DirectoryService,
    listing: ListingService,
    objects: ObjectService,
    uploads: UploadService,
    usage: UsageTracker,
    subscriptions: Arc<dyn SubscriptionProvider>,
    archive: Arc<ArchiveOrchestrator>,
    scanner: ScannerHandle,
    scanner_tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl CloudService {
    pub fn new(
        config: Config,
        store: GenericObjectStore,
        kv: GenericKvStore,
        subscriptions: Arc<dyn SubscriptionProvider>,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        let directories = DirectoryService::new(
            store.clone(),
            kv.clone(),
            config.manifest_cache_ttl,
            config.session_ttl,
        );
        let listing = ListingService::new(
            store.clone(),
            kv.clone(),
            directories.clone(),
            config.listing.clone(),
            config.presign.clone(),
        );
        let objects = ObjectService::new(store.clone(), config.presign.clone());
        let usage = UsageTracker::new(store.clone(), kv.clone());
        let uploads = UploadService::new(
            store.clone(),
            usage.clone(),
            subscriptions.clone(),
            config.presign.clone(),
        );
        let archive = Arc::new(ArchiveOrchestrator::new(
            store.clone(),
            kv.clone(),
            usage.clone(),
            listing.clone(),
            config.archive.clone(),
        ));
        let (scanner, scanner_tasks) =
            Scanner::spawn(store.clone(), kv.clone(), config.av.clone(), shutdown);

        Arc::new(Self {
            config,
            store,
            kv,
            directories,
            listing,
            objects,
            uploads,
            usage,
            subscriptions,
            archive,
            scanner,
            scanner_tasks: parking_lot::Mutex::new(scanner_tasks),
        })
    }

    /// Start the archive queue workers. Call once at boot.
    pub fn spawn_workers(
        &self,
        shutdown: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = self.archive.spawn_workers(shutdown);
        handles.append(&mut self.scanner_tasks.lock());
        handles
    }

    pub fn store(&self) -> &GenericObjectStore {
        &self.store
    }

    pub fn directories(&self) -> &DirectoryService {
        &self.directories
    }

    // ---- idempotency envelope -------------------------------------------

    async fn replayed<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        action: &str,
    ) -> Result<Option<T>, ApiError> {
        let Some(idem_key) = ctx.idempotency_key.as_deref() else {
            return Ok(None);
        };
        let key = cache_keys::idempotency(&ctx.owner, action, idem_key);
        Ok(self.kv.get_json(&key).await?)
    }

    async fn remember<T: Serialize>(
        &self,
        ctx: &RequestContext,
        action: &str,
        result: &T,
    ) -> Result<(), ApiError> {
        let Some(idem_key) = ctx.idempotency_key.as_deref() else {
            return Ok(());
        };
        let key = cache_keys::idempotency(&ctx.owner, action, idem_key);
        self.kv
            .set_json(&key, result, Some(self.config.idempotency_ttl))
            .await?;
        Ok(())
    }

    // ---- cache invalidation ---------------------------------------------

    async fn invalidate_after_mutation(
        &self,
        ctx: &RequestContext,
        touched_keys: &[&str],
    ) -> Result<(), ApiError> {
        self.listing.invalidate_listing(&ctx.owner).await?;
        for key in touched_keys {
            self.listing
                .invalidate_thumbnails_for_key(&ctx.owner, key)
                .await?;
        }
        Ok(())
    }

    // ---- listings --------------------------------------------------------

    pub async fn list(
        &self,
        ctx: &RequestContext,
        path: &str,
        delimited: bool,
        want_metadata: bool,
    ) -> Result<ListResult, ApiError> {
        self.directories.access_check(ctx, path).await?;
        self.listing.list(ctx, path, delimited, want_metadata).await
    }

    pub async fn list_objects(
        &self,
        ctx: &RequestContext,
        path: &str,
        skip: usize,
        take: usize,
        want_metadata: bool,
        search: Option<&str>,
    ) -> Result<PagedObjects, ApiError> {
        self.directories.access_check(ctx, path).await?;
        self.listing
            .list_objects(ctx, path, skip, take, want_metadata, search)
            .await
    }

    pub async fn list_directories(
        &self,
        ctx: &RequestContext,
        path: &str,
        skip: usize,
        take: usize,
        search: Option<&str>,
    ) -> Result<PagedDirectories, ApiError> {
        self.directories.access_check(ctx, path).await?;
        self.listing
            .list_directories(ctx, path, skip, take, search)
            .await
    }

    pub fn list_breadcrumb(&self, path: &str) -> Vec<Breadcrumb> {
        model::breadcrumbs_for(path)
    }

    pub async fn search(
        &self,
        ctx: &RequestContext,
        request: &SearchRequest,
    ) -> Result<SearchResults, ApiError> {
        if let Some(path) = &request.path {
            self.directories.access_check(ctx, path).await?;
        }
        crate::listing::search::search(&self.listing, ctx, request).await
    }

    // ---- objects ---------------------------------------------------------

    pub async fn find(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> Result<ObjectRecord, ApiError> {
        self.directories.access_check(ctx, key).await?;
        self.objects.find(ctx, key).await
    }

    pub async fn presigned_url(
        &self,
        ctx: &RequestContext,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<String, ApiError> {
        self.directories.access_check(ctx, key).await?;
        self.objects.presigned_url(ctx, key, ttl).await
    }

    pub async fn download(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> Result<ThrottledDownload, ApiError> {
        self.directories.access_check(ctx, key).await?;
        let subscription = self.subscriptions.subscription(&ctx.owner).await?;
        let speed = usage::download_speed_bytes_per_sec(&subscription);
        download::download(&self.store, ctx, key, speed).await
    }

    pub async fn move_objects(
        &self,
        ctx: &RequestContext,
        source_keys: &[String],
        destination_dir: &str,
    ) -> Result<(), ApiError> {
        for key in source_keys {
            self.directories.access_check(ctx, key).await?;
        }
        self.directories.access_check(ctx, destination_dir).await?;
        if self.replayed::<()>(ctx, "move").await?.is_some() {
            return Ok(());
        }

        self.objects
            .move_objects(ctx, source_keys, destination_dir)
            .await?;

        let mut touched: Vec<&str> = source_keys.iter().map(String::as_str).collect();
        touched.push(destination_dir);
        self.invalidate_after_mutation(ctx, &touched).await?;
        self.remember(ctx, "move", &()).await
    }

    pub async fn delete_objects(
        &self,
        ctx: &RequestContext,
        keys: &[String],
    ) -> Result<(), ApiError> {
        for key in keys {
            self.directories.access_check(ctx, key).await?;
        }
        if self.replayed::<()>(ctx, "delete").await?.is_some() {
            return Ok(());
        }

        // sizes must be read before the objects go away
        let mut freed = 0u64;
        for key in keys {
            match self.store.head(&ctx.owner.key(key), &ctx.cancel).await {
                Ok(head) => freed += head.size,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.objects.delete(ctx, keys).await?;
        self.usage.subtract(&ctx.owner, freed).await?;

        let touched: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.invalidate_after_mutation(ctx, &touched).await?;
        self.remember(ctx, "delete", &()).await
    }

    pub async fn update_object(
        &self,
        ctx: &RequestContext,
        key: &str,
        new_name: Option<&str>,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<String, ApiError> {
        self.directories.access_check(ctx, key).await?;
        if let Some(prior) = self.replayed::<String>(ctx, "update").await? {
            return Ok(prior);
        }

        let new_key = self.objects.update(ctx, key, new_name, metadata).await?;
        self.invalidate_after_mutation(ctx, &[key, &new_key]).await?;
        self.remember(ctx, "update", &new_key).await?;
        Ok(new_key)
    }

    // ---- directories -----------------------------------------------------

    pub async fn create_directory(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: Option<&str>,
    ) -> Result<(), ApiError> {
        self.directories.access_check(ctx, path).await?;
        if self.replayed::<()>(ctx, "create-directory").await?.is_some() {
            return Ok(());
        }
        self.directories.create(ctx, path, passphrase).await?;
        self.invalidate_after_mutation(ctx, &[path]).await?;
        self.remember(ctx, "create-directory", &()).await
    }

    pub async fn rename_directory(
        &self,
        ctx: &RequestContext,
        source: &str,
        new_name: &str,
        allow_encrypted: bool,
    ) -> Result<String, ApiError> {
        if allow_encrypted {
            // the encrypted-rename surface still demands a valid session
            self.directories.access_check(ctx, source).await?;
        }
        if let Some(prior) = self.replayed::<String>(ctx, "rename-directory").await? {
            return Ok(prior);
        }

        let target = self
            .directories
            .rename(ctx, source, new_name, allow_encrypted)
            .await?;
        self.invalidate_after_mutation(ctx, &[source, &target]).await?;
        self.remember(ctx, "rename-directory", &target).await?;
        Ok(target)
    }

    pub async fn delete_directory(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: Option<&str>,
    ) -> Result<DeleteOutcome, ApiError> {
        self.directories.access_check(ctx, path).await?;
        let outcome = self.directories.delete(ctx, path, passphrase).await?;
        self.usage.subtract(&ctx.owner, outcome.bytes_freed).await?;
        self.invalidate_after_mutation(ctx, &[path]).await?;
        Ok(outcome)
    }

    pub async fn unlock_directory(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<SessionGrant, ApiError> {
        let grant = self.directories.unlock(ctx, path, passphrase).await?;
        // cached listings only record token *presence*, so any session
        // change makes them stale
        self.listing.invalidate_listing(&ctx.owner).await?;
        Ok(grant)
    }

    pub async fn lock_directory(&self, ctx: &RequestContext, path: &str) -> Result<(), ApiError> {
        self.directories.lock(ctx, path).await?;
        self.listing.invalidate_listing(&ctx.owner).await
    }

    pub async fn encrypt_directory(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<(), ApiError> {
        self.directories.access_check(ctx, path).await?;
        self.directories.encrypt(ctx, path, passphrase).await?;
        self.listing.invalidate_listing(&ctx.owner).await
    }

    pub async fn decrypt_directory(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<(), ApiError> {
        self.directories.decrypt(ctx, path, passphrase).await?;
        self.listing.invalidate_listing(&ctx.owner).await
    }

    pub async fn hide_directory(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<(), ApiError> {
        self.directories.access_check(ctx, path).await?;
        self.directories.hide(ctx, path, passphrase).await?;
        self.listing.invalidate_listing(&ctx.owner).await
    }

    pub async fn unhide_directory(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<(), ApiError> {
        self.directories.unhide(ctx, path, passphrase).await?;
        self.listing.invalidate_listing(&ctx.owner).await
    }

    pub async fn reveal_directory(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<SessionGrant, ApiError> {
        let grant = self.directories.reveal(ctx, path, passphrase).await?;
        self.listing.invalidate_listing(&ctx.owner).await?;
        Ok(grant)
    }

    pub async fn conceal_directory(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<(), ApiError> {
        self.directories.conceal(ctx, path).await?;
        self.listing.invalidate_listing(&ctx.owner).await
    }

    // ---- uploads ---------------------------------------------------------

    pub async fn upload_create(
        &self,
        ctx: &RequestContext,
        key: &str,
        content_type: Option<&str>,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<CreatedUpload, ApiError> {
        self.directories.access_check(ctx, key).await?;
        self.uploads.create(ctx, key, content_type, metadata).await
    }

    pub async fn upload_part_url(
        &self,
        ctx: &RequestContext,
        key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> Result<String, ApiError> {
        self.uploads.part_url(ctx, key, upload_id, part_number).await
    }

    pub async fn upload_part(
        &self,
        ctx: &RequestContext,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        content_md5: Option<&str>,
    ) -> Result<String, ApiError> {
        self.uploads
            .upload_part(ctx, key, upload_id, part_number, body, content_md5)
            .await
    }

    pub async fn upload_complete(
        &self,
        ctx: &RequestContext,
        key: &str,
        upload_id: &str,
        parts: &[PartSpec],
    ) -> Result<CompletedUploadRecord, ApiError> {
        if let Some(prior) = self
            .replayed::<CompletedUploadRecord>(ctx, "upload-complete")
            .await?
        {
            return Ok(prior);
        }

        let completed = self.uploads.complete(ctx, key, upload_id, parts).await?;
        self.scanner.enqueue(&ctx.owner, key);
        self.invalidate_after_mutation(ctx, &[key]).await?;
        self.remember(ctx, "upload-complete", &completed).await?;
        Ok(completed)
    }

    pub async fn upload_abort(
        &self,
        ctx: &RequestContext,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ApiError> {
        self.uploads.abort(ctx, key, upload_id).await
    }

    // ---- archive ---------------------------------------------------------

    pub async fn archive_extract_start(
        &self,
        ctx: &RequestContext,
        key: &str,
        format: Option<ArchiveFormat>,
        selected_entries: Option<Vec<String>>,
    ) -> Result<String, ApiError> {
        self.directories.access_check(ctx, key).await?;
        self.archive
            .start_extract(ctx, key, format, selected_entries)
            .await
    }

    pub async fn archive_extract_status(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<JobStatus, ApiError> {
        self.archive.extract_status(ctx, job_id).await
    }

    pub async fn archive_extract_cancel(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<(), ApiError> {
        self.archive.cancel_extract(ctx, job_id).await
    }

    pub async fn archive_preview(
        &self,
        ctx: &RequestContext,
        key: &str,
        format: Option<ArchiveFormat>,
    ) -> Result<Vec<EntryInfo>, ApiError> {
        self.directories.access_check(ctx, key).await?;
        self.archive.preview(ctx, key, format).await
    }

    pub async fn archive_create_start(
        &self,
        ctx: &RequestContext,
        keys: Vec<String>,
        output_format: ArchiveFormat,
        archive_name: Option<&str>,
    ) -> Result<String, ApiError> {
        for key in &keys {
            self.directories.access_check(ctx, key).await?;
        }
        self.archive
            .start_create(ctx, keys, output_format, archive_name)
            .await
    }

    pub async fn archive_create_status(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<JobStatus, ApiError> {
        self.archive.create_status(ctx, job_id).await
    }

    pub async fn archive_create_cancel(
        &self,
        ctx: &RequestContext,
        job_id: &str,
    ) -> Result<(), ApiError> {
        self.archive.cancel_create(ctx, job_id).await
    }

    // ---- misc ------------------------------------------------------------

    pub async fn scan_status(
        &self,
        ctx: &RequestContext,
        key: &str,
    ) -> Result<Option<ScanStatus>, ApiError> {
        scanner::scan_status(&self.kv, &ctx.owner, key).await
    }

    pub async fn storage_usage(&self, ctx: &RequestContext) -> Result<UsageReport, ApiError> {
        let subscription = self.subscriptions.subscription(&ctx.owner).await?;
        self.usage.report(&ctx.owner, &subscription, &ctx.cancel).await
    }
}
