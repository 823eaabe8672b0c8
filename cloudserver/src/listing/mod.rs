//! Listing engine: directory listings, breadcrumbs, object pagination and
//! the listing cache.
//!
//! Every read here goes through ListObjectsV2 pages on the gateway; nothing
//! is indexed anywhere else. Results are cached per owner under canonical
//! keys and invalidated wholesale (pattern delete) after any mutation.

pub mod search;
pub mod thumbnails;

use std::time::Duration;

use futures::StreamExt;
use kv_store::GenericKvStore;
use object_gateway::{GenericObjectStore, ListRequest, ListedObject};
use serde::{Deserialize, Serialize};

use crate::config::{ListingConfig, PresignConfig};
use crate::context::RequestContext;
use crate::directory::DirectoryService;
use crate::error::ApiError;
use crate::model::{Breadcrumb, DirectoryRecord, ObjectRecord};
use crate::{cache_keys, is_internal_key, metadata, model};
use crate::context::OwnerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult {
    pub breadcrumbs: Vec<Breadcrumb>,
    pub directories: Vec<DirectoryRecord>,
    pub objects: Vec<ObjectRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedObjects {
    pub objects: Vec<ObjectRecord>,
    pub total_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedDirectories {
    pub directories: Vec<DirectoryRecord>,
    pub total_count: usize,
}

#[derive(Clone)]
pub struct ListingService {
    store: GenericObjectStore,
    kv: GenericKvStore,
    directories: DirectoryService,
    config: ListingConfig,
    presign: PresignConfig,
}

impl ListingService {
    pub fn new(
        store: GenericObjectStore,
        kv: GenericKvStore,
        directories: DirectoryService,
        config: ListingConfig,
        presign: PresignConfig,
    ) -> Self {
        Self {
            store,
            kv,
            directories,
            config,
            presign,
        }
    }

    fn list_prefix(ctx: &RequestContext, path: &str) -> String {
        if path.is_empty() {
            ctx.owner.key_prefix()
        } else {
            format!("{}{}/", ctx.owner.key_prefix(), path)
        }
    }

    /// Key relative to the owner prefix, as surfaced to callers.
    fn relative_key<'a>(ctx: &RequestContext, key: &'a str) -> &'a str {
        key.strip_prefix(&ctx.owner.key_prefix()).unwrap_or(key)
    }

    pub(crate) async fn object_url(&self, key: &str) -> Result<String, ApiError> {
        if self.presign.enabled {
            Ok(self.store.presign_get(key, self.presign.expiry).await?)
        } else {
            Ok(self.store.public_url(key))
        }
    }

    /// Build the caller-facing record for one listed object. With
    /// `want_metadata` the object is headed for its stored content type and
    /// user metadata.
    pub(crate) async fn build_object_record(
        &self,
        ctx: &RequestContext,
        listed: &ListedObject,
        want_metadata: bool,
    ) -> Result<ObjectRecord, ApiError> {
        let relative = Self::relative_key(ctx, &listed.key).to_string();
        let name = utils::path::file_name(&relative).to_string();
        let extension = utils::path::extension(&relative);

        let (content_type, decoded_metadata) = if want_metadata {
            match self.store.head(&listed.key, &ctx.cancel).await {
                Ok(head) => (
                    head.content_type.clone(),
                    metadata::decode_from_store(&head.metadata),
                ),
                // The object vanished between list and head: degrade to the
                // listing data rather than failing the whole page.
                Err(e) if e.is_not_found() => (None, Default::default()),
                Err(e) => return Err(e.into()),
            }
        } else {
            (None, Default::default())
        };

        let url = self.object_url(&listed.key).await?;
        Ok(ObjectRecord {
            mime_type: metadata::mime_type_for(&relative, content_type.as_deref()),
            name,
            extension,
            file: model::FileRef {
                host: self.store.public_hostname().to_string(),
                key: relative,
                url,
            },
            metadata: decoded_metadata,
            size: listed.size,
            etag: listed.etag.clone(),
            last_modified: listed.last_modified.into(),
        })
    }

    /// Head-enriched records for a batch of objects, bounded both in how
    /// many objects get metadata at all and how many heads run in parallel.
    async fn build_object_records(
        &self,
        ctx: &RequestContext,
        objects: &[ListedObject],
        want_metadata: bool,
    ) -> Result<Vec<ObjectRecord>, ApiError> {
        let metadata_cutoff = if want_metadata {
            self.config.metadata_max
        } else {
            0
        };
        let results: Vec<Result<ObjectRecord, ApiError>> = futures::stream::iter(
            objects
                .iter()
                .enumerate()
                .map(|(i, obj)| self.build_object_record(ctx, obj, i < metadata_cutoff)),
        )
        .buffered(self.config.metadata_concurrency.max(1))
        .collect()
        .await;
        results.into_iter().collect()
    }

    /// Full listing of one directory level: breadcrumbs, classified child
    /// directories and objects. Cached.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        path: &str,
        delimited: bool,
        want_metadata: bool,
    ) -> Result<ListResult, ApiError> {
        let path = utils::path::normalize_dir(path);
        let cache_key = cache_keys::listing_full(
            &ctx.owner,
            &path,
            delimited,
            want_metadata,
            ctx.folder_session.is_some(),
            ctx.hidden_session.is_some(),
        );
        if let Some(cached) = self.kv.get_json::<ListResult>(&cache_key).await? {
            return Ok(cached);
        }

        let prefix = Self::list_prefix(ctx, &path);
        let mut raw_objects = Vec::new();
        let mut raw_prefixes = Vec::new();
        let mut continuation_token = None;
        loop {
            let page = self
                .store
                .list_page(
                    &ListRequest {
                        prefix: prefix.clone(),
                        delimited,
                        continuation_token,
                        ..Default::default()
                    },
                    &ctx.cancel,
                )
                .await?;
            raw_objects.extend(page.objects);
            raw_prefixes.extend(page.common_prefixes);
            match page.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        let encrypted = self
            .directories
            .encrypted_manifest(&ctx.owner, &ctx.cancel)
            .await?;
        let hidden = self
            .directories
            .hidden_manifest(&ctx.owner, &ctx.cancel)
            .await?;

        let mut directories = Vec::new();
        for raw_prefix in &raw_prefixes {
            let dir_path =
                utils::path::normalize_dir(Self::relative_key(ctx, raw_prefix));
            if is_internal_key(&dir_path) {
                continue;
            }
            let flags = self
                .directories
                .classify(ctx, &dir_path, &encrypted, &hidden)
                .await?;
            if flags.is_concealed {
                continue;
            }
            let thumbnails = if flags.is_locked {
                Vec::new()
            } else {
                thumbnails::directory_thumbnails(self, ctx, &dir_path).await?
            };
            directories.push(DirectoryRecord {
                name: utils::path::file_name(&dir_path).to_string(),
                prefix: dir_path,
                is_encrypted: flags.is_encrypted,
                is_locked: flags.is_locked,
                is_hidden: flags.is_hidden,
                is_concealed: flags.is_concealed,
                thumbnails,
            });
        }

        let visible: Vec<ListedObject> = raw_objects
            .into_iter()
            .filter(|o| !is_internal_key(Self::relative_key(ctx, &o.key)))
            .collect();
        let objects = self
            .build_object_records(ctx, &visible, want_metadata)
            .await?;

        let result = ListResult {
            breadcrumbs: model::breadcrumbs_for(&path),
            directories,
            objects,
        };
        self.kv
            .set_json(&cache_key, &result, Some(self.config.cache_ttl))
            .await?;
        Ok(result)
    }

    pub fn breadcrumbs(&self, path: &str) -> Vec<Breadcrumb> {
        model::breadcrumbs_for(path)
    }

    /// Paginated objects of one directory level. `search` seeks the listing
    /// (ListV2 StartAfter) before pagination starts.
    pub async fn list_objects(
        &self,
        ctx: &RequestContext,
        path: &str,
        skip: usize,
        take: usize,
        want_metadata: bool,
        search: Option<&str>,
    ) -> Result<PagedObjects, ApiError> {
        let path = utils::path::normalize_dir(path);
        let take = take.max(1);
        let cache_key = cache_keys::listing_objects(
            &ctx.owner,
            &path,
            true,
            want_metadata,
            skip,
            take,
            search,
        );
        if let Some(cached) = self.kv.get_json::<PagedObjects>(&cache_key).await? {
            return Ok(cached);
        }

        let prefix = Self::list_prefix(ctx, &path);
        let start_after = search.map(|s| format!("{prefix}{s}"));

        let mut window = Vec::new();
        let mut total = 0usize;
        let mut continuation_token = None;
        loop {
            let page = self
                .store
                .list_page(
                    &ListRequest {
                        prefix: prefix.clone(),
                        delimited: true,
                        continuation_token,
                        start_after: start_after.clone(),
                        ..Default::default()
                    },
                    &ctx.cancel,
                )
                .await?;
            for object in page.objects {
                if is_internal_key(Self::relative_key(ctx, &object.key)) {
                    continue;
                }
                if total >= skip && total < skip + take {
                    window.push(object);
                }
                total += 1;
            }
            match page.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        let objects = self
            .build_object_records(ctx, &window, want_metadata)
            .await?;
        let result = PagedObjects {
            objects,
            total_count: total,
        };
        self.kv
            .set_json(&cache_key, &result, Some(self.config.cache_ttl))
            .await?;
        Ok(result)
    }

    /// Paginated child directories of one level. Concealed hidden folders
    /// are neither returned nor counted.
    pub async fn list_directories(
        &self,
        ctx: &RequestContext,
        path: &str,
        skip: usize,
        take: usize,
        search: Option<&str>,
    ) -> Result<PagedDirectories, ApiError> {
        let path = utils::path::normalize_dir(path);
        let take = take.max(1);
        let cache_key = cache_keys::listing_directories(
            &ctx.owner,
            &path,
            skip,
            take,
            ctx.folder_session.is_some(),
            ctx.hidden_session.is_some(),
            search,
        );
        if let Some(cached) = self.kv.get_json::<PagedDirectories>(&cache_key).await? {
            return Ok(cached);
        }

        let prefix = Self::list_prefix(ctx, &path);
        let start_after = search.map(|s| format!("{prefix}{s}"));

        let mut all_prefixes = Vec::new();
        let mut continuation_token = None;
        loop {
            let page = self
                .store
                .list_page(
                    &ListRequest {
                        prefix: prefix.clone(),
                        delimited: true,
                        continuation_token,
                        start_after: start_after.clone(),
                        ..Default::default()
                    },
                    &ctx.cancel,
                )
                .await?;
            all_prefixes.extend(page.common_prefixes);
            match page.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        let encrypted = self
            .directories
            .encrypted_manifest(&ctx.owner, &ctx.cancel)
            .await?;
        let hidden = self
            .directories
            .hidden_manifest(&ctx.owner, &ctx.cancel)
            .await?;

        let mut directories = Vec::new();
        let mut total = 0usize;
        for raw_prefix in &all_prefixes {
            let dir_path =
                utils::path::normalize_dir(Self::relative_key(ctx, raw_prefix));
            if is_internal_key(&dir_path) {
                continue;
            }
            let flags = self
                .directories
                .classify(ctx, &dir_path, &encrypted, &hidden)
                .await?;
            if flags.is_concealed {
                continue;
            }
            if total >= skip && total < skip + take {
                let thumbnails = if flags.is_locked {
                    Vec::new()
                } else {
                    thumbnails::directory_thumbnails(self, ctx, &dir_path).await?
                };
                directories.push(DirectoryRecord {
                    name: utils::path::file_name(&dir_path).to_string(),
                    prefix: dir_path,
                    is_encrypted: flags.is_encrypted,
                    is_locked: flags.is_locked,
                    is_hidden: flags.is_hidden,
                    is_concealed: flags.is_concealed,
                    thumbnails,
                });
            }
            total += 1;
        }

        let result = PagedDirectories {
            directories,
            total_count: total,
        };
        self.kv
            .set_json(&cache_key, &result, Some(self.config.cache_ttl))
            .await?;
        Ok(result)
    }

    /// Drop every cached listing of an owner. Called after each mutation.
    pub async fn invalidate_listing(&self, owner: &OwnerId) -> Result<(), ApiError> {
        self.kv
            .delete_by_pattern(&cache_keys::listing_pattern(owner))
            .await?;
        Ok(())
    }

    /// Drop cached thumbnails for a directory and every ancestor (their
    /// samples may include objects from this subtree).
    pub async fn invalidate_thumbnails_for_dir(
        &self,
        owner: &OwnerId,
        dir: &str,
    ) -> Result<(), ApiError> {
        let dir = utils::path::normalize_dir(dir);
        let mut targets = vec![dir.clone()];
        targets.extend(utils::path::ancestors(&dir).map(str::to_string));
        targets.push(String::new());
        for target in targets {
            self.kv
                .delete_by_pattern(&cache_keys::directory_thumbnails_pattern(owner, &target))
                .await?;
        }
        Ok(())
    }

    /// Thumbnail invalidation for a single object key: its parent chain.
    pub async fn invalidate_thumbnails_for_key(
        &self,
        owner: &OwnerId,
        relative_key: &str,
    ) -> Result<(), ApiError> {
        match utils::path::parent_dir(relative_key) {
            Some(parent) => self.invalidate_thumbnails_for_dir(owner, parent).await,
            None => self.invalidate_thumbnails_for_dir(owner, "").await,
        }
    }

    pub(crate) fn directories(&self) -> &DirectoryService {
        &self.directories
    }

    pub(crate) fn kv(&self) -> &GenericKvStore {
        &self.kv
    }

    pub(crate) fn store(&self) -> &GenericObjectStore {
        &self.store
    }

    pub(crate) fn listing_config(&self) -> &ListingConfig {
        &self.config
    }

    pub(crate) fn presign_config(&self) -> &PresignConfig {
        &self.presign
    }

    pub(crate) fn thumbnail_cache_ttl(&self) -> Duration {
        let presign_bound = self
            .presign
            .expiry
            .saturating_sub(Duration::from_secs(60));
        if self.presign.enabled && presign_bound < self.config.thumbnail_cache_ttl {
            presign_bound
        } else {
            self.config.thumbnail_cache_ttl
        }
    }
}
