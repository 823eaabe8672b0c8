//! Single-object operations: find, presigned URLs, move, delete, update.
//!
//! `update` carries the ugliest provider compatibility logic in the tree:
//! some S3-compatible stores silently drop user metadata on CopyObject with
//! REPLACE, so after every metadata-bearing copy the target is headed and,
//! if the metadata did not survive, rewritten through a full get+put.

use std::collections::BTreeMap;

use futures::TryStreamExt;
use object_gateway::{
    CopyOptions, GenericObjectStore, MetadataDirective, ObjectHead, PutOptions, StorageMetadata,
};

use crate::config::PresignConfig;
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::metadata;
use crate::model::{FileRef, ObjectRecord};

#[derive(Clone)]
pub struct ObjectService {
    store: GenericObjectStore,
    presign: PresignConfig,
}

impl ObjectService {
    pub fn new(store: GenericObjectStore, presign: PresignConfig) -> Self {
        Self { store, presign }
    }

    async fn record_from_head(
        &self,
        relative_key: &str,
        head: &ObjectHead,
    ) -> Result<ObjectRecord, ApiError> {
        let url = if self.presign.enabled {
            self.store.presign_get(&head.key, self.presign.expiry).await?
        } else {
            self.store.public_url(&head.key)
        };
        Ok(ObjectRecord {
            name: utils::path::file_name(relative_key).to_string(),
            extension: utils::path::extension(relative_key),
            mime_type: metadata::mime_type_for(relative_key, head.content_type.as_deref()),
            file: FileRef {
                host: self.store.public_hostname().to_string(),
                key: relative_key.to_string(),
                url,
            },
            metadata: metadata::decode_from_store(&head.metadata),
            size: head.size,
            etag: head.etag.clone(),
            last_modified: head.last_modified.into(),
        })
    }

    pub async fn find(
        &self,
        ctx: &RequestContext,
        relative_key: &str,
    ) -> Result<ObjectRecord, ApiError> {
        let key = ctx.owner.key(relative_key);
        let head = self.store.head(&key, &ctx.cancel).await?;
        self.record_from_head(relative_key, &head).await
    }

    /// Presigned download URL; existence is verified first so a missing key
    /// 404s instead of producing a signed dead link.
    pub async fn presigned_url(
        &self,
        ctx: &RequestContext,
        relative_key: &str,
        ttl: Option<std::time::Duration>,
    ) -> Result<String, ApiError> {
        let key = ctx.owner.key(relative_key);
        self.store.head(&key, &ctx.cancel).await?;
        let ttl = ttl
            .unwrap_or(self.presign.expiry)
            .min(self.presign.max_expiry);
        Ok(self.store.presign_get(&key, ttl).await?)
    }

    /// Move objects into a destination directory, keeping their base names.
    pub async fn move_objects(
        &self,
        ctx: &RequestContext,
        source_keys: &[String],
        destination_dir: &str,
    ) -> Result<(), ApiError> {
        let destination_dir = utils::path::normalize_dir(destination_dir);
        for source in source_keys {
            let source_key = ctx.owner.key(source);
            let name = utils::path::file_name(source);
            let dest_relative = if destination_dir.is_empty() {
                name.to_string()
            } else {
                format!("{destination_dir}/{name}")
            };
            let dest_key = ctx.owner.key(&dest_relative);
            self.store
                .copy(&source_key, &dest_key, &CopyOptions::default(), &ctx.cancel)
                .await?;
            self.store.delete_object(&source_key, &ctx.cancel).await?;
        }
        Ok(())
    }

    pub async fn delete(
        &self,
        ctx: &RequestContext,
        relative_keys: &[String],
    ) -> Result<(), ApiError> {
        for relative in relative_keys {
            let key = ctx.owner.key(relative);
            self.store.delete_object(&key, &ctx.cancel).await?;
        }
        Ok(())
    }

    /// Rename and/or replace user metadata on one object. Returns the new
    /// owner-relative key.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        relative_key: &str,
        new_name: Option<&str>,
        new_metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<String, ApiError> {
        if new_name.is_none() && new_metadata.is_none() {
            return Ok(relative_key.to_string());
        }
        if let Some(name) = new_name {
            if !utils::path::is_valid_leaf_name(name) {
                return Err(ApiError::BadRequest("invalid object name".into()));
            }
        }

        let source_key = ctx.owner.key(relative_key);
        let head = self.store.head(&source_key, &ctx.cancel).await?;

        // Merge existing stored metadata with the sanitized patch; the patch
        // wins per key.
        let (merged, provided_keys): (Option<StorageMetadata>, Vec<String>) = match new_metadata {
            Some(patch) => {
                let sanitized = metadata::sanitize_for_store(patch);
                let provided_keys = sanitized.keys().cloned().collect();
                let mut merged = head.metadata.0.clone();
                merged.extend(sanitized);
                (Some(StorageMetadata(merged)), provided_keys)
            }
            None => (None, Vec::new()),
        };

        let target_relative = match new_name {
            Some(name) => match utils::path::parent_dir(relative_key) {
                Some(parent) => format!("{parent}/{name}"),
                None => name.to_string(),
            },
            None => relative_key.to_string(),
        };
        let target_key = ctx.owner.key(&target_relative);

        let directive = if merged.is_some() {
            MetadataDirective::Replace
        } else {
            MetadataDirective::Copy
        };
        self.store
            .copy(
                &source_key,
                &target_key,
                &CopyOptions {
                    directive,
                    content_type: head.content_type.clone(),
                    metadata: merged.clone(),
                },
                &ctx.cancel,
            )
            .await?;

        if let Some(expected) = &merged {
            let verify = self.store.head(&target_key, &ctx.cancel).await?;
            let dropped = provided_keys
                .iter()
                .any(|k| verify.metadata.get(k).is_none());
            if dropped {
                tracing::warn!(
                    "provider dropped metadata on copy of {target_key}, rewriting body"
                );
                self.rewrite_with_metadata(ctx, &source_key, &target_key, &head, expected)
                    .await?;
            }
        }

        if target_key != source_key {
            self.store.delete_object(&source_key, &ctx.cancel).await?;
        }
        Ok(target_relative)
    }

    /// Fallback for providers that lose metadata during copy: stream the
    /// source body into the target with the metadata attached explicitly.
    async fn rewrite_with_metadata(
        &self,
        ctx: &RequestContext,
        source_key: &str,
        target_key: &str,
        head: &ObjectHead,
        expected: &StorageMetadata,
    ) -> Result<(), ApiError> {
        let body = self.store.get(source_key, None, &ctx.cancel).await?;
        let raw: Vec<u8> = body
            .stream
            .try_fold(Vec::with_capacity(head.size as usize), |mut acc, chunk| {
                acc.extend_from_slice(&chunk);
                async move { Ok(acc) }
            })
            .await
            .map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;
        let size = raw.len() as u64;
        let stream = futures::stream::once({
            let data = bytes::Bytes::from(raw);
            async move { Ok(data) }
        });
        self.store
            .put(
                target_key,
                stream,
                size,
                &PutOptions {
                    content_type: head.content_type.clone(),
                    metadata: Some(expected.clone()),
                },
                &ctx.cancel,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OwnerId;
    use bytes::Bytes;
    use object_gateway::{GatewayConfig, MemGateway};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn fixtures() -> (GenericObjectStore, Arc<MemGateway>, ObjectService) {
        let mem = Arc::new(MemGateway::new(GatewayConfig::default()));
        let store = GenericObjectStore::InMemory(mem.clone());
        let service = ObjectService::new(
            store.clone(),
            PresignConfig {
                enabled: true,
                expiry: std::time::Duration::from_secs(3600),
                max_expiry: std::time::Duration::from_secs(86400),
            },
        );
        (store, mem, service)
    }

    fn ctx() -> RequestContext {
        RequestContext::new(OwnerId::user("u1"))
    }

    async fn put(store: &GenericObjectStore, key: &str, body: &str) {
        store
            .put_bytes(
                key,
                Bytes::copy_from_slice(body.as_bytes()),
                &PutOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn find_builds_record() {
        let (store, _mem, service) = fixtures();
        put(&store, "u1/docs/report.pdf", "content").await;
        let record = service.find(&ctx(), "docs/report.pdf").await.unwrap();
        assert_eq!(record.name, "report.pdf");
        assert_eq!(record.extension.as_deref(), Some("pdf"));
        assert_eq!(record.mime_type, "application/pdf");
        assert_eq!(record.size, 7);
        assert_eq!(record.file.key, "docs/report.pdf");
    }

    #[tokio::test]
    async fn find_missing_is_not_found() {
        let (_store, _mem, service) = fixtures();
        let err = service.find(&ctx(), "nope.txt").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn move_keeps_basename() {
        let (store, mem, service) = fixtures();
        put(&store, "u1/a/x.txt", "x").await;
        put(&store, "u1/a/y.txt", "y").await;
        service
            .move_objects(&ctx(), &["a/x.txt".to_string(), "a/y.txt".to_string()], "b")
            .await
            .unwrap();
        assert_eq!(mem.all_keys(), vec!["u1/b/x.txt", "u1/b/y.txt"]);
    }

    #[tokio::test]
    async fn update_renames_and_merges_metadata() {
        let (store, mem, service) = fixtures();
        store
            .put_bytes(
                "u1/a/old.txt",
                Bytes::from_static(b"data"),
                &PutOptions {
                    content_type: Some("text/plain".to_string()),
                    metadata: Some(StorageMetadata::from([("kept", "yes")])),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut patch = BTreeMap::new();
        patch.insert("Label".to_string(), "fresh".to_string());
        let new_key = service
            .update(&ctx(), "a/old.txt", Some("new.txt"), Some(&patch))
            .await
            .unwrap();
        assert_eq!(new_key, "a/new.txt");
        assert_eq!(mem.all_keys(), vec!["u1/a/new.txt"]);

        let head = store
            .head("u1/a/new.txt", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(head.metadata.get("kept"), Some("yes"));
        assert_eq!(head.metadata.get("label"), Some("fresh"));
    }

    #[tokio::test]
    async fn update_rejects_slash_in_name() {
        let (store, _mem, service) = fixtures();
        put(&store, "u1/a/x.txt", "x").await;
        let err = service
            .update(&ctx(), "a/x.txt", Some("../evil"), None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
