//! Multipart upload service.
//!
//! Part bodies are client-uploaded (directly or through presigned part
//! URLs); this service owns the bookkeeping around them: quota pre-checks,
//! Content-MD5 verification, completion with usage reconciliation, and the
//! compensating delete when a finished upload turns out to blow the owner's
//! storage limit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_gateway::{CompletedUpload, GenericObjectStore, PartSpec, PutOptions, StorageMetadata};
use serde::{Deserialize, Serialize};

use crate::config::PresignConfig;
use crate::context::RequestContext;
use crate::error::ApiError;
use crate::metadata;
use crate::usage::{SubscriptionProvider, UsageTracker};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedUpload {
    pub upload_id: String,
    /// Owner-relative key the upload will land at.
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUploadRecord {
    pub location: String,
    pub key: String,
    pub bucket: String,
    pub etag: String,
    pub size: u64,
}

#[derive(Clone)]
pub struct UploadService {
    store: GenericObjectStore,
    usage: UsageTracker,
    subscriptions: Arc<dyn SubscriptionProvider>,
    presign: PresignConfig,
}

impl UploadService {
    pub fn new(
        store: GenericObjectStore,
        usage: UsageTracker,
        subscriptions: Arc<dyn SubscriptionProvider>,
        presign: PresignConfig,
    ) -> Self {
        Self {
            store,
            usage,
            subscriptions,
            presign,
        }
    }

    /// Start a multipart upload after checking the owner still has quota.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        relative_key: &str,
        content_type: Option<&str>,
        user_metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<CreatedUpload, ApiError> {
        let relative_key = utils::path::normalize_dir(relative_key);
        if relative_key.is_empty() {
            return Err(ApiError::BadRequest("invalid object key".into()));
        }

        let subscription = self.subscriptions.subscription(&ctx.owner).await?;
        let report = self
            .usage
            .report(&ctx.owner, &subscription, &ctx.cancel)
            .await?;
        if report.is_limit_exceeded {
            return Err(ApiError::BadRequest("storage limit exceeded".into()));
        }

        let key = ctx.owner.key(&relative_key);
        let opts = PutOptions {
            content_type: content_type.map(str::to_string),
            metadata: user_metadata
                .map(|m| StorageMetadata(metadata::sanitize_for_store(m))),
        };
        let upload_id = self.store.create_multipart(&key, &opts, &ctx.cancel).await?;
        Ok(CreatedUpload {
            upload_id,
            key: relative_key,
        })
    }

    /// Presigned URL for uploading one part directly to the store.
    pub async fn part_url(
        &self,
        ctx: &RequestContext,
        relative_key: &str,
        upload_id: &str,
        part_number: i32,
    ) -> Result<String, ApiError> {
        let key = ctx.owner.key(relative_key);
        Ok(self
            .store
            .presign_upload_part(&key, upload_id, part_number, self.presign.expiry)
            .await?)
    }

    /// Server-side part upload, with optional Content-MD5 verification of
    /// the buffer before it goes out.
    pub async fn upload_part(
        &self,
        ctx: &RequestContext,
        relative_key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        content_md5: Option<&str>,
    ) -> Result<String, ApiError> {
        if let Some(expected) = content_md5 {
            let actual = base64::encode(md5::compute(&body).0);
            if actual != expected.trim() {
                return Err(ApiError::BadRequest("content-md5 mismatch".into()));
            }
        }
        let key = ctx.owner.key(relative_key);
        Ok(self
            .store
            .upload_part(&key, upload_id, part_number, body, &ctx.cancel)
            .await?)
    }

    /// Complete the upload: stitch the parts, account the bytes, and undo
    /// everything if the owner is now over quota.
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        relative_key: &str,
        upload_id: &str,
        parts: &[PartSpec],
    ) -> Result<CompletedUploadRecord, ApiError> {
        let key = ctx.owner.key(relative_key);
        let completed: CompletedUpload = self
            .store
            .complete_multipart(&key, upload_id, parts, &ctx.cancel)
            .await?;

        let head = self.store.head(&key, &ctx.cancel).await?;
        self.usage.add(&ctx.owner, head.size).await?;

        let subscription = self.subscriptions.subscription(&ctx.owner).await?;
        let report = self
            .usage
            .report(&ctx.owner, &subscription, &ctx.cancel)
            .await?;
        if report.is_limit_exceeded {
            self.store.delete_object(&key, &ctx.cancel).await?;
            self.usage.subtract(&ctx.owner, head.size).await?;
            return Err(ApiError::BadRequest("storage limit exceeded".into()));
        }

        if let Some(ext) = utils::path::extension(relative_key) {
            if metadata::is_image_extension(&ext) {
                if let Err(err) = metadata::process_image(&self.store, &key, &ctx.cancel).await {
                    tracing::warn!("image metadata processing failed for {key}: {err}");
                }
            }
        }

        Ok(CompletedUploadRecord {
            location: completed.location,
            key: relative_key.to_string(),
            bucket: self.store.bucket_name().to_string(),
            etag: completed.etag,
            size: head.size,
        })
    }

    pub async fn abort(
        &self,
        ctx: &RequestContext,
        relative_key: &str,
        upload_id: &str,
    ) -> Result<(), ApiError> {
        let key = ctx.owner.key(relative_key);
        Ok(self.store.abort_multipart(&key, upload_id, &ctx.cancel).await?)
    }

    pub fn default_part_url_ttl(&self) -> Duration {
        self.presign.expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OwnerId;
    use crate::usage::{StaticSubscriptions, Subscription};
    use kv_store::GenericKvStore;
    use object_gateway::{GatewayConfig, MemGateway};

    fn service_with_limit(max_bytes: u64) -> (GenericObjectStore, UploadService) {
        let store = GenericObjectStore::InMemory(Arc::new(MemGateway::new(
            GatewayConfig::default(),
        )));
        let kv = GenericKvStore::memory();
        let usage = UsageTracker::new(store.clone(), kv);
        let subscriptions = Arc::new(StaticSubscriptions(Subscription {
            max_bytes,
            ..Default::default()
        }));
        let upload = UploadService::new(
            store.clone(),
            usage,
            subscriptions,
            PresignConfig {
                enabled: true,
                expiry: Duration::from_secs(3600),
                max_expiry: Duration::from_secs(86400),
            },
        );
        (store, upload)
    }

    fn ctx() -> RequestContext {
        RequestContext::new(OwnerId::user("u1"))
    }

    #[tokio::test]
    async fn full_upload_cycle() {
        let (store, upload) = service_with_limit(1024 * 1024);
        let ctx = ctx();
        let created = upload
            .create(&ctx, "docs/big.bin", Some("application/octet-stream"), None)
            .await
            .unwrap();
        assert_eq!(created.key, "docs/big.bin");

        let etag = upload
            .upload_part(
                &ctx,
                &created.key,
                &created.upload_id,
                1,
                Bytes::from_static(b"hello world"),
                None,
            )
            .await
            .unwrap();
        let completed = upload
            .complete(
                &ctx,
                &created.key,
                &created.upload_id,
                &[PartSpec {
                    part_number: 1,
                    etag,
                }],
            )
            .await
            .unwrap();
        assert_eq!(completed.size, 11);
        assert_eq!(completed.key, "docs/big.bin");

        let head = store
            .head("u1/docs/big.bin", &ctx.cancel)
            .await
            .unwrap();
        assert_eq!(head.size, 11);
    }

    #[tokio::test]
    async fn md5_mismatch_is_bad_request() {
        let (_store, upload) = service_with_limit(1024);
        let ctx = ctx();
        let created = upload.create(&ctx, "x.bin", None, None).await.unwrap();
        let err = upload
            .upload_part(
                &ctx,
                &created.key,
                &created.upload_id,
                1,
                Bytes::from_static(b"data"),
                Some("bogusbase64=="),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn md5_match_passes() {
        let (_store, upload) = service_with_limit(1024);
        let ctx = ctx();
        let created = upload.create(&ctx, "x.bin", None, None).await.unwrap();
        let body = Bytes::from_static(b"data");
        let md5 = base64::encode(md5::compute(&body).0);
        upload
            .upload_part(&ctx, &created.key, &created.upload_id, 1, body, Some(&md5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn over_quota_completion_is_reverted() {
        let (store, upload) = service_with_limit(4);
        let ctx = ctx();
        let created = upload.create(&ctx, "big.bin", None, None).await.unwrap();
        let etag = upload
            .upload_part(
                &ctx,
                &created.key,
                &created.upload_id,
                1,
                Bytes::from_static(b"way too many bytes"),
                None,
            )
            .await
            .unwrap();
        let err = upload
            .complete(
                &ctx,
                &created.key,
                &created.upload_id,
                &[PartSpec {
                    part_number: 1,
                    etag,
                }],
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        // compensating delete removed the object
        assert!(store.head("u1/big.bin", &ctx.cancel).await.is_err());
    }
}
