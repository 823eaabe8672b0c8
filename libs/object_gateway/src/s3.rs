//! AWS SDK implementation of the gateway.
//!
//! Works against AWS proper and any S3-compatible endpoint (MinIO, Wasabi,
//! R2, …) via `GatewayConfig::endpoint`, which also switches the client to
//! path-style addressing.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_smithy_types::body::SdkBody;
use aws_smithy_types::byte_stream::ByteStream;
use bytes::Bytes;
use futures::stream::Stream;
use hyper::Body;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    ByteRange, CompletedUpload, ConcurrencyLimiter, CopyOptions, GatewayConfig, GatewayError,
    ListPage, ListRequest, ListedObject, MetadataDirective, ObjectBody, ObjectHead, ObjectStore,
    PartSpec, PutOptions, RequestKind, StorageMetadata, MAX_KEYS_PER_LIST_PAGE,
};

pub struct S3Gateway {
    client: Client,
    config: GatewayConfig,
    concurrency_limiter: ConcurrencyLimiter,
}

impl S3Gateway {
    /// Creates the gateway; credentials come from the default AWS provider
    /// chain (env, profile, IMDS).
    pub async fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        tracing::debug!(
            "creating s3 gateway for bucket {} in region {}",
            config.bucket_name,
            config.region
        );

        let sdk_config = aws_config::defaults(BehaviorVersion::v2024_03_28())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = Builder::from(&sdk_config);
        if let Some(endpoint) = config.endpoint.clone() {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        let concurrency_limiter = ConcurrencyLimiter::new(config.concurrency_limit.get());
        Ok(Self {
            client,
            config,
            concurrency_limiter,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn permit(
        &self,
        kind: RequestKind,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, GatewayError> {
        tokio::select! {
            permit = self.concurrency_limiter.acquire(kind) => {
                Ok(permit.expect("semaphore is never closed"))
            }
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }

    async fn owned_permit(
        &self,
        kind: RequestKind,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, GatewayError> {
        tokio::select! {
            permit = self.concurrency_limiter.acquire_owned(kind) => {
                Ok(permit.expect("semaphore is never closed"))
            }
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }

    /// Rewrite a presigned URL so it is reachable through the public
    /// hostname rather than the raw bucket endpoint.
    fn rewrite_public_host(&self, presigned: &str) -> Result<String, GatewayError> {
        let mut url = Url::parse(presigned)
            .with_context(|| format!("parse presigned url {presigned}"))
            .map_err(GatewayError::Other)?;
        url.set_host(Some(&self.config.public_hostname))
            .context("rewrite presigned host")
            .map_err(GatewayError::Other)?;
        Ok(url.to_string())
    }
}

fn systemtime_or_epoch(dt: Option<aws_smithy_types::DateTime>) -> SystemTime {
    dt.and_then(|t| SystemTime::try_from(t).ok())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

pin_project_lite::pin_project! {
    /// Keeps the read permit alive for as long as the download stream is
    /// being polled.
    struct PermitCarrying<S> {
        _permit: tokio::sync::OwnedSemaphorePermit,
        #[pin]
        inner: S,
    }
}

impl<S: Stream<Item = std::io::Result<Bytes>>> Stream for PermitCarrying<S> {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

pin_project_lite::pin_project! {
    struct ByteStreamAsStream {
        #[pin]
        inner: aws_smithy_types::byte_stream::ByteStream
    }
}

impl Stream for ByteStreamAsStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // does the std::io::ErrorKind::Other conversion
        self.project().inner.poll_next(cx).map_err(|e| e.into())
    }
}

impl ObjectStore for S3Gateway {
    async fn list_page(
        &self,
        request: &ListRequest,
        cancel: &CancellationToken,
    ) -> Result<ListPage, GatewayError> {
        let _permit = self.permit(RequestKind::List, cancel).await?;

        let max_keys = request
            .max_keys
            .unwrap_or(MAX_KEYS_PER_LIST_PAGE)
            .min(MAX_KEYS_PER_LIST_PAGE);

        let mut req = self
            .client
            .list_objects_v2()
            .bucket(self.config.bucket_name.clone())
            .prefix(request.prefix.clone())
            .set_continuation_token(request.continuation_token.clone())
            .max_keys(max_keys);
        if request.delimited {
            req = req.delimiter("/");
        }
        if request.continuation_token.is_none() {
            req = req.set_start_after(request.start_after.clone());
        }

        let response = tokio::select! {
            res = req.send() => res,
            _ = tokio::time::sleep(self.config.timeout) => return Err(GatewayError::Timeout),
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        let response = response
            .context("list objects")
            .map_err(GatewayError::Other)?;

        let mut page = ListPage {
            next_continuation_token: response.next_continuation_token,
            ..Default::default()
        };
        for object in response.contents.unwrap_or_default() {
            let Some(key) = object.key else { continue };
            page.objects.push(ListedObject {
                key,
                size: object.size.unwrap_or(0).max(0) as u64,
                etag: object.e_tag.unwrap_or_default(),
                last_modified: systemtime_or_epoch(object.last_modified),
            });
        }
        for prefix in response.common_prefixes.unwrap_or_default() {
            if let Some(p) = prefix.prefix {
                page.common_prefixes.push(p);
            }
        }
        Ok(page)
    }

    async fn head(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectHead, GatewayError> {
        let _permit = self.permit(RequestKind::Head, cancel).await?;

        let req = self
            .client
            .head_object()
            .bucket(self.config.bucket_name.clone())
            .key(key);

        let response = tokio::select! {
            res = req.send() => res,
            _ = tokio::time::sleep(self.config.timeout) => return Err(GatewayError::Timeout),
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        let head = match response {
            Ok(head) => head,
            Err(SdkError::ServiceError(e)) if matches!(e.err(), HeadObjectError::NotFound(_)) => {
                return Err(GatewayError::NotFound);
            }
            Err(e) => {
                return Err(GatewayError::Other(
                    anyhow::Error::new(e).context("head object"),
                ))
            }
        };

        Ok(ObjectHead {
            key: key.to_string(),
            size: head.content_length.unwrap_or(0).max(0) as u64,
            etag: head.e_tag.unwrap_or_default(),
            last_modified: systemtime_or_epoch(head.last_modified),
            content_type: head.content_type,
            metadata: StorageMetadata(head.metadata.unwrap_or_default()),
        })
    }

    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<ObjectBody, GatewayError> {
        let permit = self.owned_permit(RequestKind::Get, cancel).await?;

        // Range headers want an inclusive end.
        let range_header = range.map(|r| match r.end {
            Some(end) => format!("bytes={}-{}", r.start, end.saturating_sub(1)),
            None => format!("bytes={}-", r.start),
        });

        let req = self
            .client
            .get_object()
            .bucket(self.config.bucket_name.clone())
            .key(key)
            .set_range(range_header);

        let response = tokio::select! {
            res = req.send() => res,
            _ = tokio::time::sleep(self.config.timeout) => return Err(GatewayError::Timeout),
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        let output = match response {
            Ok(output) => output,
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                return Err(GatewayError::NotFound);
            }
            Err(e) => {
                return Err(GatewayError::Other(
                    anyhow::Error::new(e).context("get object"),
                ))
            }
        };

        let size = output.content_length.unwrap_or(0).max(0) as u64;
        let etag = output.e_tag.unwrap_or_default();
        let last_modified = systemtime_or_epoch(output.last_modified);
        let content_type = output.content_type;
        let metadata = StorageMetadata(output.metadata.unwrap_or_default());

        let body = ByteStreamAsStream { inner: output.body };
        let body = PermitCarrying {
            _permit: permit,
            inner: body,
        };

        Ok(ObjectBody {
            stream: Box::pin(body),
            size,
            etag,
            last_modified,
            content_type,
            metadata,
        })
    }

    async fn put(
        &self,
        key: &str,
        from: impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
        size_bytes: u64,
        opts: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let _permit = self.permit(RequestKind::Put, cancel).await?;

        let body = Body::wrap_stream(from);
        let bytes_stream = ByteStream::new(SdkBody::from_body_0_4(body));

        let req = self
            .client
            .put_object()
            .bucket(self.config.bucket_name.clone())
            .key(key)
            .content_length(size_bytes as i64)
            .set_content_type(opts.content_type.clone())
            .set_metadata(opts.metadata.clone().map(|m| m.0))
            .body(bytes_stream);

        let upload = tokio::time::timeout(self.config.timeout, req.send());
        let res = tokio::select! {
            res = upload => res,
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        match res {
            Ok(Ok(_put)) => Ok(()),
            Ok(Err(sdk)) => Err(GatewayError::Other(
                anyhow::Error::new(sdk).context("put object"),
            )),
            Err(_elapsed) => Err(GatewayError::Timeout),
        }
    }

    async fn copy(
        &self,
        from: &str,
        to: &str,
        opts: &CopyOptions,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let _permit = self.permit(RequestKind::Copy, cancel).await?;

        // the copy source includes the bucket name
        let copy_source = format!("{}/{}", self.config.bucket_name, from);

        let mut req = self
            .client
            .copy_object()
            .bucket(self.config.bucket_name.clone())
            .key(to)
            .copy_source(copy_source);
        if let MetadataDirective::Replace = opts.directive {
            req = req
                .metadata_directive(aws_sdk_s3::types::MetadataDirective::Replace)
                .set_content_type(opts.content_type.clone())
                .set_metadata(opts.metadata.clone().map(|m| m.0));
        }

        let response = tokio::select! {
            res = req.send() => res,
            _ = tokio::time::sleep(self.config.timeout) => return Err(GatewayError::Timeout),
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        match response {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(e)) if e.raw().status().as_u16() == 404 => {
                Err(GatewayError::NotFound)
            }
            Err(e) => Err(GatewayError::Other(
                anyhow::Error::new(e).context("copy object"),
            )),
        }
    }

    async fn delete_object(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let _permit = self.permit(RequestKind::Delete, cancel).await?;

        let req = self
            .client
            .delete_object()
            .bucket(self.config.bucket_name.clone())
            .key(key);

        let response = tokio::select! {
            res = req.send() => res,
            _ = tokio::time::sleep(self.config.timeout) => return Err(GatewayError::Timeout),
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        response
            .map(|_| ())
            .context("delete object")
            .map_err(GatewayError::Other)
    }

    async fn create_multipart(
        &self,
        key: &str,
        opts: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        let _permit = self.permit(RequestKind::Put, cancel).await?;

        let req = self
            .client
            .create_multipart_upload()
            .bucket(self.config.bucket_name.clone())
            .key(key)
            .set_content_type(opts.content_type.clone())
            .set_metadata(opts.metadata.clone().map(|m| m.0));

        let response = tokio::select! {
            res = req.send() => res,
            _ = tokio::time::sleep(self.config.timeout) => return Err(GatewayError::Timeout),
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        let output = response
            .context("create multipart upload")
            .map_err(GatewayError::Other)?;
        output
            .upload_id
            .ok_or_else(|| GatewayError::Other(anyhow::anyhow!("no upload id in response")))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        let _permit = self.permit(RequestKind::Put, cancel).await?;

        let req = self
            .client
            .upload_part()
            .bucket(self.config.bucket_name.clone())
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body));

        let response = tokio::select! {
            res = req.send() => res,
            _ = tokio::time::sleep(self.config.timeout) => return Err(GatewayError::Timeout),
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        let output = response
            .context("upload part")
            .map_err(GatewayError::Other)?;
        Ok(output.e_tag.unwrap_or_default())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartSpec],
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload, GatewayError> {
        let _permit = self.permit(RequestKind::Put, cancel).await?;

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(p.etag.clone())
                            .build()
                    })
                    .collect(),
            ))
            .build();

        let req = self
            .client
            .complete_multipart_upload()
            .bucket(self.config.bucket_name.clone())
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed);

        let response = tokio::select! {
            res = req.send() => res,
            _ = tokio::time::sleep(self.config.timeout) => return Err(GatewayError::Timeout),
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        let output = response
            .context("complete multipart upload")
            .map_err(GatewayError::Other)?;
        Ok(CompletedUpload {
            etag: output.e_tag.unwrap_or_default(),
            location: output
                .location
                .unwrap_or_else(|| format!("https://{}/{}", self.config.public_hostname, key)),
        })
    }

    async fn abort_multipart(
        &self,
        key: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let _permit = self.permit(RequestKind::Delete, cancel).await?;

        let req = self
            .client
            .abort_multipart_upload()
            .bucket(self.config.bucket_name.clone())
            .key(key)
            .upload_id(upload_id);

        let response = tokio::select! {
            res = req.send() => res,
            _ = tokio::time::sleep(self.config.timeout) => return Err(GatewayError::Timeout),
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        response
            .map(|_| ())
            .context("abort multipart upload")
            .map_err(GatewayError::Other)
    }

    async fn presign_get(&self, key: &str, expires: Duration) -> Result<String, GatewayError> {
        let presigning = PresigningConfig::expires_in(expires)
            .context("presigning config")
            .map_err(GatewayError::Other)?;
        let presigned = self
            .client
            .get_object()
            .bucket(self.config.bucket_name.clone())
            .key(key)
            .presigned(presigning)
            .await
            .context("presign get")
            .map_err(GatewayError::Other)?;
        self.rewrite_public_host(&presigned.uri().to_string())
    }

    async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires: Duration,
    ) -> Result<String, GatewayError> {
        let presigning = PresigningConfig::expires_in(expires)
            .context("presigning config")
            .map_err(GatewayError::Other)?;
        let presigned = self
            .client
            .upload_part()
            .bucket(self.config.bucket_name.clone())
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(presigning)
            .await
            .context("presign upload part")
            .map_err(GatewayError::Other)?;
        self.rewrite_public_host(&presigned.uri().to_string())
    }
}
