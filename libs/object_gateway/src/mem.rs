//! In-memory implementation of the gateway, with full ListObjectsV2
//! semantics (prefix, delimiter, continuation tokens, start-after, page
//! caps) and multipart uploads. Backs the test suite and local development
//! runs where no object store is reachable.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    ByteRange, CompletedUpload, CopyOptions, GatewayConfig, GatewayError, ListPage, ListRequest,
    ListedObject, MetadataDirective, ObjectBody, ObjectHead, ObjectStore, PartSpec, PutOptions,
    StorageMetadata, MAX_KEYS_PER_LIST_PAGE,
};

#[derive(Clone)]
struct MemObject {
    data: Bytes,
    metadata: HashMap<String, String>,
    content_type: Option<String>,
    etag: String,
    last_modified: SystemTime,
}

struct MultipartSession {
    key: String,
    parts: BTreeMap<i32, (Bytes, String)>,
    content_type: Option<String>,
    metadata: Option<StorageMetadata>,
}

#[derive(Default)]
struct MemState {
    objects: BTreeMap<String, MemObject>,
    uploads: HashMap<String, MultipartSession>,
    upload_seq: u64,
}

pub struct MemGateway {
    config: GatewayConfig,
    state: Mutex<MemState>,
}

fn quoted_md5(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}

impl MemGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MemState::default()),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Test helper: current number of stored objects.
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Test helper: all keys currently stored, sorted.
    pub fn all_keys(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    fn check_cancel(cancel: &CancellationToken) -> Result<(), GatewayError> {
        if cancel.is_cancelled() {
            Err(GatewayError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl ObjectStore for MemGateway {
    async fn list_page(
        &self,
        request: &ListRequest,
        cancel: &CancellationToken,
    ) -> Result<ListPage, GatewayError> {
        Self::check_cancel(cancel)?;

        let max_keys = request
            .max_keys
            .unwrap_or(MAX_KEYS_PER_LIST_PAGE)
            .min(MAX_KEYS_PER_LIST_PAGE)
            .max(1) as usize;

        // ContinuationToken wins over StartAfter; both are exclusive.
        let after = request
            .continuation_token
            .clone()
            .or_else(|| request.start_after.clone());
        let lower = match &after {
            Some(marker) => Bound::Excluded(marker.clone()),
            None => Bound::Unbounded,
        };

        let state = self.state.lock();
        let mut page = ListPage::default();
        let mut entries = 0usize;
        let mut last_consumed: Option<String> = None;
        let mut truncated = false;

        let mut iter = state
            .objects
            .range::<String, _>((lower, Bound::Unbounded))
            .filter(|(k, _)| k.starts_with(&request.prefix))
            .peekable();

        while let Some((key, object)) = iter.next() {
            if entries >= max_keys {
                truncated = true;
                break;
            }
            let rest = &key[request.prefix.len()..];
            let fold = request.delimited.then(|| rest.find('/')).flatten();
            match fold {
                Some(idx) => {
                    // All keys under a common prefix sort contiguously:
                    // consume them so the next page starts past the group.
                    let group = format!("{}{}", request.prefix, &rest[..=idx]);
                    page.common_prefixes.push(group.clone());
                    last_consumed = Some(key.clone());
                    while let Some((next_key, _)) =
                        iter.peek().filter(|(k, _)| k.starts_with(&group))
                    {
                        last_consumed = Some(next_key.to_string());
                        iter.next();
                    }
                }
                None => {
                    page.objects.push(ListedObject {
                        key: key.clone(),
                        size: object.data.len() as u64,
                        etag: object.etag.clone(),
                        last_modified: object.last_modified,
                    });
                    last_consumed = Some(key.clone());
                }
            }
            entries += 1;
        }

        if truncated {
            page.next_continuation_token = last_consumed;
        }
        Ok(page)
    }

    async fn head(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectHead, GatewayError> {
        Self::check_cancel(cancel)?;
        let state = self.state.lock();
        let object = state.objects.get(key).ok_or(GatewayError::NotFound)?;
        Ok(ObjectHead {
            key: key.to_string(),
            size: object.data.len() as u64,
            etag: object.etag.clone(),
            last_modified: object.last_modified,
            content_type: object.content_type.clone(),
            metadata: StorageMetadata(object.metadata.clone()),
        })
    }

    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<ObjectBody, GatewayError> {
        Self::check_cancel(cancel)?;
        let object = {
            let state = self.state.lock();
            state.objects.get(key).cloned()
        }
        .ok_or(GatewayError::NotFound)?;

        let data = match range {
            Some(r) => {
                let len = object.data.len() as u64;
                let start = r.start.min(len) as usize;
                let end = r.end.unwrap_or(len).min(len) as usize;
                object.data.slice(start..end.max(start))
            }
            None => object.data.clone(),
        };

        let size = data.len() as u64;
        Ok(ObjectBody {
            stream: Box::pin(futures::stream::once(async move { Ok(data) })),
            size,
            etag: object.etag,
            last_modified: object.last_modified,
            content_type: object.content_type,
            metadata: StorageMetadata(object.metadata),
        })
    }

    async fn put(
        &self,
        key: &str,
        from: impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
        _size_bytes: u64,
        opts: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        Self::check_cancel(cancel)?;
        let mut buf = BytesMut::new();
        let mut from = std::pin::pin!(from);
        while let Some(chunk) = from.next().await {
            let chunk = chunk
                .map_err(|e| GatewayError::Other(anyhow::Error::new(e).context("read body")))?;
            buf.extend_from_slice(&chunk);
            Self::check_cancel(cancel)?;
        }
        let data = buf.freeze();
        let etag = quoted_md5(&data);

        let mut state = self.state.lock();
        state.objects.insert(
            key.to_string(),
            MemObject {
                data,
                metadata: opts.metadata.clone().map(|m| m.0).unwrap_or_default(),
                content_type: opts.content_type.clone(),
                etag,
                last_modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn copy(
        &self,
        from: &str,
        to: &str,
        opts: &CopyOptions,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        Self::check_cancel(cancel)?;
        let mut state = self.state.lock();
        let mut object = state
            .objects
            .get(from)
            .cloned()
            .ok_or(GatewayError::NotFound)?;
        if let MetadataDirective::Replace = opts.directive {
            object.metadata = opts.metadata.clone().map(|m| m.0).unwrap_or_default();
            if opts.content_type.is_some() {
                object.content_type = opts.content_type.clone();
            }
        }
        object.last_modified = SystemTime::now();
        state.objects.insert(to.to_string(), object);
        Ok(())
    }

    async fn delete_object(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        Self::check_cancel(cancel)?;
        // S3 deletes are idempotent: removing a missing key succeeds.
        self.state.lock().objects.remove(key);
        Ok(())
    }

    async fn create_multipart(
        &self,
        key: &str,
        opts: &PutOptions,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        Self::check_cancel(cancel)?;
        let mut state = self.state.lock();
        state.upload_seq += 1;
        let upload_id = format!("mem-upload-{}", state.upload_seq);
        state.uploads.insert(
            upload_id.clone(),
            MultipartSession {
                key: key.to_string(),
                parts: BTreeMap::new(),
                content_type: opts.content_type.clone(),
                metadata: opts.metadata.clone(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        Self::check_cancel(cancel)?;
        let etag = quoted_md5(&body);
        let mut state = self.state.lock();
        let session = state.uploads.get_mut(upload_id).ok_or(GatewayError::NotFound)?;
        if session.key != key {
            return Err(GatewayError::Other(anyhow::anyhow!(
                "upload id {upload_id} does not belong to key {key}"
            )));
        }
        session.parts.insert(part_number, (body, etag.clone()));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartSpec],
        cancel: &CancellationToken,
    ) -> Result<CompletedUpload, GatewayError> {
        Self::check_cancel(cancel)?;
        let mut state = self.state.lock();
        let session = state.uploads.remove(upload_id).ok_or(GatewayError::NotFound)?;
        if session.key != key {
            return Err(GatewayError::Other(anyhow::anyhow!(
                "upload id {upload_id} does not belong to key {key}"
            )));
        }

        let mut buf = BytesMut::new();
        let mut previous = 0;
        for spec in parts {
            if spec.part_number <= previous {
                return Err(GatewayError::Other(anyhow::anyhow!(
                    "part numbers must be ascending"
                )));
            }
            previous = spec.part_number;
            let (data, etag) = session
                .parts
                .get(&spec.part_number)
                .ok_or_else(|| GatewayError::Other(anyhow::anyhow!(
                    "part {} was never uploaded",
                    spec.part_number
                )))?;
            if *etag != spec.etag {
                return Err(GatewayError::Other(anyhow::anyhow!(
                    "etag mismatch for part {}",
                    spec.part_number
                )));
            }
            buf.extend_from_slice(data);
        }

        let data = buf.freeze();
        let etag = quoted_md5(&data);
        state.objects.insert(
            key.to_string(),
            MemObject {
                data,
                metadata: session.metadata.map(|m| m.0).unwrap_or_default(),
                content_type: session.content_type,
                etag: etag.clone(),
                last_modified: SystemTime::now(),
            },
        );
        Ok(CompletedUpload {
            etag,
            location: format!("https://{}/{}", self.config.public_hostname, key),
        })
    }

    async fn abort_multipart(
        &self,
        _key: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), GatewayError> {
        Self::check_cancel(cancel)?;
        self.state.lock().uploads.remove(upload_id);
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires: Duration) -> Result<String, GatewayError> {
        Ok(format!(
            "https://{}/{}?X-Amz-Expires={}&X-Amz-Signature=mem",
            self.config.public_hostname,
            key,
            expires.as_secs()
        ))
    }

    async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires: Duration,
    ) -> Result<String, GatewayError> {
        Ok(format!(
            "https://{}/{}?partNumber={}&uploadId={}&X-Amz-Expires={}&X-Amz-Signature=mem",
            self.config.public_hostname,
            key,
            part_number,
            upload_id,
            expires.as_secs()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> MemGateway {
        MemGateway::new(GatewayConfig::default())
    }

    async fn put_simple(gw: &MemGateway, key: &str, body: &str) {
        gw.put_bytes_for_test(key, Bytes::copy_from_slice(body.as_bytes()))
            .await;
    }

    impl MemGateway {
        async fn put_bytes_for_test(&self, key: &str, body: Bytes) {
            let cancel = CancellationToken::new();
            let size = body.len() as u64;
            self.put(
                key,
                futures::stream::once(async move { Ok(body) }),
                size,
                &PutOptions::default(),
                &cancel,
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn delimited_listing_folds_prefixes() {
        let gw = gateway();
        for key in ["u1/a/x", "u1/a/y", "u1/b/z", "u1/top"] {
            put_simple(&gw, key, "data").await;
        }
        let cancel = CancellationToken::new();
        let page = gw
            .list_page(
                &ListRequest {
                    prefix: "u1/".to_string(),
                    delimited: true,
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(page.common_prefixes, vec!["u1/a/", "u1/b/"]);
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].key, "u1/top");
        assert!(page.next_continuation_token.is_none());
    }

    #[tokio::test]
    async fn pagination_resumes_after_token() {
        let gw = gateway();
        for i in 0..7 {
            put_simple(&gw, &format!("u1/k{i}"), "x").await;
        }
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let page = gw
                .list_page(
                    &ListRequest {
                        prefix: "u1/".to_string(),
                        continuation_token: token.take(),
                        max_keys: Some(3),
                        ..Default::default()
                    },
                    &cancel,
                )
                .await
                .unwrap();
            seen.extend(page.objects.iter().map(|o| o.key.clone()));
            match page.next_continuation_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(seen, {
            let mut sorted = seen.clone();
            sorted.sort();
            sorted
        });
    }

    #[tokio::test]
    async fn start_after_seeks() {
        let gw = gateway();
        for key in ["u1/a", "u1/b", "u1/c"] {
            put_simple(&gw, key, "x").await;
        }
        let cancel = CancellationToken::new();
        let page = gw
            .list_page(
                &ListRequest {
                    prefix: "u1/".to_string(),
                    start_after: Some("u1/a".to_string()),
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["u1/b", "u1/c"]);
    }

    #[tokio::test]
    async fn multipart_roundtrip() {
        let gw = gateway();
        let cancel = CancellationToken::new();
        let upload_id = gw
            .create_multipart("u1/big.bin", &PutOptions::default(), &cancel)
            .await
            .unwrap();
        let e1 = gw
            .upload_part("u1/big.bin", &upload_id, 1, Bytes::from_static(b"hello "), &cancel)
            .await
            .unwrap();
        let e2 = gw
            .upload_part("u1/big.bin", &upload_id, 2, Bytes::from_static(b"world"), &cancel)
            .await
            .unwrap();
        let completed = gw
            .complete_multipart(
                "u1/big.bin",
                &upload_id,
                &[
                    PartSpec { part_number: 1, etag: e1 },
                    PartSpec { part_number: 2, etag: e2 },
                ],
                &cancel,
            )
            .await
            .unwrap();
        assert!(!completed.etag.is_empty());

        let head = gw.head("u1/big.bin", &cancel).await.unwrap();
        assert_eq!(head.size, 11);
    }

    #[tokio::test]
    async fn range_get_slices() {
        let gw = gateway();
        put_simple(&gw, "u1/r", "0123456789").await;
        let cancel = CancellationToken::new();
        let body = gw
            .get(
                "u1/r",
                Some(ByteRange { start: 2, end: Some(5) }),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(body.size, 3);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let gw = gateway();
        let cancel = CancellationToken::new();
        assert!(matches!(
            gw.head("u1/missing", &cancel).await,
            Err(GatewayError::NotFound)
        ));
    }
}
