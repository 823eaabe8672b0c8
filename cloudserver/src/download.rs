//! Streamed object downloads with per-user byte-rate throttling.
//!
//! The throttle is a token bucket: each chunk acquires as many permits as it
//! has bytes before being yielded downstream, so a slow plan drains slowly
//! no matter how fast the object store delivers. Dropping the stream (the
//! caller closed the response) cancels everything in flight.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use leaky_bucket::RateLimiter;
use object_gateway::{DownloadStream, GenericObjectStore};

use crate::context::RequestContext;
use crate::error::ApiError;

/// The throttled body handed to the transport layer.
pub type ThrottledStream =
    Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + 'static>>;

pub struct ThrottledDownload {
    pub stream: ThrottledStream,
    pub size: u64,
    pub content_type: Option<String>,
    pub file_name: String,
}

fn rate_limiter(bytes_per_sec: u64) -> Arc<RateLimiter> {
    let rate = bytes_per_sec.max(1024) as usize;
    // refill in tenths of a second to keep the stream smooth at low rates
    Arc::new(
        RateLimiter::builder()
            .max(rate)
            .initial(rate)
            .refill(rate / 10)
            .interval(Duration::from_millis(100))
            .build(),
    )
}

/// Wrap a raw byte stream so it drains at most `bytes_per_sec`.
pub fn throttle_stream(inner: DownloadStream, bytes_per_sec: u64) -> ThrottledStream {
    let limiter = rate_limiter(bytes_per_sec);
    let burst = bytes_per_sec.max(1024) as usize;
    Box::pin(async_stream::try_stream! {
        let mut inner = inner;
        while let Some(chunk) = futures::StreamExt::next(&mut inner).await {
            let chunk: Bytes = chunk?;
            // chunks larger than the bucket are split so acquire() can
            // always be satisfied
            let mut offset = 0;
            while offset < chunk.len() {
                let len = (chunk.len() - offset).min(burst);
                limiter.acquire(len).await;
                yield chunk.slice(offset..offset + len);
                offset += len;
            }
        }
    })
}

/// Download an object, throttled to the owner's plan speed.
pub async fn download(
    store: &GenericObjectStore,
    ctx: &RequestContext,
    relative_key: &str,
    bytes_per_sec: u64,
) -> Result<ThrottledDownload, ApiError> {
    let key = ctx.owner.key(relative_key);
    let body = store.get(&key, None, &ctx.cancel).await?;
    Ok(ThrottledDownload {
        stream: throttle_stream(body.stream, bytes_per_sec),
        size: body.size,
        content_type: body.content_type,
        file_name: utils::path::file_name(relative_key).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn throttled_stream_preserves_bytes() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let inner: DownloadStream = Box::pin(futures::stream::iter(chunks));
        // generous rate: the test only checks integrity, not pacing
        let mut throttled = throttle_stream(inner, 10 * 1024 * 1024);

        let mut out = Vec::new();
        while let Some(chunk) = throttled.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn oversized_chunks_are_split() {
        let big = Bytes::from(vec![42u8; 2500]);
        let inner: DownloadStream =
            Box::pin(futures::stream::iter(vec![Ok::<_, std::io::Error>(big)]));
        let mut throttled = throttle_stream(inner, 1024);

        let mut total = 0;
        let mut pieces = 0;
        while let Some(chunk) = throttled.next().await {
            total += chunk.unwrap().len();
            pieces += 1;
        }
        assert_eq!(total, 2500);
        assert!(pieces >= 3);
    }
}
