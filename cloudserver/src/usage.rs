//! Per-owner storage accounting.
//!
//! The byte counter lives in the KV store with no TTL and is maintained by
//! increments/decrements around mutations. It is rebuilt by a full listing
//! scan whenever it goes missing, so any drift from the non-atomic
//! read-modify-write cycle heals on the next recompute.

use std::collections::HashMap;

use async_trait::async_trait;
use kv_store::GenericKvStore;
use object_gateway::{GenericObjectStore, ListRequest};
use tokio_util::sync::CancellationToken;

use crate::cache_keys;
use crate::context::OwnerId;
use crate::error::ApiError;

/// Lowest tier anyone gets, applied when no other source knows better.
pub const FALLBACK_DOWNLOAD_SPEED: u64 = 50 * 1024;

const DOWNLOAD_SPEED_FEATURE: &str = "downloadSpeedBytesPerSec";

/// Static plan-slug table consulted when the subscription record carries no
/// explicit download-speed feature.
fn plan_download_speed(plan_slug: &str) -> Option<u64> {
    match plan_slug {
        "free" => Some(128 * 1024),
        "basic" => Some(1024 * 1024),
        "pro" => Some(10 * 1024 * 1024),
        "business" => Some(50 * 1024 * 1024),
        _ => None,
    }
}

/// The subscription record of an owner, as served by the (external) billing
/// system.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub plan_slug: String,
    pub max_bytes: u64,
    pub max_upload_size_bytes: u64,
    pub features: HashMap<String, String>,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            plan_slug: "free".to_string(),
            max_bytes: 10 * 1024 * 1024 * 1024,
            max_upload_size_bytes: 2 * 1024 * 1024 * 1024,
            features: HashMap::new(),
        }
    }
}

/// Access to the subscription record; the real implementation lives outside
/// this crate.
#[async_trait]
pub trait SubscriptionProvider: Send + Sync {
    async fn subscription(&self, owner: &OwnerId) -> Result<Subscription, ApiError>;
}

/// Serves one fixed subscription to every owner. Used in tests and local
/// runs without a billing backend.
pub struct StaticSubscriptions(pub Subscription);

#[async_trait]
impl SubscriptionProvider for StaticSubscriptions {
    async fn subscription(&self, _owner: &OwnerId) -> Result<Subscription, ApiError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UsageReport {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub is_limit_exceeded: bool,
    pub usage_percentage: f64,
    pub max_upload_size_bytes: u64,
}

#[derive(Clone)]
pub struct UsageTracker {
    store: GenericObjectStore,
    kv: GenericKvStore,
}

impl UsageTracker {
    pub fn new(store: GenericObjectStore, kv: GenericKvStore) -> Self {
        Self { store, kv }
    }

    /// The cached counter, seeded by a full scan on miss.
    pub async fn used_bytes(
        &self,
        owner: &OwnerId,
        cancel: &CancellationToken,
    ) -> Result<u64, ApiError> {
        let key = cache_keys::usage(owner);
        if let Some(raw) = self.kv.get_raw(&key).await? {
            if let Ok(cached) = raw.parse::<i64>() {
                return Ok(cached.max(0) as u64);
            }
        }
        self.recompute(owner, cancel).await
    }

    /// Walk the whole owner prefix and rewrite the counter from scratch.
    pub async fn recompute(
        &self,
        owner: &OwnerId,
        cancel: &CancellationToken,
    ) -> Result<u64, ApiError> {
        let mut total: u64 = 0;
        let mut continuation_token = None;
        loop {
            let page = self
                .store
                .list_page(
                    &ListRequest {
                        prefix: owner.key_prefix(),
                        continuation_token,
                        ..Default::default()
                    },
                    cancel,
                )
                .await?;
            total += page.objects.iter().map(|o| o.size).sum::<u64>();
            match page.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }
        self.kv
            .set_raw(&cache_keys::usage(owner), &total.to_string(), None)
            .await?;
        tracing::debug!("recomputed usage for {owner}: {total} bytes");
        Ok(total)
    }

    pub async fn report(
        &self,
        owner: &OwnerId,
        subscription: &Subscription,
        cancel: &CancellationToken,
    ) -> Result<UsageReport, ApiError> {
        let used_bytes = self.used_bytes(owner, cancel).await?;
        let max_bytes = subscription.max_bytes;
        Ok(UsageReport {
            used_bytes,
            max_bytes,
            is_limit_exceeded: used_bytes > max_bytes,
            usage_percentage: if max_bytes == 0 {
                100.0
            } else {
                (used_bytes as f64 / max_bytes as f64) * 100.0
            },
            max_upload_size_bytes: subscription.max_upload_size_bytes,
        })
    }

    /// Read-modify-write on the cached counter. Not atomic across workers;
    /// bounded drift is reconciled by [`Self::recompute`].
    pub async fn add(&self, owner: &OwnerId, bytes: u64) -> Result<(), ApiError> {
        self.adjust(owner, bytes as i64).await
    }

    pub async fn subtract(&self, owner: &OwnerId, bytes: u64) -> Result<(), ApiError> {
        self.adjust(owner, -(bytes as i64)).await
    }

    async fn adjust(&self, owner: &OwnerId, delta: i64) -> Result<(), ApiError> {
        let key = cache_keys::usage(owner);
        let current = match self.kv.get_raw(&key).await? {
            Some(raw) => raw.parse::<i64>().unwrap_or(0),
            // No cached value: leave it absent, the next read reseeds from a
            // scan that already reflects this mutation.
            None => return Ok(()),
        };
        let next = (current + delta).max(0);
        self.kv.set_raw(&key, &next.to_string(), None).await?;
        Ok(())
    }
}

/// Effective download throttle for an owner: explicit subscription feature,
/// else plan table, else the fallback floor.
pub fn download_speed_bytes_per_sec(subscription: &Subscription) -> u64 {
    if let Some(raw) = subscription.features.get(DOWNLOAD_SPEED_FEATURE) {
        if let Ok(speed) = raw.parse::<u64>() {
            if speed > 0 {
                return speed;
            }
        }
    }
    plan_download_speed(&subscription.plan_slug).unwrap_or(FALLBACK_DOWNLOAD_SPEED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use object_gateway::{GatewayConfig, MemGateway, PutOptions};
    use std::sync::Arc;

    fn fixtures() -> (GenericObjectStore, GenericKvStore, UsageTracker) {
        let store = GenericObjectStore::InMemory(Arc::new(MemGateway::new(
            GatewayConfig::default(),
        )));
        let kv = GenericKvStore::memory();
        let tracker = UsageTracker::new(store.clone(), kv.clone());
        (store, kv, tracker)
    }

    async fn put(store: &GenericObjectStore, key: &str, len: usize) {
        store
            .put_bytes(
                key,
                Bytes::from(vec![0u8; len]),
                &PutOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn seeds_from_scan_on_miss() {
        let (store, _kv, tracker) = fixtures();
        let owner = OwnerId::user("u1");
        put(&store, "u1/a", 10).await;
        put(&store, "u1/b/c", 20).await;
        put(&store, "u2/other", 99).await;

        let used = tracker
            .used_bytes(&owner, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(used, 30);
    }

    #[tokio::test]
    async fn decrement_clamps_at_zero() {
        let (_store, kv, tracker) = fixtures();
        let owner = OwnerId::user("u1");
        kv.set_raw(&cache_keys::usage(&owner), "5", None)
            .await
            .unwrap();
        tracker.subtract(&owner, 100).await.unwrap();
        let raw = kv.get_raw(&cache_keys::usage(&owner)).await.unwrap();
        assert_eq!(raw.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn usage_conservation_after_mutations() {
        let (store, _kv, tracker) = fixtures();
        let owner = OwnerId::user("u1");
        put(&store, "u1/x", 100).await;
        let _ = tracker
            .used_bytes(&owner, &CancellationToken::new())
            .await
            .unwrap();
        tracker.add(&owner, 50).await.unwrap();
        put(&store, "u1/y", 50).await;

        // recompute agrees with the real object sizes
        let recomputed = tracker
            .recompute(&owner, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(recomputed, 150);
    }

    #[test]
    fn download_speed_resolution_order() {
        let mut sub = Subscription {
            plan_slug: "pro".to_string(),
            ..Default::default()
        };
        assert_eq!(download_speed_bytes_per_sec(&sub), 10 * 1024 * 1024);

        sub.features
            .insert(DOWNLOAD_SPEED_FEATURE.to_string(), "2048".to_string());
        assert_eq!(download_speed_bytes_per_sec(&sub), 2048);

        let unknown = Subscription {
            plan_slug: "mystery".to_string(),
            ..Default::default()
        };
        assert_eq!(download_speed_bytes_per_sec(&unknown), FALLBACK_DOWNLOAD_SPEED);
    }
}
