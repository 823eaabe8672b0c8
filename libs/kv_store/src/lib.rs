//! Key-value cache store used for sessions, manifests, usage counters,
//! idempotency records, job state and queue backing.
//!
//! Two backends behind one dispatch enum:
//!   * [`redis_kv::RedisKv`] is the production backend
//!   * [`memory::MemoryKv`] is the in-process fallback with the same observable
//!     semantics (TTL, glob patterns, lists), used when no Redis is
//!     configured and throughout the test suite
//!
//! Values are strings; typed access goes through the JSON helpers. Glob
//! patterns support `*` and `?`, the subset both backends understand.

#![deny(unsafe_code)]

pub mod memory;
pub mod redis_kv;

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

pub use memory::MemoryKv;
pub use redis_kv::RedisKv;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Clone)]
pub enum GenericKvStore {
    Redis(RedisKv),
    Memory(MemoryKv),
}

impl GenericKvStore {
    pub fn memory() -> Self {
        Self::Memory(MemoryKv::new())
    }

    pub async fn from_redis_url(url: &str) -> anyhow::Result<Self> {
        Ok(Self::Redis(RedisKv::connect(url).await?))
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>, KvError> {
        match self {
            Self::Redis(s) => s.get_raw(key).await,
            Self::Memory(s) => Ok(s.get_raw(key)),
        }
    }

    pub async fn set_raw(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        match self {
            Self::Redis(s) => s.set_raw(key, value, ttl).await,
            Self::Memory(s) => {
                s.set_raw(key, value, ttl);
                Ok(())
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        match self {
            Self::Redis(s) => s.delete(key).await,
            Self::Memory(s) => {
                s.delete(key);
                Ok(())
            }
        }
    }

    /// All keys matching a glob pattern. Unbounded; callers keep their
    /// patterns narrow (they are always owner-scoped).
    pub async fn find_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        match self {
            Self::Redis(s) => s.find_keys(pattern).await,
            Self::Memory(s) => Ok(s.find_keys(pattern)),
        }
    }

    /// Delete every key matching the glob pattern; returns how many went.
    pub async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, KvError> {
        match self {
            Self::Redis(s) => s.delete_by_pattern(pattern).await,
            Self::Memory(s) => Ok(s.delete_by_pattern(pattern)),
        }
    }

    /// Append to the tail of a list (RPUSH).
    pub async fn list_push(&self, key: &str, value: &str) -> Result<(), KvError> {
        match self {
            Self::Redis(s) => s.list_push(key, value).await,
            Self::Memory(s) => {
                s.list_push(key, value);
                Ok(())
            }
        }
    }

    /// Pop from the head of a list (LPOP); `None` when empty.
    pub async fn list_pop(&self, key: &str) -> Result<Option<String>, KvError> {
        match self {
            Self::Redis(s) => s.list_pop(key).await,
            Self::Memory(s) => Ok(s.list_pop(key)),
        }
    }

    /// Remove a specific value from a list (LREM); returns true if found.
    pub async fn list_remove(&self, key: &str, value: &str) -> Result<bool, KvError> {
        match self {
            Self::Redis(s) => s.list_remove(key, value).await,
            Self::Memory(s) => Ok(s.list_remove(key, value)),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KvError> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let raw = serde_json::to_string(value)?;
        self.set_raw(key, &raw, ttl).await
    }
}
