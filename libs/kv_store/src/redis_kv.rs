//! Redis backend. A single multiplexed [`ConnectionManager`] is shared by
//! all callers; it reconnects on its own after connection loss. Pattern
//! operations use SCAN with MATCH rather than KEYS so a large keyspace does
//! not stall the server.

use std::time::Duration;

use anyhow::Context;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::KvError;

#[derive(Clone)]
pub struct RedisKv {
    connection: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("parse redis url")?;
        let connection = ConnectionManager::new(client)
            .await
            .context("connect to redis")?;
        tracing::info!("connected to redis kv store");
        Ok(Self { connection })
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .with_context(|| format!("GET {key}"))
            .map_err(KvError::Backend)?;
        Ok(value)
    }

    pub async fn set_raw(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                // SETEX wants whole seconds; round sub-second TTLs up so a
                // short-lived key still exists at all.
                let secs = ttl.as_secs().max(1);
                let _: () = conn
                    .set_ex(key, value, secs)
                    .await
                    .with_context(|| format!("SETEX {key}"))
                    .map_err(KvError::Backend)?;
            }
            None => {
                let _: () = conn
                    .set(key, value)
                    .await
                    .with_context(|| format!("SET {key}"))
                    .map_err(KvError::Backend)?;
            }
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(key)
            .await
            .with_context(|| format!("DEL {key}"))
            .map_err(KvError::Backend)?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("SCAN {pattern}"))
                .map_err(KvError::Backend)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    pub async fn find_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        self.scan_keys(pattern).await
    }

    pub async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, KvError> {
        let keys = self.scan_keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let deleted: u64 = conn
            .del(&keys)
            .await
            .with_context(|| format!("DEL {} keys for {pattern}", keys.len()))
            .map_err(KvError::Backend)?;
        Ok(deleted)
    }

    pub async fn list_push(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .rpush(key, value)
            .await
            .with_context(|| format!("RPUSH {key}"))
            .map_err(KvError::Backend)?;
        Ok(())
    }

    pub async fn list_pop(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn
            .lpop(key, None)
            .await
            .with_context(|| format!("LPOP {key}"))
            .map_err(KvError::Backend)?;
        Ok(value)
    }

    pub async fn list_remove(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let mut conn = self.connection.clone();
        let removed: u64 = conn
            .lrem(key, 0, value)
            .await
            .with_context(|| format!("LREM {key}"))
            .map_err(KvError::Backend)?;
        Ok(removed > 0)
    }
}
