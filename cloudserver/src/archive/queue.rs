//! Durable job queue over the KV store.
//!
//! Job records and the pending id list live in KV, so jobs survive process
//! restarts whenever the KV backend does (Redis in production). Workers are
//! woken by a local [`Notify`] for low latency and fall back to polling, so
//! multiple processes sharing one Redis drain the same queue.

use std::sync::Arc;
use std::time::Duration;

use kv_store::GenericKvStore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub phase: String,
    pub entries_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_entries: Option<u64>,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_entry: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord<T> {
    pub id: String,
    pub state: JobState,
    pub payload: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct JobQueue {
    kv: GenericKvStore,
    name: &'static str,
    notify: Arc<Notify>,
    record_ttl: Duration,
}

impl JobQueue {
    pub fn new(kv: GenericKvStore, name: &'static str, record_ttl: Duration) -> Self {
        Self {
            kv,
            name,
            notify: Arc::new(Notify::new()),
            record_ttl,
        }
    }

    fn job_key(&self, id: &str) -> String {
        format!("cloud:{}:job:{id}", self.name)
    }

    fn pending_key(&self) -> String {
        format!("cloud:{}:pending", self.name)
    }

    pub async fn enqueue<T: Serialize>(&self, payload: T) -> Result<String, ApiError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let record = JobRecord {
            id: id.clone(),
            state: JobState::Waiting,
            payload,
            progress: None,
            failed_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.kv
            .set_json(&self.job_key(&id), &record, Some(self.record_ttl))
            .await?;
        self.kv.list_push(&self.pending_key(), &id).await?;
        self.notify.notify_one();
        tracing::debug!("enqueued {} job {id}", self.name);
        Ok(id)
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        id: &str,
    ) -> Result<Option<JobRecord<T>>, ApiError> {
        Ok(self.kv.get_json(&self.job_key(id)).await?)
    }

    pub async fn save<T: Serialize>(&self, record: &mut JobRecord<T>) -> Result<(), ApiError> {
        record.updated_at = chrono::Utc::now().timestamp();
        self.kv
            .set_json(&self.job_key(&record.id), record, Some(self.record_ttl))
            .await?;
        Ok(())
    }

    /// Pop the next runnable job and mark it active. Ids whose records have
    /// expired or were cancelled while queued are skipped.
    pub async fn take_next<T: DeserializeOwned + Serialize>(
        &self,
    ) -> Result<Option<JobRecord<T>>, ApiError> {
        loop {
            let Some(id) = self.kv.list_pop(&self.pending_key()).await? else {
                return Ok(None);
            };
            let Some(mut record) = self.get::<T>(&id).await? else {
                tracing::warn!("{} job {id} was queued but its record is gone", self.name);
                continue;
            };
            if record.state != JobState::Waiting {
                continue;
            }
            record.state = JobState::Active;
            self.save(&mut record).await?;
            return Ok(Some(record));
        }
    }

    /// Put an id back on the pending list (worker shutdown mid-job). The
    /// job record must already be back in `Waiting`.
    pub async fn requeue(&self, id: &str) -> Result<(), ApiError> {
        self.kv.list_push(&self.pending_key(), id).await?;
        Ok(())
    }

    /// Cancel a job that has not started: remove it from the pending list
    /// and mark the record. Returns false if it was no longer waiting.
    pub async fn cancel_waiting<T: DeserializeOwned + Serialize>(
        &self,
        id: &str,
    ) -> Result<bool, ApiError> {
        if !self.kv.list_remove(&self.pending_key(), id).await? {
            return Ok(false);
        }
        if let Some(mut record) = self.get::<T>(id).await? {
            record.state = JobState::Cancelled;
            self.save(&mut record).await?;
        }
        Ok(true)
    }

    /// Park a worker until there may be work: a local enqueue, the poll
    /// interval elapsing (for work enqueued by other processes), or
    /// shutdown.
    pub async fn wait_for_work(&self, poll_interval: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestPayload {
        value: u32,
    }

    fn queue() -> JobQueue {
        JobQueue::new(
            GenericKvStore::memory(),
            "archive-test",
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn fifo_take() {
        let q = queue();
        let a = q.enqueue(TestPayload { value: 1 }).await.unwrap();
        let b = q.enqueue(TestPayload { value: 2 }).await.unwrap();

        let first = q.take_next::<TestPayload>().await.unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.state, JobState::Active);
        let second = q.take_next::<TestPayload>().await.unwrap().unwrap();
        assert_eq!(second.id, b);
        assert!(q.take_next::<TestPayload>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_waiting_removes_from_queue() {
        let q = queue();
        let id = q.enqueue(TestPayload { value: 1 }).await.unwrap();
        assert!(q.cancel_waiting::<TestPayload>(&id).await.unwrap());

        let record = q.get::<TestPayload>(&id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Cancelled);
        assert!(q.take_next::<TestPayload>().await.unwrap().is_none());

        // cancelling an active job through this path is refused
        let id2 = q.enqueue(TestPayload { value: 2 }).await.unwrap();
        let _ = q.take_next::<TestPayload>().await.unwrap().unwrap();
        assert!(!q.cancel_waiting::<TestPayload>(&id2).await.unwrap());
    }
}
