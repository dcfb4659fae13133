//! Storage seams for the job pipeline.
//!
//! Two tiers back every job: a [`DurableStore`] that is the system of record,
//! and a [`FastQueue`] that carries the work list plus a short-lived record
//! cache. Only the queue manager writes to either of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::jobs::model::{JobId, JobPatch, JobRecord, JobStatus};

pub mod memory_durable;
pub mod memory_queue;
pub mod pg;
pub mod redis_queue;

pub use memory_durable::MemoryJobStore;
pub use memory_queue::MemoryFastQueue;
pub use pg::PgJobStore;
pub use redis_queue::RedisFastQueue;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate job id: {0}")]
    Duplicate(String),
    #[error("corrupt job document: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(e.to_string())
            }
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// System of record for job documents. Every write is atomic per document.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn insert(&self, record: &JobRecord) -> StoreResult<()>;

    /// Conditional partial update. Returns the updated record, or `None` if
    /// the record is missing or the patch preconditions do not hold.
    async fn update_fields(&self, job_id: &JobId, patch: &JobPatch)
        -> StoreResult<Option<JobRecord>>;

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>>;

    /// Oldest first.
    async fn list_by_status(
        &self,
        statuses: &[JobStatus],
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<JobRecord>>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Lifecycle registries kept next to the queue for cheap stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Registry {
    Active,
    Finished,
    Failed,
}

impl Registry {
    pub const ALL: [Registry; 3] = [Registry::Active, Registry::Finished, Registry::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Registry::Active => "active",
            Registry::Finished => "finished",
            Registry::Failed => "failed",
        }
    }

    pub fn for_status(status: JobStatus) -> Option<Registry> {
        match status {
            JobStatus::Queued => None,
            JobStatus::Started | JobStatus::Processing => Some(Registry::Active),
            JobStatus::Finished => Some(Registry::Finished),
            JobStatus::Failed => Some(Registry::Failed),
        }
    }
}

/// Low-latency work queue and record cache. Delivery through `pop` is
/// exclusive: an entry is handed to at most one caller.
#[async_trait]
pub trait FastQueue: Send + Sync {
    async fn push(&self, job_id: &JobId) -> StoreResult<()>;

    /// Waits up to `wait` for an entry. A delivered entry is parked on a
    /// claimed list until `ack`, so a consumer dying right after the pop
    /// does not lose it.
    async fn pop(&self, wait: Duration) -> StoreResult<Option<JobId>>;

    /// Drops a delivered entry from the claimed list.
    async fn ack(&self, job_id: &JobId) -> StoreResult<()>;

    /// Entries delivered but never acknowledged.
    async fn unacked(&self) -> StoreResult<Vec<JobId>>;

    /// Removes a not-yet-delivered entry. `false` if it was not queued.
    async fn remove(&self, job_id: &JobId) -> StoreResult<bool>;

    /// Queued or claimed.
    async fn contains(&self, job_id: &JobId) -> StoreResult<bool>;

    /// Zero-based distance from the head of the queue.
    async fn position(&self, job_id: &JobId) -> StoreResult<Option<u64>>;

    async fn len(&self) -> StoreResult<u64>;

    /// Stores `record` unless the cached copy has a higher
    /// [`JobRecord::cache_rank`], so a stale snapshot never overwrites a
    /// newer state.
    async fn cache_put(&self, record: &JobRecord, ttl: Duration) -> StoreResult<()>;

    async fn cache_get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>>;

    async fn cache_evict(&self, job_id: &JobId) -> StoreResult<()>;

    /// Moves the job into `registry` (or out of all of them on `None`).
    async fn set_registry(
        &self,
        job_id: &JobId,
        registry: Option<Registry>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Members of `registry` recorded at or after `since`.
    async fn registry_count(&self, registry: Registry, since: DateTime<Utc>) -> StoreResult<u64>;

    async fn heartbeat(&self, worker_id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    async fn remove_worker(&self, worker_id: &str) -> StoreResult<()>;

    /// Workers with a heartbeat at or after `since`, sorted by name.
    async fn live_workers(&self, since: DateTime<Utc>) -> StoreResult<Vec<String>>;
}
