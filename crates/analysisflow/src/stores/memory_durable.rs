use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::jobs::model::{JobId, JobPatch, JobRecord, JobStatus};
use crate::stores::{DurableStore, StoreError, StoreResult};

/// In-process durable store for single-process deployments and tests.
/// Records live as long as the process.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, JobRecord>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing the connection: every call fails with `Unavailable`
    /// until switched back on.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryJobStore {
    async fn insert(&self, record: &JobRecord) -> StoreResult<()> {
        self.check()?;
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&record.job_id) {
            return Err(StoreError::Duplicate(record.job_id.to_string()));
        }
        jobs.insert(record.job_id.clone(), record.clone());
        Ok(())
    }

    async fn update_fields(
        &self,
        job_id: &JobId,
        patch: &JobPatch,
    ) -> StoreResult<Option<JobRecord>> {
        self.check()?;
        let mut jobs = self.jobs.write().await;
        let Some(record) = jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if !patch.matches(record) {
            return Ok(None);
        }
        patch.apply(record, Utc::now());
        Ok(Some(record.clone()))
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        self.check()?;
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn list_by_status(
        &self,
        statuses: &[JobStatus],
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<JobRecord>> {
        self.check()?;
        let jobs = self.jobs.read().await;
        let mut out: Vec<JobRecord> = jobs
            .values()
            .filter(|r| statuses.contains(&r.status) && r.updated_at < updated_before)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.job_id.as_str().cmp(b.job_id.as_str()))
        });
        out.truncate(limit.clamp(1, 1_000) as usize);
        Ok(out)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }
}
