use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::jobs::model::{JobId, JobRecord};
use crate::stores::{FastQueue, Registry, StoreError, StoreResult};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<JobId>,
    claimed: Vec<JobId>,
    cache: HashMap<JobId, (JobRecord, Instant)>,
    registries: HashMap<Registry, HashMap<JobId, DateTime<Utc>>>,
    workers: HashMap<String, DateTime<Utc>>,
}

/// In-process fast queue. Exclusive delivery comes from popping under a
/// single mutex; waiting consumers are woken through `Notify`.
/// `set_available(false)` makes every call fail as if the broker were down.
#[derive(Clone, Default)]
pub struct MemoryFastQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    offline: Arc<AtomicBool>,
}

impl MemoryFastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, QueueState>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory queue offline".into()));
        }
        Ok(self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

#[async_trait]
impl FastQueue for MemoryFastQueue {
    async fn push(&self, job_id: &JobId) -> StoreResult<()> {
        self.lock()?.queue.push_back(job_id.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> StoreResult<Option<JobId>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock()?;
                if let Some(id) = state.queue.pop_front() {
                    state.claimed.push(id.clone());
                    return Ok(Some(id));
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn ack(&self, job_id: &JobId) -> StoreResult<()> {
        self.lock()?.claimed.retain(|id| id != job_id);
        Ok(())
    }

    async fn unacked(&self) -> StoreResult<Vec<JobId>> {
        Ok(self.lock()?.claimed.clone())
    }

    async fn remove(&self, job_id: &JobId) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let before = state.queue.len();
        state.queue.retain(|id| id != job_id);
        Ok(state.queue.len() < before)
    }

    async fn contains(&self, job_id: &JobId) -> StoreResult<bool> {
        let state = self.lock()?;
        Ok(state.queue.contains(job_id) || state.claimed.contains(job_id))
    }

    async fn position(&self, job_id: &JobId) -> StoreResult<Option<u64>> {
        Ok(self
            .lock()?
            .queue
            .iter()
            .position(|id| id == job_id)
            .map(|i| i as u64))
    }

    async fn len(&self) -> StoreResult<u64> {
        Ok(self.lock()?.queue.len() as u64)
    }

    async fn cache_put(&self, record: &JobRecord, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut state = self.lock()?;
        if let Some((cached, expires)) = state.cache.get(&record.job_id) {
            if *expires > now && cached.cache_rank() > record.cache_rank() {
                return Ok(());
            }
        }
        state
            .cache
            .insert(record.job_id.clone(), (record.clone(), now + ttl));
        Ok(())
    }

    async fn cache_get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        let mut state = self.lock()?;
        match state.cache.get(job_id) {
            Some((record, expires)) if *expires > Instant::now() => Ok(Some(record.clone())),
            Some(_) => {
                state.cache.remove(job_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn cache_evict(&self, job_id: &JobId) -> StoreResult<()> {
        self.lock()?.cache.remove(job_id);
        Ok(())
    }

    async fn set_registry(
        &self,
        job_id: &JobId,
        registry: Option<Registry>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.lock()?;
        for members in state.registries.values_mut() {
            members.remove(job_id);
        }
        if let Some(registry) = registry {
            state
                .registries
                .entry(registry)
                .or_default()
                .insert(job_id.clone(), at);
        }
        Ok(())
    }

    async fn registry_count(&self, registry: Registry, since: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let Some(members) = state.registries.get_mut(&registry) else {
            return Ok(0);
        };
        members.retain(|_, at| *at >= since);
        Ok(members.len() as u64)
    }

    async fn heartbeat(&self, worker_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.lock()?.workers.insert(worker_id.to_string(), at);
        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> StoreResult<()> {
        self.lock()?.workers.remove(worker_id);
        Ok(())
    }

    async fn live_workers(&self, since: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut state = self.lock()?;
        state.workers.retain(|_, at| *at >= since);
        let mut names: Vec<String> = state.workers.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
