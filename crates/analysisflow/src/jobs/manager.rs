// crates/analysisflow/src/jobs/manager.rs

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, DurableBackend, FastQueueBackend};
use crate::db;
use crate::jobs::error::QueueError;
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::{
    AnalysisOutput, JobFailure, JobId, JobPatch, JobRecord, JobResult, JobStatus, JobStatusView,
    QueueStats, Transition,
};
use crate::stores::{
    DurableStore, FastQueue, MemoryFastQueue, MemoryJobStore, PgJobStore, RedisFastQueue, Registry,
};

const RECOVERY_BATCH: i64 = 200;
const DEFAULT_QUERY: &str = "Analyze this financial document for investment insights";
const DEFAULT_WORKER_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub queue_name: String,
    /// Lifetime of cached records and of registry entries used by `stats`.
    pub result_ttl: Duration,
    /// A worker counts as live if it sent a heartbeat within this window.
    pub worker_ttl: Duration,
}

impl QueueSettings {
    pub fn new(queue_name: impl Into<String>, result_ttl: Duration) -> Self {
        Self {
            queue_name: queue_name.into(),
            result_ttl,
            worker_ttl: DEFAULT_WORKER_TTL,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.queue.clone(), cfg.result_ttl())
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Back in the queue with one more attempt consumed.
    Retried(Transition),
    /// Terminally failed.
    Failed(Transition),
}

impl AttemptOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            AttemptOutcome::Retried(t) | AttemptOutcome::Failed(t) => t.record(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryReport {
    pub requeued: u64,
    pub failed: u64,
    pub repushed: u64,
    /// Claimed entries whose consumer never started them.
    pub reclaimed: u64,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0 && self.repushed == 0 && self.reclaimed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HealthReport {
    pub durable_store: bool,
    pub fast_queue: bool,
}

impl HealthReport {
    pub fn ok(&self) -> bool {
        self.durable_store && self.fast_queue
    }
}

/// Single write path for job records.
///
/// Every mutation goes to the durable store first and is then mirrored into
/// the fast queue's cache and registries on a best-effort basis. Reads prefer
/// the cache and fall back to the durable store.
#[derive(Clone)]
pub struct QueueManager {
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastQueue>,
    settings: QueueSettings,
}

impl QueueManager {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        fast: Arc<dyn FastQueue>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            durable,
            fast,
            settings,
        }
    }

    /// Builds the configured backends.
    pub async fn connect(cfg: &Config) -> anyhow::Result<Self> {
        let durable: Arc<dyn DurableStore> = match cfg.durable_backend {
            DurableBackend::Postgres => {
                let url = cfg
                    .database_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;
                let pool = db::make_pool(url).await?;
                if cfg.migrate_on_startup {
                    db::run_migrations(&pool).await?;
                }
                Arc::new(PgJobStore::new(pool))
            }
            DurableBackend::Memory => Arc::new(MemoryJobStore::new()),
        };

        let fast: Arc<dyn FastQueue> = match cfg.fast_backend {
            FastQueueBackend::Redis => Arc::new(RedisFastQueue::new(&cfg.redis_url, &cfg.queue).await?),
            FastQueueBackend::Memory => Arc::new(MemoryFastQueue::new()),
        };

        info!(
            durable = ?cfg.durable_backend,
            fast = ?cfg.fast_backend,
            queue = %cfg.queue,
            "stores connected"
        );

        Ok(Self::new(durable, fast, QueueSettings::from_config(cfg)))
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn queue_name(&self) -> &str {
        &self.settings.queue_name
    }

    /// A blank query falls back to the default analysis prompt.
    pub async fn submit(&self, document_ref: &str, query: &str) -> Result<JobId, QueueError> {
        if document_ref.trim().is_empty() {
            return Err(QueueError::InvalidInput("document_ref is empty".into()));
        }
        let query = match query.trim() {
            "" => DEFAULT_QUERY,
            q => q,
        };

        let record = JobRecord::new_queued(document_ref, query, Utc::now());
        let job_id = record.job_id.clone();

        // Durable first: a queue entry must never point at a missing record.
        self.durable.insert(&record).await?;
        self.mirror(&record).await;

        if let Err(e) = self.fast.push(&job_id).await {
            warn!(job_id = %job_id, error = %e, "enqueue failed after durable insert");
            let failure = JobFailure {
                code: ErrorCode::EnqueueFailed.as_str().to_string(),
                message: format!("could not enqueue job: {e}"),
                attempts: 0,
            };
            match self
                .durable
                .update_fields(&job_id, &JobPatch::fail_queued(failure, Utc::now()))
                .await
            {
                Ok(Some(rec)) => self.mirror(&rec).await,
                Ok(None) => {}
                Err(e2) => warn!(job_id = %job_id, error = %e2, "could not record enqueue failure"),
            }
            return Err(QueueError::StoreUnavailable(e.to_string()));
        }

        info!(job_id = %job_id, queue = %self.settings.queue_name, "job submitted");
        Ok(job_id)
    }

    /// Terminal states are served from the cache. Anything earlier may have
    /// moved on since it was cached, so it is confirmed against the durable
    /// store, falling back to the cached copy while that store is down.
    pub async fn get_status(&self, job_id: &JobId) -> Result<JobStatusView, QueueError> {
        let cached = self.cached(job_id).await;
        if let Some(rec) = cached.as_ref().filter(|r| r.status.is_terminal()) {
            return Ok(rec.status_view());
        }

        let rec = match self.load_durable(job_id).await {
            Ok(rec) => rec,
            Err(QueueError::StoreUnavailable(e)) => match cached {
                Some(rec) => {
                    debug!(job_id = %job_id, error = %e, "durable store down, serving cached status");
                    rec
                }
                None => return Err(QueueError::StoreUnavailable(e)),
            },
            Err(e) => return Err(e),
        };

        let mut view = rec.status_view();
        if rec.status == JobStatus::Queued {
            view.position = match self.fast.position(job_id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "queue position unavailable");
                    None
                }
            };
        }
        Ok(view)
    }

    pub async fn get_result(&self, job_id: &JobId) -> Result<JobResult, QueueError> {
        let cached = self.cached(job_id).await;
        if let Some(view) = cached.as_ref().and_then(JobRecord::result_view) {
            return Ok(view);
        }

        // The cache can lag behind the durable store; only it can say "not ready".
        let rec = match self.load_durable(job_id).await {
            Ok(rec) => rec,
            Err(QueueError::StoreUnavailable(_)) if cached.is_some() => {
                let status = cached.map_or(JobStatus::Queued, |r| r.status);
                return Err(QueueError::NotReady {
                    job_id: job_id.to_string(),
                    status,
                });
            }
            Err(e) => return Err(e),
        };

        rec.result_view().ok_or_else(|| QueueError::NotReady {
            job_id: job_id.to_string(),
            status: rec.status,
        })
    }

    /// Exclusive pop. Entries whose record is gone or no longer queued are
    /// dropped; the caller still has to win `mark_started`.
    pub async fn dequeue(&self, wait: Duration) -> Result<Option<JobRecord>, QueueError> {
        let Some(job_id) = self.fast.pop(wait).await? else {
            return Ok(None);
        };

        // the claim is acknowledged by `mark_started`, or here when dropped
        match self.durable.get(&job_id).await {
            Ok(Some(rec)) if rec.status == JobStatus::Queued => Ok(Some(rec)),
            Ok(Some(rec)) => {
                debug!(job_id = %job_id, status = %rec.status, "dropping stale queue entry");
                self.ack(&job_id).await;
                Ok(None)
            }
            Ok(None) => {
                warn!(job_id = %job_id, "queue entry without durable record");
                self.ack(&job_id).await;
                Ok(None)
            }
            Err(e) => {
                match self.fast.push(&job_id).await {
                    Ok(()) => self.ack(&job_id).await,
                    Err(e2) => {
                        warn!(job_id = %job_id, error = %e2, "could not return entry to queue")
                    }
                }
                Err(e.into())
            }
        }
    }

    pub async fn mark_started(
        &self,
        job_id: &JobId,
        worker_id: &str,
    ) -> Result<Transition, QueueError> {
        let t = self
            .transition(job_id, JobPatch::start(worker_id, Utc::now()), JobStatus::Started)
            .await?;
        self.ack(job_id).await;
        Ok(t)
    }

    pub async fn mark_processing(&self, job_id: &JobId) -> Result<Transition, QueueError> {
        self.transition(job_id, JobPatch::processing(), JobStatus::Processing)
            .await
    }

    pub async fn mark_finished(
        &self,
        job_id: &JobId,
        output: AnalysisOutput,
    ) -> Result<Transition, QueueError> {
        self.transition(job_id, JobPatch::finish(output, Utc::now()), JobStatus::Finished)
            .await
    }

    pub async fn mark_failed(
        &self,
        job_id: &JobId,
        failure: JobFailure,
    ) -> Result<Transition, QueueError> {
        self.transition(job_id, JobPatch::fail(failure, Utc::now()), JobStatus::Failed)
            .await
    }

    /// Puts an in-flight job back on the queue, consuming one retry.
    /// Applies only while `retry_count` still equals `expected_retry_count`.
    pub async fn requeue_for_retry(
        &self,
        job_id: &JobId,
        expected_retry_count: i32,
    ) -> Result<Transition, QueueError> {
        let patch = JobPatch::requeue(expected_retry_count);
        let Some(rec) = self.durable.update_fields(job_id, &patch).await? else {
            let current = self.load_durable(job_id).await?;
            if current.status.is_terminal() || current.retry_count > expected_retry_count {
                return Ok(Transition::Unchanged(current));
            }
            return Err(QueueError::InvalidTransition {
                job_id: job_id.to_string(),
                from: current.status,
                to: JobStatus::Queued,
            });
        };

        self.mirror(&rec).await;
        if let Err(e) = self.fast.push(job_id).await {
            // Still queued durably; the recovery sweep re-pushes it.
            warn!(job_id = %job_id, error = %e, "requeued job could not be pushed");
        }
        info!(job_id = %job_id, retry_count = rec.retry_count, "job requeued for retry");
        Ok(Transition::Applied(rec))
    }

    /// Settles a failed attempt: requeue while the error is retryable and
    /// budget remains, terminal failure otherwise. A job gets at most
    /// `max_retries + 1` attempts.
    pub async fn fail_attempt(
        &self,
        record: &JobRecord,
        code: ErrorCode,
        message: &str,
        max_retries: u32,
    ) -> Result<AttemptOutcome, QueueError> {
        let used = record.retry_count.max(0) as u32;
        if code.is_retryable() && used < max_retries {
            let t = self
                .requeue_for_retry(&record.job_id, record.retry_count)
                .await?;
            return Ok(AttemptOutcome::Retried(t));
        }

        let failure = JobFailure {
            code: code.as_str().to_string(),
            message: message.to_string(),
            attempts: record.attempt_no(),
        };
        let t = self.mark_failed(&record.job_id, failure).await?;
        Ok(AttemptOutcome::Failed(t))
    }

    /// Cancels a job that no worker has picked up yet. `false` when it is
    /// already running or done.
    pub async fn cancel(&self, job_id: &JobId) -> Result<bool, QueueError> {
        let rec = self.load_durable(job_id).await?;
        if rec.status != JobStatus::Queued {
            return Ok(false);
        }
        if !self.fast.remove(job_id).await? {
            return Ok(false);
        }

        let failure = JobFailure {
            code: ErrorCode::Cancelled.as_str().to_string(),
            message: "job cancelled before execution".to_string(),
            attempts: rec.retry_count.max(0) as u32,
        };
        match self
            .durable
            .update_fields(job_id, &JobPatch::fail_queued(failure, Utc::now()))
            .await?
        {
            Some(rec) => {
                self.mirror(&rec).await;
                info!(job_id = %job_id, "job cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let since = ago(self.settings.result_ttl);
        let worker_names = self.fast.live_workers(ago(self.settings.worker_ttl)).await?;

        Ok(QueueStats {
            queued_jobs: self.fast.len().await?,
            active_jobs: self.fast.registry_count(Registry::Active, since).await?,
            finished_jobs: self.fast.registry_count(Registry::Finished, since).await?,
            failed_jobs: self.fast.registry_count(Registry::Failed, since).await?,
            workers: worker_names.len() as u64,
            worker_names,
            queue_name: self.settings.queue_name.clone(),
        })
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), QueueError> {
        self.fast.heartbeat(worker_id, Utc::now()).await?;
        Ok(())
    }

    pub async fn deregister_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        self.fast.remove_worker(worker_id).await?;
        Ok(())
    }

    /// Crash-recovery sweep.
    ///
    /// In-flight jobs not touched for `stale_after` lost their worker and are
    /// settled as a `WORKER_LOST` attempt. Claimed entries whose job is still
    /// queued go back on the queue. Queued jobs older than `stale_after` and
    /// missing from the fast queue are pushed again.
    pub async fn recover(
        &self,
        stale_after: Duration,
        max_retries: u32,
    ) -> Result<RecoveryReport, QueueError> {
        let cutoff = ago(stale_after);
        let mut report = RecoveryReport::default();

        let stuck = self
            .durable
            .list_by_status(&JobStatus::IN_FLIGHT, cutoff, RECOVERY_BATCH)
            .await?;
        for rec in stuck {
            let message = format!(
                "worker {} stopped reporting",
                rec.worker_id.as_deref().unwrap_or("unknown")
            );
            match self
                .fail_attempt(&rec, ErrorCode::WorkerLost, &message, max_retries)
                .await
            {
                Ok(AttemptOutcome::Retried(t)) if t.applied() => {
                    report.requeued += 1;
                    warn!(job_id = %rec.job_id, status = %rec.status, "stale job requeued");
                }
                Ok(AttemptOutcome::Failed(t)) if t.applied() => {
                    report.failed += 1;
                    warn!(job_id = %rec.job_id, status = %rec.status, "stale job failed, retries exhausted");
                }
                // finished or moved on between the listing and the write
                Ok(_) | Err(QueueError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        for job_id in self.fast.unacked().await? {
            match self.durable.get(&job_id).await? {
                Some(rec) if rec.status == JobStatus::Queued => {
                    self.fast.push(&job_id).await?;
                    self.ack(&job_id).await;
                    report.reclaimed += 1;
                    warn!(job_id = %job_id, "claimed job never started, returned to queue");
                }
                _ => self.ack(&job_id).await,
            }
        }

        let queued = self
            .durable
            .list_by_status(&[JobStatus::Queued], cutoff, RECOVERY_BATCH)
            .await?;
        for rec in queued {
            if self.fast.contains(&rec.job_id).await? {
                continue;
            }
            self.fast.push(&rec.job_id).await?;
            self.mirror(&rec).await;
            report.repushed += 1;
            warn!(job_id = %rec.job_id, "re-pushed queued job missing from fast queue");
        }

        Ok(report)
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            durable_store: self.durable.ping().await.is_ok(),
            fast_queue: self.fast.len().await.is_ok(),
        }
    }

    async fn transition(
        &self,
        job_id: &JobId,
        patch: JobPatch,
        target: JobStatus,
    ) -> Result<Transition, QueueError> {
        if let Some(rec) = self.durable.update_fields(job_id, &patch).await? {
            self.mirror(&rec).await;
            debug!(job_id = %job_id, status = %rec.status, "job transitioned");
            return Ok(Transition::Applied(rec));
        }

        let current = self.load_durable(job_id).await?;
        if current.status.is_terminal() || current.status.stage() >= target.stage() {
            debug!(job_id = %job_id, status = %current.status, to = %target, "transition already applied");
            return Ok(Transition::Unchanged(current));
        }
        Err(QueueError::InvalidTransition {
            job_id: job_id.to_string(),
            from: current.status,
            to: target,
        })
    }

    async fn load_durable(&self, job_id: &JobId) -> Result<JobRecord, QueueError> {
        let rec = self
            .durable
            .get(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        self.cache_only(&rec).await;
        Ok(rec)
    }

    async fn cached(&self, job_id: &JobId) -> Option<JobRecord> {
        match self.fast.cache_get(job_id).await {
            Ok(rec) => rec,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "cache read failed, using durable store");
                None
            }
        }
    }

    async fn cache_only(&self, rec: &JobRecord) {
        if let Err(e) = self.fast.cache_put(rec, self.settings.result_ttl).await {
            warn!(job_id = %rec.job_id, error = %e, "cache write failed, evicting");
            if let Err(e) = self.fast.cache_evict(&rec.job_id).await {
                warn!(job_id = %rec.job_id, error = %e, "cache evict failed");
            }
        }
    }

    async fn ack(&self, job_id: &JobId) {
        if let Err(e) = self.fast.ack(job_id).await {
            warn!(job_id = %job_id, error = %e, "could not acknowledge queue entry");
        }
    }

    async fn mirror(&self, rec: &JobRecord) {
        self.cache_only(rec).await;
        let registry = Registry::for_status(rec.status);
        if let Err(e) = self
            .fast
            .set_registry(&rec.job_id, registry, rec.updated_at)
            .await
        {
            warn!(job_id = %rec.job_id, error = %e, "registry update failed");
        }
    }
}

fn ago(d: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
