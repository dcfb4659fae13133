// crates/analysisflow/src/jobs/worker.rs

use rand::{rngs::StdRng, SeedableRng};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::jobs::analysis::{Analyzer, ExecutionError};
use crate::jobs::error::QueueError;
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::manager::{AttemptOutcome, QueueManager};
use crate::jobs::model::{JobId, JobRecord, Transition};
use crate::jobs::retry::{next_delay, RetryConfig};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub job_timeout: Duration,
    pub max_retries: u32,
    /// How long one dequeue call blocks; also bounds shutdown latency.
    pub poll_wait: Duration,
    pub heartbeat_interval: Duration,
    pub write_retry: RetryConfig,
    pub delete_documents: bool,
    pub stale_after: Duration,
    pub recovery_interval: Duration,
}

impl WorkerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            worker_id: cfg.worker_id.clone(),
            concurrency: cfg.worker_concurrency.max(1),
            job_timeout: cfg.job_timeout(),
            max_retries: cfg.max_retries,
            poll_wait: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            write_retry: RetryConfig::default(),
            delete_documents: cfg.delete_documents,
            stale_after: cfg.stale_after(),
            recovery_interval: cfg.recovery_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Finished(JobId),
    Retried(JobId),
    Failed(JobId),
    /// Another slot won `mark_started`, or the job was no longer runnable.
    Skipped(JobId),
    /// Store writes kept failing; the record stays at its last durable state.
    Unsettled(JobId),
}

#[derive(Clone)]
pub struct Worker {
    manager: QueueManager,
    analyzer: Arc<dyn Analyzer>,
    cfg: WorkerConfig,
}

impl Worker {
    pub fn new(manager: QueueManager, analyzer: Arc<dyn Analyzer>, cfg: WorkerConfig) -> Self {
        Self {
            manager,
            analyzer,
            cfg,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.cfg
    }

    /// Runs the slots, the heartbeat and the recovery sweep until `shutdown`
    /// flips to `true`. Slots finish the job they hold before returning.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let slots: Vec<String> = (0..self.cfg.concurrency)
            .map(|i| format!("{}-{}", self.cfg.worker_id, i))
            .collect();

        info!(
            worker_id = %self.cfg.worker_id,
            slots = slots.len(),
            queue = %self.manager.queue_name(),
            timeout_secs = self.cfg.job_timeout.as_secs(),
            max_retries = self.cfg.max_retries,
            "worker starting"
        );

        let mut set = JoinSet::new();
        for slot_id in slots.clone() {
            let worker = self.clone();
            let rx = shutdown.clone();
            set.spawn(async move { worker.slot_loop(slot_id, rx).await });
        }
        {
            let worker = self.clone();
            let rx = shutdown.clone();
            set.spawn(async move { worker.heartbeat_loop(slots, rx).await });
        }
        {
            let worker = self.clone();
            let rx = shutdown.clone();
            set.spawn(async move { worker.recovery_loop(rx).await });
        }

        while let Some(joined) = set.join_next().await {
            joined?;
        }

        info!(worker_id = %self.cfg.worker_id, "worker stopped");
        Ok(())
    }

    /// Takes at most one job from the queue and drives it to its next resting
    /// state. `Ok(None)` when the queue stayed empty for `poll_wait`.
    pub async fn run_once(&self, slot_id: &str) -> Result<Option<JobOutcome>, QueueError> {
        let Some(record) = self.manager.dequeue(self.cfg.poll_wait).await? else {
            return Ok(None);
        };
        Ok(Some(self.process(record, slot_id).await))
    }

    pub async fn process(&self, record: JobRecord, slot_id: &str) -> JobOutcome {
        let job_id = record.job_id.clone();
        let manager = &self.manager;

        let started = {
            let job_id = &job_id;
            self.write_with_retry("mark_started", job_id, move || {
                manager.mark_started(job_id, slot_id)
            })
            .await
        };
        let record = match started {
            Some(Transition::Applied(rec)) => rec,
            Some(Transition::Unchanged(rec)) => {
                debug!(job_id = %job_id, status = %rec.status, slot = slot_id, "job already taken");
                return JobOutcome::Skipped(job_id);
            }
            None => return JobOutcome::Unsettled(job_id),
        };

        info!(
            job_id = %job_id,
            slot = slot_id,
            attempt_no = record.attempt_no(),
            "job started"
        );

        // started -> finished is legal too, so a lost processing write is not fatal
        let record = {
            let job_id = &job_id;
            match self
                .write_with_retry("mark_processing", job_id, move || {
                    manager.mark_processing(job_id)
                })
                .await
            {
                Some(t) => t.record().clone(),
                None => record,
            }
        };

        let t0 = Instant::now();
        let result = match tokio::time::timeout(
            self.cfg.job_timeout,
            self.analyzer.analyze(&record.document_ref, &record.query),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(ExecutionError::new(
                ErrorCode::Timeout,
                format!(
                    "analysis exceeded the {}s time limit",
                    self.cfg.job_timeout.as_secs()
                ),
            )),
        };
        let latency_ms = t0.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(output) => {
                let job_id_ref = &job_id;
                let written = self
                    .write_with_retry("mark_finished", job_id_ref, move || {
                        manager.mark_finished(job_id_ref, output.clone())
                    })
                    .await;
                match written {
                    Some(_) => {
                        info!(job_id = %job_id, slot = slot_id, latency_ms, "job finished");
                        JobOutcome::Finished(job_id.clone())
                    }
                    None => JobOutcome::Unsettled(job_id.clone()),
                }
            }
            Err(err) => {
                warn!(
                    job_id = %job_id,
                    slot = slot_id,
                    code = %err.code,
                    latency_ms,
                    error = %err.message,
                    "job attempt failed"
                );
                let record = &record;
                let err = &err;
                let max_retries = self.cfg.max_retries;
                let settled = self
                    .write_with_retry("fail_attempt", &job_id, move || {
                        manager.fail_attempt(record, err.code, &err.message, max_retries)
                    })
                    .await;
                match settled {
                    Some(AttemptOutcome::Retried(t)) => {
                        info!(
                            job_id = %job_id,
                            retry_count = t.record().retry_count,
                            "retry scheduled"
                        );
                        JobOutcome::Retried(job_id.clone())
                    }
                    Some(AttemptOutcome::Failed(t)) => {
                        warn!(
                            job_id = %job_id,
                            code = %err.code,
                            attempts = t.record().attempt_no(),
                            "job failed"
                        );
                        JobOutcome::Failed(job_id.clone())
                    }
                    None => JobOutcome::Unsettled(job_id.clone()),
                }
            }
        };

        if self.cfg.delete_documents
            && matches!(outcome, JobOutcome::Finished(_) | JobOutcome::Failed(_))
        {
            remove_document(&job_id, &record.document_ref).await;
        }

        outcome
    }

    /// Retries transient store failures with backoff. `None` once the budget
    /// is spent or the error is not transient; the failure is logged here.
    async fn write_with_retry<T, F, Fut>(&self, op: &str, job_id: &JobId, mut f: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut rng = StdRng::from_entropy();
        let mut attempt: u32 = 1;
        loop {
            match f().await {
                Ok(v) => return Some(v),
                Err(e) if e.is_transient() && attempt < self.cfg.write_retry.max_attempts => {
                    let delay = next_delay(attempt, &self.cfg.write_retry, &mut rng);
                    warn!(
                        job_id = %job_id,
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store write failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        job_id = %job_id,
                        op,
                        attempts = attempt,
                        error = %e,
                        "store write abandoned, record left at last durable state"
                    );
                    return None;
                }
            }
        }
    }

    async fn slot_loop(&self, slot_id: String, shutdown: watch::Receiver<bool>) {
        let mut rng = StdRng::from_entropy();
        let mut consecutive_errors: u32 = 0;

        while !stopping(&shutdown) {
            match self.run_once(&slot_id).await {
                Ok(Some(outcome)) => {
                    consecutive_errors = 0;
                    debug!(slot = %slot_id, ?outcome, "slot settled job");
                }
                Ok(None) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    let delay = next_delay(consecutive_errors, &self.cfg.write_retry, &mut rng);
                    warn!(
                        slot = %slot_id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "dequeue failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        debug!(slot = %slot_id, "slot stopped");
    }

    async fn heartbeat_loop(&self, slots: Vec<String>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.heartbeat_interval);
        while !stopping(&shutdown) {
            tokio::select! {
                _ = ticker.tick() => {
                    for slot in &slots {
                        if let Err(e) = self.manager.heartbeat(slot).await {
                            warn!(slot = %slot, error = %e, "heartbeat failed");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        for slot in &slots {
            if let Err(e) = self.manager.deregister_worker(slot).await {
                warn!(slot = %slot, error = %e, "could not deregister slot");
            }
        }
    }

    async fn recovery_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.recovery_interval);
        while !stopping(&shutdown) {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.manager.recover(self.cfg.stale_after, self.cfg.max_retries).await {
                        Ok(report) if !report.is_empty() => info!(
                            requeued = report.requeued,
                            failed = report.failed,
                            repushed = report.repushed,
                            reclaimed = report.reclaimed,
                            "recovery sweep"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "recovery sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

async fn remove_document(job_id: &JobId, document_ref: &str) {
    match tokio::fs::remove_file(document_ref).await {
        Ok(()) => debug!(job_id = %job_id, document_ref, "document removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(job_id = %job_id, document_ref, error = %e, "could not remove document"),
    }
}
