#![allow(dead_code)]

use analysisflow::jobs::retry::RetryConfig;
use analysisflow::jobs::{
    AnalysisOutput, Analyzer, ErrorCode, ExecutionError, JobId, QueueManager, QueueSettings,
    WorkerConfig,
};
use analysisflow::stores::{MemoryFastQueue, MemoryJobStore};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const QUEUE: &str = "document_analysis_test";

pub struct Harness {
    pub manager: QueueManager,
    pub durable: MemoryJobStore,
    pub fast: MemoryFastQueue,
}

pub fn memory_harness() -> Harness {
    let durable = MemoryJobStore::new();
    let fast = MemoryFastQueue::new();
    let manager = QueueManager::new(
        Arc::new(durable.clone()),
        Arc::new(fast.clone()),
        QueueSettings::new(QUEUE, Duration::from_secs(3_600)),
    );
    Harness {
        manager,
        durable,
        fast,
    }
}

pub fn worker_config(max_retries: u32) -> WorkerConfig {
    WorkerConfig {
        worker_id: "test-worker".to_string(),
        concurrency: 1,
        job_timeout: Duration::from_secs(5),
        max_retries,
        poll_wait: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(20),
        write_retry: RetryConfig {
            max_attempts: 6,
            base_ms: 10,
            max_ms: 50,
            jitter_pct: 0.0,
        },
        delete_documents: false,
        stale_after: Duration::from_secs(600),
        recovery_interval: Duration::from_secs(600),
    }
}

/// Succeeds with a fixed analysis and records every job it saw.
#[derive(Default)]
pub struct EchoAnalyzer {
    pub seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Analyzer for EchoAnalyzer {
    async fn analyze(
        &self,
        document_ref: &str,
        query: &str,
    ) -> Result<AnalysisOutput, ExecutionError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(document_ref.to_string());
        }
        tokio::task::yield_now().await;
        Ok(AnalysisOutput::new(format!("analysis of {document_ref}: {query}"))
            .with_meta("pages", 3))
    }
}

/// Fails every call with the same code.
pub struct FailingAnalyzer {
    pub code: ErrorCode,
    pub calls: AtomicU32,
}

impl FailingAnalyzer {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for FailingAnalyzer {
    async fn analyze(
        &self,
        _document_ref: &str,
        _query: &str,
    ) -> Result<AnalysisOutput, ExecutionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(ExecutionError::new(self.code, format!("attempt {n} failed")))
    }
}

/// Never returns within any reasonable timeout.
pub struct StuckAnalyzer;

#[async_trait]
impl Analyzer for StuckAnalyzer {
    async fn analyze(
        &self,
        _document_ref: &str,
        _query: &str,
    ) -> Result<AnalysisOutput, ExecutionError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(AnalysisOutput::new("too late"))
    }
}

pub fn job_id_of(s: &str) -> JobId {
    JobId::from(s)
}

/// Shared Postgres for store tests. `None` when `TEST_DATABASE_URL` is unset.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let url = std::env::var("TEST_DATABASE_URL").ok()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE analysis_jobs")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}
