// crates/analysisflow/src/stores/pg.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::jobs::model::{JobId, JobPatch, JobRecord, JobStatus};
use crate::stores::{DurableStore, StoreError, StoreResult};

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: String,
    query: String,
    document_ref: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<Value>,
    retry_count: i32,
    worker_id: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(StoreError::Corrupt)?;

        Ok(JobRecord {
            job_id: JobId::from(row.job_id),
            query: row.query,
            document_ref: row.document_ref,
            status,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            result: row.result.map(serde_json::from_value).transpose()?,
            error: row.error.map(serde_json::from_value).transpose()?,
            retry_count: row.retry_count,
            worker_id: row.worker_id,
            updated_at: row.updated_at,
        })
    }
}

const JOB_COLUMNS: &str = r#"
    job_id, query, document_ref, status,
    created_at, started_at, completed_at,
    result, error, retry_count, worker_id, updated_at
"#;

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DurableStore for PgJobStore {
    async fn insert(&self, record: &JobRecord) -> StoreResult<()> {
        let result = record.result.as_ref().map(serde_json::to_value).transpose()?;
        let error = record.error.as_ref().map(serde_json::to_value).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO analysis_jobs (
                job_id, query, document_ref, status,
                created_at, started_at, completed_at,
                result, error, retry_count, worker_id, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.job_id.as_str())
        .bind(&record.query)
        .bind(&record.document_ref)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(result)
        .bind(error)
        .bind(record.retry_count)
        .bind(record.worker_id.as_deref())
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_fields(
        &self,
        job_id: &JobId,
        patch: &JobPatch,
    ) -> StoreResult<Option<JobRecord>> {
        let expect: Vec<String> = patch
            .expect_status
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let result = patch.result.as_ref().map(serde_json::to_value).transpose()?;
        let error = patch.error.as_ref().map(serde_json::to_value).transpose()?;

        // One statement: the row lock taken by UPDATE makes the
        // precondition check and the write a single atomic step.
        let sql = format!(
            r#"
            UPDATE analysis_jobs
            SET status = COALESCE($2, status),
                started_at = CASE
                    WHEN $3::timestamptz IS NULL OR started_at IS NOT NULL THEN started_at
                    ELSE GREATEST($3::timestamptz, created_at)
                END,
                completed_at = CASE
                    WHEN $4::timestamptz IS NULL OR completed_at IS NOT NULL THEN completed_at
                    ELSE GREATEST($4::timestamptz, COALESCE(started_at, created_at))
                END,
                result = COALESCE($5, result),
                error = COALESCE($6, error),
                retry_count = COALESCE($7, retry_count),
                worker_id = COALESCE($8, worker_id),
                updated_at = GREATEST(now(), updated_at)
            WHERE job_id = $1
              AND status = ANY($9)
              AND ($10::int IS NULL OR retry_count = $10)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_str())
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.started_at)
            .bind(patch.completed_at)
            .bind(result)
            .bind(error)
            .bind(patch.retry_count)
            .bind(patch.worker_id.as_deref())
            .bind(expect)
            .bind(patch.expect_retry_count)
            .fetch_optional(&self.pool)
            .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE job_id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn list_by_status(
        &self,
        statuses: &[JobStatus],
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<JobRecord>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM analysis_jobs
            WHERE status = ANY($1)
              AND updated_at < $2
            ORDER BY updated_at ASC, job_id ASC
            LIMIT $3
            "#
        );

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(statuses)
            .bind(updated_before)
            .bind(limit.clamp(1, 1_000))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
