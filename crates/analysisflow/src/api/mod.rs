use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};

use crate::api::models::{AnalyzeRequest, CancelResponse, ErrorBody, JobLinks, SubmitResponse};
use crate::jobs::error::QueueError;
use crate::jobs::manager::QueueManager;
use crate::jobs::model::{JobId, JobResult, JobStatus, JobStatusView, QueueStats};

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub manager: QueueManager,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/analyze", post(submit_analysis))
        .route("/jobs/:id", delete(cancel_job))
        .route("/jobs/:id/status", get(job_status))
        .route("/jobs/:id/result", get(job_result))
        .route("/queue/stats", get(queue_stats))
        // Metrics
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

/// Maps queue errors onto HTTP replies.
#[derive(Debug)]
pub struct ApiError(pub QueueError);

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = match &self.0 {
            QueueError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            QueueError::NotReady { status, .. } => (StatusCode::ACCEPTED, Some(*status)),
            QueueError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, None),
            QueueError::InvalidInput(_) => (StatusCode::BAD_REQUEST, None),
            QueueError::InvalidTransition { .. } => (StatusCode::CONFLICT, None),
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            status,
        };
        (code, Json(body)).into_response()
    }
}

pub async fn submit_analysis(
    State(state): State<ApiState>,
    Json(body): Json<AnalyzeRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let job_id = state
        .manager
        .submit(&body.document_ref, &body.query)
        .await?;

    let links = JobLinks::for_job(&job_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Queued,
            links,
        }),
    ))
}

pub async fn job_status(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<JobStatusView>, ApiError> {
    let view = state.manager.get_status(&JobId::from(id)).await?;
    Ok(Json(view))
}

pub async fn job_result(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<JobResult>, ApiError> {
    let result = state.manager.get_result(&JobId::from(id)).await?;
    Ok(Json(result))
}

pub async fn cancel_job(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job_id = JobId::from(id);
    let cancelled = state.manager.cancel(&job_id).await?;
    Ok(Json(CancelResponse { job_id, cancelled }))
}

pub async fn queue_stats(State(state): State<ApiState>) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.manager.stats().await?))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    match state.manager.stats().await {
        Ok(stats) => (StatusCode::OK, render_prometheus(&stats)).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("metrics error: {e}"),
        )
            .into_response(),
    }
}

/// Minimal Prometheus text exposition of a stats snapshot.
pub fn render_prometheus(stats: &QueueStats) -> String {
    let q = &stats.queue_name;
    format!(
        concat!(
            "# HELP analysisflow_queued_jobs Jobs waiting in the fast queue\n",
            "# TYPE analysisflow_queued_jobs gauge\n",
            "analysisflow_queued_jobs{{queue=\"{q}\"}} {}\n",
            "# HELP analysisflow_active_jobs Jobs currently started or processing\n",
            "# TYPE analysisflow_active_jobs gauge\n",
            "analysisflow_active_jobs{{queue=\"{q}\"}} {}\n",
            "# HELP analysisflow_finished_jobs Jobs finished within the result TTL\n",
            "# TYPE analysisflow_finished_jobs gauge\n",
            "analysisflow_finished_jobs{{queue=\"{q}\"}} {}\n",
            "# HELP analysisflow_failed_jobs Jobs failed within the result TTL\n",
            "# TYPE analysisflow_failed_jobs gauge\n",
            "analysisflow_failed_jobs{{queue=\"{q}\"}} {}\n",
            "# HELP analysisflow_workers Worker slots with a recent heartbeat\n",
            "# TYPE analysisflow_workers gauge\n",
            "analysisflow_workers{{queue=\"{q}\"}} {}\n"
        ),
        stats.queued_jobs,
        stats.active_jobs,
        stats.finished_jobs,
        stats.failed_jobs,
        stats.workers,
        q = q,
    )
}

pub async fn health(State(state): State<ApiState>) -> Response {
    let report = state.manager.health().await;
    let code = if report.ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}
