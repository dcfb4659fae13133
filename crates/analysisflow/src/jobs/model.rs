// crates/analysisflow/src/jobs/model.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque job identifier. New ids are random v4 UUIDs; lookups accept any
/// string so an unknown id is reported as not found rather than malformed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Processing,
    Finished,
    Failed,
}

impl JobStatus {
    pub const IN_FLIGHT: [JobStatus; 2] = [JobStatus::Started, JobStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Processing => "processing",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// Position along the lifecycle; both terminal states share the last one.
    pub fn stage(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Started => 1,
            JobStatus::Processing => 2,
            JobStatus::Finished | JobStatus::Failed => 3,
        }
    }

    /// Forward edges of the lifecycle. The retry re-enqueue edge
    /// (`started|processing -> queued`) is deliberately not listed here; it
    /// is only reachable through `JobPatch::requeue`.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Started)
                | (Queued, Failed)
                | (Started, Processing)
                | (Started, Finished)
                | (Started, Failed)
                | (Processing, Finished)
                | (Processing, Failed)
        )
    }

    /// Statuses from which a move to `next` is legal.
    pub fn predecessors_of(next: JobStatus) -> Vec<JobStatus> {
        [
            JobStatus::Queued,
            JobStatus::Started,
            JobStatus::Processing,
            JobStatus::Finished,
            JobStatus::Failed,
        ]
        .into_iter()
        .filter(|s| s.can_advance_to(next))
        .collect()
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "started" => Ok(JobStatus::Started),
            "processing" => Ok(JobStatus::Processing),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Success payload returned by the analysis collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AnalysisOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Structured failure stored on a terminally failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
    /// Total attempts made when the job failed (0 if it never ran).
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub query: String,
    pub document_ref: String,
    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub result: Option<AnalysisOutput>,
    pub error: Option<JobFailure>,
    pub retry_count: i32,
    pub worker_id: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new_queued(document_ref: &str, query: &str, now: DateTime<Utc>) -> Self {
        Self {
            job_id: JobId::generate(),
            query: query.to_string(),
            document_ref: document_ref.to_string(),
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            worker_id: None,
            updated_at: now,
        }
    }

    /// Monotonic revision of the record. A retry bumps `retry_count`, so the
    /// `-> queued` edge still moves the rank forward.
    pub fn cache_rank(&self) -> i64 {
        i64::from(self.retry_count.max(0)) * 4 + i64::from(self.status.stage())
    }

    /// Attempt number of the run that is (or would be) in progress.
    pub fn attempt_no(&self) -> u32 {
        self.retry_count.max(0) as u32 + 1
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.job_id.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.as_ref().map(|e| e.message.clone()),
            retry_count: self.retry_count,
            position: None,
        }
    }

    /// `None` while the job is still in flight.
    pub fn result_view(&self) -> Option<JobResult> {
        match self.status {
            JobStatus::Finished => {
                let output = self.result.clone().unwrap_or_default();
                Some(JobResult {
                    job_id: self.job_id.clone(),
                    status: ResultStatus::Success,
                    analysis: Some(output.text),
                    metadata: Some(output.metadata),
                    error: None,
                })
            }
            JobStatus::Failed => Some(JobResult {
                job_id: self.job_id.clone(),
                status: ResultStatus::Error,
                analysis: None,
                metadata: None,
                error: Some(
                    self.error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| "job failed".to_string()),
                ),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: i32,
    /// Zero-based place in the queue; only set while the job is queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued_jobs: u64,
    pub active_jobs: u64,
    pub finished_jobs: u64,
    pub failed_jobs: u64,
    pub workers: u64,
    pub worker_names: Vec<String>,
    pub queue_name: String,
}

/// Partial, conditional update of a job record.
///
/// The update applies only if the stored status is one of `expect_status`
/// (and, when set, `retry_count == expect_retry_count`). Timestamps are
/// write-once: a value is only stored if the field is still null, clamped so
/// that `created_at <= started_at <= completed_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub expect_status: Vec<JobStatus>,
    pub expect_retry_count: Option<i32>,

    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<AnalysisOutput>,
    pub error: Option<JobFailure>,
    pub retry_count: Option<i32>,
    pub worker_id: Option<String>,
}

impl JobPatch {
    pub fn start(worker_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            expect_status: JobStatus::predecessors_of(JobStatus::Started),
            status: Some(JobStatus::Started),
            started_at: Some(at),
            worker_id: Some(worker_id.to_string()),
            ..Default::default()
        }
    }

    pub fn processing() -> Self {
        Self {
            expect_status: JobStatus::predecessors_of(JobStatus::Processing),
            status: Some(JobStatus::Processing),
            ..Default::default()
        }
    }

    pub fn finish(output: AnalysisOutput, at: DateTime<Utc>) -> Self {
        Self {
            expect_status: JobStatus::predecessors_of(JobStatus::Finished),
            status: Some(JobStatus::Finished),
            completed_at: Some(at),
            result: Some(output),
            ..Default::default()
        }
    }

    pub fn fail(failure: JobFailure, at: DateTime<Utc>) -> Self {
        Self {
            expect_status: JobStatus::predecessors_of(JobStatus::Failed),
            status: Some(JobStatus::Failed),
            completed_at: Some(at),
            error: Some(failure),
            ..Default::default()
        }
    }

    /// Failure of a job that never left the queue (cancel, enqueue failure).
    pub fn fail_queued(failure: JobFailure, at: DateTime<Utc>) -> Self {
        Self {
            expect_status: vec![JobStatus::Queued],
            ..Self::fail(failure, at)
        }
    }

    /// Retry re-enqueue: back to `queued` with one more attempt consumed.
    pub fn requeue(expected_retry_count: i32) -> Self {
        Self {
            expect_status: JobStatus::IN_FLIGHT.to_vec(),
            expect_retry_count: Some(expected_retry_count),
            status: Some(JobStatus::Queued),
            retry_count: Some(expected_retry_count + 1),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.expect_status.contains(&record.status)
            && self
                .expect_retry_count
                .map_or(true, |n| n == record.retry_count)
    }

    /// In-process equivalent of the conditional SQL update.
    pub fn apply(&self, record: &mut JobRecord, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(at) = self.started_at {
            if record.started_at.is_none() {
                record.started_at = Some(at.max(record.created_at));
            }
        }
        if let Some(at) = self.completed_at {
            if record.completed_at.is_none() {
                let floor = record.started_at.unwrap_or(record.created_at);
                record.completed_at = Some(at.max(floor));
            }
        }
        if let Some(result) = &self.result {
            record.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            record.error = Some(error.clone());
        }
        if let Some(n) = self.retry_count {
            record.retry_count = n;
        }
        if let Some(w) = &self.worker_id {
            record.worker_id = Some(w.clone());
        }
        record.updated_at = now.max(record.updated_at);
    }
}

/// Outcome of a worker-side status write.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The write went through; carries the updated record.
    Applied(JobRecord),
    /// The record was already past this point (duplicate call or lost race).
    Unchanged(JobRecord),
}

impl Transition {
    pub fn record(&self) -> &JobRecord {
        match self {
            Transition::Applied(r) | Transition::Unchanged(r) => r,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn terminal_states_have_no_successors() {
        for next in [
            JobStatus::Queued,
            JobStatus::Started,
            JobStatus::Processing,
            JobStatus::Finished,
            JobStatus::Failed,
        ] {
            assert!(!JobStatus::Finished.can_advance_to(next));
            assert!(!JobStatus::Failed.can_advance_to(next));
        }
    }

    #[test]
    fn timestamps_are_write_once_and_clamped() {
        let t0 = Utc::now();
        let mut rec = JobRecord::new_queued("report.pdf", "key risks", t0);

        // clock went backwards: started_at must not precede created_at
        JobPatch::start("w1", t0 - Duration::seconds(5)).apply(&mut rec, t0);
        assert_eq!(rec.started_at, Some(t0));

        // a second start does not move the timestamp
        rec.status = JobStatus::Queued;
        JobPatch::start("w2", t0 + Duration::seconds(30)).apply(&mut rec, t0);
        assert_eq!(rec.started_at, Some(t0));
        assert_eq!(rec.worker_id.as_deref(), Some("w2"));

        JobPatch::finish(AnalysisOutput::new("ok"), t0 - Duration::seconds(1)).apply(&mut rec, t0);
        assert_eq!(rec.completed_at, Some(t0));
    }

    #[test]
    fn requeue_patch_requires_matching_retry_count() {
        let mut rec = JobRecord::new_queued("a.pdf", "q", Utc::now());
        rec.status = JobStatus::Processing;
        rec.retry_count = 1;

        assert!(!JobPatch::requeue(0).matches(&rec));
        assert!(JobPatch::requeue(1).matches(&rec));
    }

    #[test]
    fn cache_rank_only_moves_forward_along_the_lifecycle() {
        let mut rec = JobRecord::new_queued("a.pdf", "q", Utc::now());
        let mut ranks = vec![rec.cache_rank()];

        for status in [JobStatus::Started, JobStatus::Processing] {
            rec.status = status;
            ranks.push(rec.cache_rank());
        }
        JobPatch::requeue(0).apply(&mut rec, Utc::now());
        ranks.push(rec.cache_rank());
        rec.status = JobStatus::Finished;
        ranks.push(rec.cache_rank());

        assert!(ranks.windows(2).all(|w| w[0] < w[1]), "{ranks:?}");
    }

    #[test]
    fn failed_result_view_never_has_empty_error() {
        let mut rec = JobRecord::new_queued("a.pdf", "q", Utc::now());
        rec.status = JobStatus::Failed;
        rec.error = Some(JobFailure {
            code: "UNKNOWN".into(),
            message: "  ".into(),
            attempts: 1,
        });

        let view = rec.result_view().unwrap();
        assert_eq!(view.status, ResultStatus::Error);
        assert_eq!(view.error.as_deref(), Some("job failed"));
    }
}
