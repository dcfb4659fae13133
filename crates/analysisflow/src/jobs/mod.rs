pub mod analysis;
pub mod error;
pub mod error_codes;
pub mod manager;
pub mod model;
pub mod retry;
pub mod worker;

pub use analysis::{Analyzer, CommandAnalyzer, ExecutionError};
pub use error::QueueError;
pub use error_codes::{ErrorClass, ErrorCode};
pub use manager::{AttemptOutcome, HealthReport, QueueManager, QueueSettings, RecoveryReport};
pub use model::{
    AnalysisOutput, JobFailure, JobId, JobRecord, JobResult, JobStatus, JobStatusView, QueueStats,
    ResultStatus, Transition,
};
pub use worker::{JobOutcome, Worker, WorkerConfig};
