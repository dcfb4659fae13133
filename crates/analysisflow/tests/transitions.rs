mod common;

use analysisflow::jobs::{
    AnalysisOutput, JobFailure, JobStatus, QueueError, Transition,
};
use analysisflow::stores::DurableStore;
use common::memory_harness;
use std::time::Duration;

const WAIT: Duration = Duration::from_millis(10);

fn failure(msg: &str) -> JobFailure {
    JobFailure {
        code: "DEPENDENCY_DOWN".into(),
        message: msg.into(),
        attempts: 1,
    }
}

#[tokio::test]
async fn lifecycle_sets_each_timestamp_once_in_order() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();
    h.manager.dequeue(WAIT).await.unwrap().unwrap();

    let started = h.manager.mark_started(&job_id, "w-0").await.unwrap();
    assert!(started.applied());
    assert_eq!(started.record().status, JobStatus::Started);
    assert_eq!(started.record().worker_id.as_deref(), Some("w-0"));

    let processing = h.manager.mark_processing(&job_id).await.unwrap();
    assert_eq!(processing.record().status, JobStatus::Processing);
    assert_eq!(processing.record().started_at, started.record().started_at);

    let done = h
        .manager
        .mark_finished(&job_id, AnalysisOutput::new("three risks"))
        .await
        .unwrap();
    let rec = done.record();
    assert_eq!(rec.status, JobStatus::Finished);

    let started_at = rec.started_at.unwrap();
    let completed_at = rec.completed_at.unwrap();
    assert!(rec.created_at <= started_at);
    assert!(started_at <= completed_at);
    assert!(rec.result.is_some());
    assert!(rec.error.is_none());
}

#[tokio::test]
async fn mark_finished_twice_is_a_no_op() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();
    h.manager.mark_started(&job_id, "w-0").await.unwrap();

    let output = AnalysisOutput::new("three risks").with_meta("pages", 12);
    let first = h.manager.mark_finished(&job_id, output.clone()).await.unwrap();
    assert!(first.applied());
    let after_first = h.durable.get(&job_id).await.unwrap().unwrap();

    let second = h.manager.mark_finished(&job_id, output).await.unwrap();
    assert!(matches!(second, Transition::Unchanged(_)));
    let after_second = h.durable.get(&job_id).await.unwrap().unwrap();

    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn terminal_state_is_final() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();
    h.manager.mark_started(&job_id, "w-0").await.unwrap();
    h.manager
        .mark_failed(&job_id, failure("backend down"))
        .await
        .unwrap();
    let frozen = h.durable.get(&job_id).await.unwrap().unwrap();

    let again = h
        .manager
        .mark_finished(&job_id, AnalysisOutput::new("late result"))
        .await
        .unwrap();
    assert!(!again.applied());

    let restarted = h.manager.mark_started(&job_id, "w-1").await.unwrap();
    assert!(!restarted.applied());

    let requeued = h.manager.requeue_for_retry(&job_id, 0).await.unwrap();
    assert!(!requeued.applied());

    assert!(!h.manager.mark_processing(&job_id).await.unwrap().applied());
    assert!(!h.manager.cancel(&job_id).await.unwrap());

    let now = h.durable.get(&job_id).await.unwrap().unwrap();
    assert_eq!(now, frozen);
    assert_eq!(now.status, JobStatus::Failed);
}

#[tokio::test]
async fn finishing_a_queued_job_is_rejected() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();

    let err = h
        .manager
        .mark_finished(&job_id, AnalysisOutput::new("skipped ahead"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::InvalidTransition {
            from: JobStatus::Queued,
            to: JobStatus::Finished,
            ..
        }
    ));
}

#[tokio::test]
async fn mark_started_on_unknown_job_is_not_found() {
    let h = memory_harness();
    let err = h
        .manager
        .mark_started(&common::job_id_of("missing"), "w-0")
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));
}

#[tokio::test]
async fn only_one_caller_wins_mark_started() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();

    let a = h.manager.mark_started(&job_id, "w-a").await.unwrap();
    let b = h.manager.mark_started(&job_id, "w-b").await.unwrap();
    assert!(a.applied());
    assert!(!b.applied());
    assert_eq!(b.record().worker_id.as_deref(), Some("w-a"));
}

#[tokio::test]
async fn requeue_consumes_one_retry_and_pushes_again() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();
    let rec = h.manager.dequeue(WAIT).await.unwrap().unwrap();
    h.manager.mark_started(&job_id, "w-0").await.unwrap();

    let t = h
        .manager
        .requeue_for_retry(&job_id, rec.retry_count)
        .await
        .unwrap();
    assert!(t.applied());
    assert_eq!(t.record().status, JobStatus::Queued);
    assert_eq!(t.record().retry_count, 1);

    // a duplicate requeue for the same attempt does nothing
    let dup = h.manager.requeue_for_retry(&job_id, 0).await.unwrap();
    assert!(!dup.applied());

    let again = h.manager.dequeue(WAIT).await.unwrap().unwrap();
    assert_eq!(again.job_id, job_id);
    assert_eq!(again.retry_count, 1);
    assert!(h.manager.dequeue(WAIT).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_status_view_carries_the_message() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();
    h.manager.mark_started(&job_id, "w-0").await.unwrap();
    h.manager
        .mark_failed(&job_id, failure("backend down"))
        .await
        .unwrap();

    let status = h.manager.get_status(&job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.error.as_deref(), Some("backend down"));
    assert!(status.completed_at.is_some());
}
