mod common;

use analysisflow::jobs::{
    AnalysisOutput, ErrorCode, JobStatus, QueueError, ResultStatus, Worker,
};
use analysisflow::stores::{DurableStore, FastQueue};
use common::{memory_harness, worker_config, EchoAnalyzer, FailingAnalyzer, QUEUE};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_millis(10);

#[tokio::test]
async fn cancel_removes_a_queued_job() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();

    assert!(h.manager.cancel(&job_id).await.unwrap());
    assert_eq!(h.fast.len().await.unwrap(), 0);

    let rec = h.durable.get(&job_id).await.unwrap().unwrap();
    assert_eq!(rec.status, JobStatus::Failed);
    assert_eq!(rec.error.as_ref().unwrap().code, "CANCELLED");

    let result = h.manager.get_result(&job_id).await.unwrap();
    assert_eq!(result.status, ResultStatus::Error);
    assert!(!result.error.unwrap().is_empty());

    // second cancel is a no-op
    assert!(!h.manager.cancel(&job_id).await.unwrap());
}

#[tokio::test]
async fn cancel_after_dequeue_returns_false() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();
    h.manager.dequeue(WAIT).await.unwrap().unwrap();

    // popped but not yet started: no longer cancellable
    assert!(!h.manager.cancel(&job_id).await.unwrap());

    h.manager.mark_started(&job_id, "w-0").await.unwrap();
    assert!(!h.manager.cancel(&job_id).await.unwrap());
    assert_eq!(
        h.durable.get(&job_id).await.unwrap().unwrap().status,
        JobStatus::Started
    );
}

#[tokio::test]
async fn cancel_unknown_job_is_not_found() {
    let h = memory_harness();
    assert!(matches!(
        h.manager.cancel(&common::job_id_of("missing")).await,
        Err(QueueError::NotFound(_))
    ));
}

#[tokio::test]
async fn stats_reflect_queue_and_registries() {
    let h = memory_harness();
    let ok = Worker::new(h.manager.clone(), Arc::new(EchoAnalyzer::default()), worker_config(3));
    let bad = Worker::new(
        h.manager.clone(),
        Arc::new(FailingAnalyzer::new(ErrorCode::BadDocument)),
        worker_config(3),
    );

    h.manager.submit("a.pdf", "q").await.unwrap();
    h.manager.submit("b.pdf", "q").await.unwrap();
    h.manager.submit("c.pdf", "q").await.unwrap();
    h.manager.submit("d.pdf", "q").await.unwrap();

    ok.run_once("slot-0").await.unwrap().unwrap();
    bad.run_once("slot-1").await.unwrap().unwrap();
    let in_flight = h.manager.dequeue(WAIT).await.unwrap().unwrap();
    h.manager
        .mark_started(&in_flight.job_id, "slot-2")
        .await
        .unwrap();
    h.manager.heartbeat("slot-0").await.unwrap();
    h.manager.heartbeat("slot-1").await.unwrap();

    let stats = h.manager.stats().await.unwrap();
    assert_eq!(stats.queued_jobs, 1);
    assert_eq!(stats.active_jobs, 1);
    assert_eq!(stats.finished_jobs, 1);
    assert_eq!(stats.failed_jobs, 1);
    assert_eq!(stats.workers, 2);
    assert_eq!(stats.worker_names, vec!["slot-0", "slot-1"]);
    assert_eq!(stats.queue_name, QUEUE);

    h.manager.deregister_worker("slot-1").await.unwrap();
    let stats = h.manager.stats().await.unwrap();
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.worker_names, vec!["slot-0"]);
}

#[tokio::test]
async fn recovery_requeues_jobs_of_lost_workers() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();
    h.manager.dequeue(WAIT).await.unwrap().unwrap();
    h.manager.mark_started(&job_id, "w-crashed").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = h.manager.recover(Duration::ZERO, 3).await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.failed, 0);

    let rec = h.durable.get(&job_id).await.unwrap().unwrap();
    assert_eq!(rec.status, JobStatus::Queued);
    assert_eq!(rec.retry_count, 1);
    assert!(h.fast.contains(&job_id).await.unwrap());

    // picked up again and completed
    let worker = Worker::new(h.manager.clone(), Arc::new(EchoAnalyzer::default()), worker_config(3));
    worker.run_once("slot-0").await.unwrap().unwrap();
    assert_eq!(
        h.manager.get_status(&job_id).await.unwrap().status,
        JobStatus::Finished
    );
}

#[tokio::test]
async fn recovery_fails_lost_jobs_without_budget() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();
    h.manager.dequeue(WAIT).await.unwrap().unwrap();
    h.manager.mark_started(&job_id, "w-crashed").await.unwrap();
    h.manager.mark_processing(&job_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = h.manager.recover(Duration::ZERO, 0).await.unwrap();
    assert_eq!(report.failed, 1);

    let rec = h.durable.get(&job_id).await.unwrap().unwrap();
    assert_eq!(rec.status, JobStatus::Failed);
    let error = rec.error.unwrap();
    assert_eq!(error.code, "WORKER_LOST");
    assert!(error.message.contains("w-crashed"));
}

#[tokio::test]
async fn recovery_leaves_fresh_jobs_alone() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();
    h.manager.dequeue(WAIT).await.unwrap().unwrap();
    h.manager.mark_started(&job_id, "w-0").await.unwrap();

    let report = h.manager.recover(Duration::from_secs(600), 3).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(
        h.durable.get(&job_id).await.unwrap().unwrap().status,
        JobStatus::Started
    );
}

#[tokio::test]
async fn recovery_repushes_queued_jobs_lost_by_the_queue() {
    let h = memory_harness();
    let kept = h.manager.submit("a.pdf", "q").await.unwrap();
    let lost = h.manager.submit("b.pdf", "q").await.unwrap();
    assert!(h.fast.remove(&lost).await.unwrap());
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = h.manager.recover(Duration::ZERO, 3).await.unwrap();
    assert_eq!(report.repushed, 1);
    assert_eq!(h.fast.len().await.unwrap(), 2);
    assert!(h.fast.contains(&kept).await.unwrap());
    assert!(h.fast.contains(&lost).await.unwrap());
}

#[tokio::test]
async fn claimed_entry_of_a_consumer_that_died_is_reclaimed() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();

    // popped, then the consumer vanished before mark_started
    assert_eq!(h.fast.pop(WAIT).await.unwrap(), Some(job_id.clone()));
    assert_eq!(h.fast.len().await.unwrap(), 0);
    assert_eq!(h.fast.unacked().await.unwrap(), vec![job_id.clone()]);

    let report = h.manager.recover(Duration::from_secs(600), 3).await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.repushed, 0);
    assert!(h.fast.unacked().await.unwrap().is_empty());
    assert_eq!(h.fast.len().await.unwrap(), 1);

    let worker = Worker::new(h.manager.clone(), Arc::new(EchoAnalyzer::default()), worker_config(3));
    assert_eq!(
        worker.run_once("slot-0").await.unwrap(),
        Some(analysisflow::jobs::JobOutcome::Finished(job_id))
    );
    assert!(h.fast.unacked().await.unwrap().is_empty());
}

#[tokio::test]
async fn started_jobs_leave_no_claim_behind() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();
    h.manager.dequeue(WAIT).await.unwrap().unwrap();
    assert!(h.fast.contains(&job_id).await.unwrap());

    h.manager.mark_started(&job_id, "w-0").await.unwrap();
    assert!(h.fast.unacked().await.unwrap().is_empty());
    assert!(h.manager.recover(Duration::from_secs(600), 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn stale_queue_entries_are_dropped_on_dequeue() {
    let h = memory_harness();
    let job_id = h.manager.submit("report.pdf", "key risks").await.unwrap();
    h.fast.push(&job_id).await.unwrap();

    let first = h.manager.dequeue(WAIT).await.unwrap().unwrap();
    assert_eq!(first.job_id, job_id);
    h.manager.mark_started(&job_id, "w-0").await.unwrap();
    h.manager
        .mark_finished(&job_id, AnalysisOutput::new("done"))
        .await
        .unwrap();

    assert!(h.manager.dequeue(WAIT).await.unwrap().is_none());
    assert_eq!(h.fast.len().await.unwrap(), 0);
    assert!(h.fast.unacked().await.unwrap().is_empty());
}

#[tokio::test]
async fn health_reports_each_backend() {
    let h = memory_harness();
    assert!(h.manager.health().await.ok());

    h.fast.set_available(false);
    let report = h.manager.health().await;
    assert!(report.durable_store);
    assert!(!report.fast_queue);
    assert!(!report.ok());
}
