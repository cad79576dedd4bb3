use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::handler::{CancelSignal, JobHandler, JobOutcome};
use kiln_core::job::{Claim, JobStatus, NewJob};
use kiln_core::{Error, JobId};
use kiln_fs::FsJobStore;
use kiln_scheduler::{JobQueue, Worker, WorkerConfig};
use serde_json::json;
use tempfile::TempDir;

const CHANNEL: &str = "x86_64";

async fn setup() -> (JobQueue, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path()).await.unwrap();
    (JobQueue::new(Arc::new(store)), dir)
}

fn config(job_types: &[&str]) -> WorkerConfig {
    WorkerConfig {
        channels: vec![CHANNEL.to_string()],
        job_types: job_types.iter().map(|s| s.to_string()).collect(),
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(10),
    }
}

async fn wait_for_status(queue: &JobQueue, id: JobId, status: JobStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.job(id).await.unwrap().status != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Echoes its arguments back.
struct Echo;

#[async_trait]
impl JobHandler for Echo {
    fn job_type(&self) -> &str {
        "echo"
    }

    async fn run(&self, claim: &Claim, _cancel: CancelSignal) -> JobOutcome {
        JobOutcome::Succeeded(json!({ "echo": claim.args }))
    }
}

/// Fails, or hands the job back, depending on its arguments.
struct Flaky;

#[async_trait]
impl JobHandler for Flaky {
    fn job_type(&self) -> &str {
        "flaky"
    }

    async fn run(&self, claim: &Claim, _cancel: CancelSignal) -> JobOutcome {
        if claim.args["requeue"] == json!(true) {
            JobOutcome::Requeue
        } else {
            JobOutcome::Failed {
                message: "depsolve failed".into(),
            }
        }
    }
}

/// Runs until cancelled.
struct Spin;

#[async_trait]
impl JobHandler for Spin {
    fn job_type(&self) -> &str {
        "spin"
    }

    async fn run(&self, _claim: &Claim, cancel: CancelSignal) -> JobOutcome {
        while !cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        JobOutcome::Failed {
            message: "cancelled".into(),
        }
    }
}

#[tokio::test]
async fn test_worker_finishes_job_with_handler_result() {
    let (queue, _dir) = setup().await;
    let worker = Worker::new("w1", queue.clone(), config(&[])).with_handler(Arc::new(Echo));

    let id = queue
        .enqueue(NewJob::new("echo", CHANNEL).with_args(json!({"n": 1})))
        .await
        .unwrap();

    assert!(worker.run_once().await.unwrap());

    let job = queue.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.result, Some(json!({"echo": {"n": 1}})));
    assert!(!worker.run_once().await.unwrap());

    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_job_is_finished_with_failure_result() {
    let (queue, _dir) = setup().await;
    let worker = Worker::new("w1", queue.clone(), config(&[])).with_handler(Arc::new(Flaky));

    let id = queue.enqueue(NewJob::new("flaky", CHANNEL)).await.unwrap();
    assert!(worker.run_once().await.unwrap());

    let job = queue.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(
        job.result,
        Some(json!({"success": false, "error": "depsolve failed"}))
    );

    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_requeue_outcome_returns_job_to_pending() {
    let (queue, _dir) = setup().await;
    let worker = Worker::new("w1", queue.clone(), config(&[])).with_handler(Arc::new(Flaky));

    let id = queue
        .enqueue(NewJob::new("flaky", CHANNEL).with_args(json!({"requeue": true})))
        .await
        .unwrap();
    assert!(worker.run_once().await.unwrap());

    let job = queue.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries, 1);
    assert!(job.token.is_none());

    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_job_without_handler_is_handed_back() {
    let (queue, _dir) = setup().await;
    let worker =
        Worker::new("w1", queue.clone(), config(&["koji-init"])).with_handler(Arc::new(Echo));

    let id = queue.enqueue(NewJob::new("koji-init", CHANNEL)).await.unwrap();
    assert!(worker.run_once().await.unwrap());

    let job = queue.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries, 1);

    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_worker_only_takes_registered_types() {
    let (queue, _dir) = setup().await;
    let worker = Worker::new("w1", queue.clone(), config(&[])).with_handler(Arc::new(Echo));

    let other = queue.enqueue(NewJob::new("depsolve", CHANNEL)).await.unwrap();
    assert!(!worker.run_once().await.unwrap());
    assert_eq!(queue.job(other).await.unwrap().status, JobStatus::Pending);

    queue.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_reaches_running_handler() {
    let (queue, _dir) = setup().await;
    let worker = Worker::new("w1", queue.clone(), config(&[])).with_handler(Arc::new(Spin));

    let id = queue.enqueue(NewJob::new("spin", CHANNEL)).await.unwrap();
    let running = tokio::spawn(async move { worker.run_once().await });

    wait_for_status(&queue, id, JobStatus::Running).await;
    queue.cancel_job(id).await.unwrap();

    let claimed = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(claimed);

    let job = queue.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert!(job.cancel_requested);
    assert_eq!(job.result, Some(json!({"success": false, "error": "cancelled"})));

    queue.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_lease_drops_the_result() {
    let (queue, _dir) = setup().await;
    let worker = Worker::new("w1", queue.clone(), config(&[])).with_handler(Arc::new(Spin));

    let id = queue.enqueue(NewJob::new("spin", CHANNEL)).await.unwrap();
    let running = tokio::spawn(async move { worker.run_once().await });

    wait_for_status(&queue, id, JobStatus::Running).await;
    assert_eq!(queue.requeue_stale(Duration::ZERO).await.unwrap(), vec![id]);

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let job = queue.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries, 1);
    assert!(job.result.is_none());

    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_run_loop_drains_queue_and_stops_on_shutdown() {
    let (queue, _dir) = setup().await;
    let worker = Worker::new("w1", queue.clone(), config(&[])).with_handler(Arc::new(Echo));

    let first = queue.enqueue(NewJob::new("echo", CHANNEL)).await.unwrap();
    let second = queue
        .enqueue(NewJob::new("echo", CHANNEL).with_dependencies([first]))
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(rx).await });

    wait_for_status(&queue, second, JobStatus::Finished).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(queue.job(first).await.unwrap().status, JobStatus::Finished);
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_run_loop_waits_after_handing_a_job_back() {
    let (queue, _dir) = setup().await;
    let mut slow = config(&[]);
    slow.poll_interval = Duration::from_millis(50);
    let worker = Worker::new("w1", queue.clone(), slow).with_handler(Arc::new(Flaky));

    let id = queue
        .enqueue(NewJob::new("flaky", CHANNEL).with_args(json!({"requeue": true})))
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(rx).await });
    tokio::time::sleep(Duration::from_millis(250)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // One claim per poll interval, not a tight loop.
    let retries = queue.job(id).await.unwrap().retries;
    assert!(retries >= 1, "job was never claimed");
    assert!(retries <= 10, "worker spun through {} retries", retries);

    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_run_refuses_job_types_without_handler() {
    let (queue, _dir) = setup().await;
    let worker =
        Worker::new("w1", queue.clone(), config(&["echo", "koji-init"])).with_handler(Arc::new(Echo));

    let id = queue.enqueue(NewJob::new("koji-init", CHANNEL)).await.unwrap();
    let (_tx, rx) = tokio::sync::watch::channel(false);
    let err = worker.run(rx).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let job = queue.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries, 0);

    queue.close().await.unwrap();
}
