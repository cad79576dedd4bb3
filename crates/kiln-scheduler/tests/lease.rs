use std::sync::Arc;
use std::time::Duration;

use kiln_core::job::{JobStatus, NewJob};
use kiln_fs::FsJobStore;
use kiln_scheduler::{JobQueue, LeaseConfig, LeaseManager};

const CHANNEL: &str = "x86_64";

fn channels() -> Vec<String> {
    vec![CHANNEL.to_string()]
}

async fn setup() -> (JobQueue, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path()).await.unwrap();
    (JobQueue::new(Arc::new(store)), dir)
}

fn lease() -> LeaseConfig {
    LeaseConfig::new(Duration::from_millis(10), Duration::from_millis(40)).unwrap()
}

#[tokio::test]
async fn test_sweep_requeues_expired_lease() {
    let (queue, _dir) = setup().await;
    let manager = LeaseManager::new(queue.clone(), lease(), Duration::from_millis(10));

    let id = queue.enqueue(NewJob::new("depsolve", CHANNEL)).await.unwrap();
    let first = queue.dequeue(&channels(), &[]).await.unwrap().unwrap();

    assert!(manager.sweep_once().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(manager.sweep_once().await.unwrap(), vec![id]);

    let job = queue.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries, 1);

    // The old holder is locked out and the job can be claimed again.
    assert!(queue.heartbeat(id, first.token).await.unwrap_err().is_benign());
    let second = queue.dequeue(&channels(), &[]).await.unwrap().unwrap();
    assert_eq!(second.id, id);
    assert_ne!(second.token, first.token);

    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_heartbeating_job_is_never_swept() {
    let (queue, _dir) = setup().await;
    let config = LeaseConfig::new(Duration::from_millis(10), Duration::from_millis(200)).unwrap();
    let manager = LeaseManager::new(queue.clone(), config, Duration::from_millis(10));

    let id = queue.enqueue(NewJob::new("osbuild", CHANNEL)).await.unwrap();
    let claim = queue.dequeue(&channels(), &[]).await.unwrap().unwrap();

    // Runs well past the expiry, heartbeating every interval.
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.heartbeat(id, claim.token).await.unwrap();
        assert!(manager.sweep_once().await.unwrap().is_empty());
    }

    assert_eq!(queue.job(id).await.unwrap().status, JobStatus::Running);
    queue.close().await.unwrap();
}

#[tokio::test]
async fn test_sweeper_runs_until_shutdown() {
    let (queue, _dir) = setup().await;
    let manager = LeaseManager::new(queue.clone(), lease(), Duration::from_millis(10));

    let id = queue.enqueue(NewJob::new("depsolve", CHANNEL)).await.unwrap();
    queue.dequeue(&channels(), &[]).await.unwrap().unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let sweeper = tokio::spawn(async move { manager.run(rx).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.job(id).await.unwrap().status != JobStatus::Pending {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), sweeper)
        .await
        .unwrap()
        .unwrap();

    queue.close().await.unwrap();
}
