//! Filesystem-specific store behaviour.

use std::time::Duration;

use kiln_core::{JobStatus, JobStore, NewJob, StoreError};
use kiln_fs::{FsError, FsJobStore};
use serde_json::json;

fn channels() -> Vec<String> {
    vec!["x86_64".to_string()]
}

#[tokio::test]
async fn test_missing_directory_is_rejected() {
    let result = FsJobStore::open("/non-existent-kiln-directory").await;
    assert!(matches!(result, Err(FsError::Io { .. })));
}

#[tokio::test]
async fn test_corrupt_record_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("4f1cf5f8-525d-46b7-aef4-33c6a919c038.json"),
        b"{invalid json content",
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"not a job").unwrap();

    let store = FsJobStore::open(dir.path()).await.unwrap();
    assert!(store.all_root_job_ids().await.unwrap().is_empty());

    let id = store.enqueue(NewJob::new("build", "x86_64")).await.unwrap();
    assert_eq!(store.all_root_job_ids().await.unwrap(), vec![id]);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_directory_is_locked_while_open() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path()).await.unwrap();

    let second = FsJobStore::open(dir.path()).await;
    assert!(matches!(second, Err(FsError::Locked(_))));

    store.close().await.unwrap();
    let reopened = FsJobStore::open(dir.path()).await.unwrap();
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_dropping_the_store_releases_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    drop(FsJobStore::open(dir.path()).await.unwrap());
    let store = FsJobStore::open(dir.path()).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_lock_file_left_by_a_crash_does_not_block_open() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path()).await.unwrap();
    let id = store.enqueue(NewJob::new("build", "x86_64")).await.unwrap();
    store.close().await.unwrap();

    // A killed process leaves its lock file behind, but not its lock.
    std::fs::write(dir.path().join(".lock"), b"4194304").unwrap();

    let store = FsJobStore::open(dir.path()).await.unwrap();
    assert_eq!(store.all_root_job_ids().await.unwrap(), vec![id]);
    let second = FsJobStore::open(dir.path()).await;
    assert!(matches!(second, Err(FsError::Locked(_))));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_store_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path()).await.unwrap();
    store.close().await.unwrap();

    let result = store.enqueue(NewJob::new("build", "x86_64")).await;
    assert!(matches!(result, Err(StoreError::Unavailable { .. })));
}

#[tokio::test]
async fn test_jobs_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path()).await.unwrap();

    let dep = store.enqueue(NewJob::new("depsolve", "x86_64")).await.unwrap();
    let root = store
        .enqueue(
            NewJob::new("build", "x86_64")
                .with_args(json!({ "image": "ami" }))
                .with_dependencies([dep]),
        )
        .await
        .unwrap();
    let claim = store.dequeue(&channels(), &[]).await.unwrap().unwrap();
    store
        .finish(claim.id, claim.token, json!({ "packages": 412 }))
        .await
        .unwrap();
    store.close().await.unwrap();

    let store = FsJobStore::open(dir.path()).await.unwrap();
    let finished = store.job(dep).await.unwrap();
    assert_eq!(finished.status, JobStatus::Finished);
    assert_eq!(finished.result, Some(json!({ "packages": 412 })));
    assert_eq!(finished.dependants, vec![root]);
    assert_eq!(store.all_root_job_ids().await.unwrap(), vec![root]);

    let claim = store.dequeue(&channels(), &[]).await.unwrap().unwrap();
    assert_eq!(claim.id, root);
    assert_eq!(claim.args, json!({ "image": "ami" }));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_lease_age_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path()).await.unwrap();
    let id = store.enqueue(NewJob::new("build", "x86_64")).await.unwrap();
    store.dequeue(&channels(), &[]).await.unwrap().unwrap();
    store.close().await.unwrap();

    // The worker died with the old process; its lease keeps ageing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let store = FsJobStore::open(dir.path()).await.unwrap();
    assert!(store
        .requeue_stale(Duration::from_secs(60))
        .await
        .unwrap()
        .is_empty());
    let requeued = store
        .requeue_stale(Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(requeued, vec![id]);

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries, 1);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path()).await.unwrap();
    let id = store.enqueue(NewJob::new("build", "x86_64")).await.unwrap();
    let claim = store.dequeue(&channels(), &[]).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    store.heartbeat(id, claim.token).await.unwrap();
    store.close().await.unwrap();

    let store = FsJobStore::open(dir.path()).await.unwrap();
    assert!(store
        .requeue_stale(Duration::from_millis(150))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(store.id_from_token(claim.token).await.unwrap(), id);
    store.heartbeat(id, claim.token).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_deleted_jobs_leave_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsJobStore::open(dir.path()).await.unwrap();

    let dep = store.enqueue(NewJob::new("depsolve", "x86_64")).await.unwrap();
    let root = store
        .enqueue(NewJob::new("build", "x86_64").with_dependencies([dep]))
        .await
        .unwrap();
    store.delete_job(root).await.unwrap();
    store.close().await.unwrap();

    let leftover: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .filter(|name| name != ".lock")
        .collect();
    assert!(leftover.is_empty(), "unexpected files: {:?}", leftover);
}
