//! Behavioural test suite shared by every [`JobStore`] backend.
//!
//! Backends run it through [`contract_tests!`](crate::contract_tests) from
//! their integration tests. Each case gets a fresh, empty store.
//!
//! A factory that returns `None` skips the case, and a skipped case still
//! counts as passed. The PostgreSQL run skips without `DATABASE_URL`, so a
//! plain `cargo test` only proves the filesystem backend. Row locking and the
//! cascading delete SQL are only exercised with a database, e.g.
//! `DATABASE_URL=postgres://localhost/kiln_test cargo test -p kiln-db`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::job::{GraphDependency, GraphNode, JobStatus, NewJob};
use crate::{JobId, JobStore, LeaseToken, StoreError};

const CHANNEL: &str = "x86_64";

/// Generate one `#[tokio::test]` per contract case.
///
/// `$factory` is an async fn returning `Option<(Arc<dyn JobStore>, G)>`, where
/// `G` keeps backing resources alive for the test. `None` skips the test.
#[macro_export]
macro_rules! contract_tests {
    ($factory:path) => {
        $crate::contract_tests!(@cases $factory;
            enqueue_and_read_back,
            enqueue_rejects_unknown_dependency,
            enqueue_graph_is_all_or_nothing,
            dequeue_on_empty_store_returns_none,
            dequeue_filters_channel_and_type,
            dequeue_is_fifo,
            dependency_ordering,
            concurrent_dequeue_is_exclusive,
            heartbeat_checks_token,
            finish_checks_token_and_rejects_double_finish,
            stale_lease_is_recovered,
            requeue_stale_spares_live_leases,
            explicit_requeue,
            cancel_is_cooperative,
            dequeue_by_id_checks_readiness,
            id_from_token_tracks_current_lease,
            delete_is_idempotent,
            delete_refuses_job_with_dependants,
            delete_keeps_shared_dependency,
            root_tracking_shapes,
            delete_multi_root_graphs,
        );
    };
    (@cases $factory:path; $($name:ident),* $(,)?) => {
        $(
            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn $name() {
                let Some((store, guard)) = $factory().await else {
                    return;
                };
                $crate::contract::$name(store.clone()).await;
                store.close().await.unwrap();
                drop(guard);
            }
        )*
    };
}

fn channels() -> Vec<String> {
    vec![CHANNEL.to_string()]
}

async fn put(store: &dyn JobStore, job_type: &str, deps: &[JobId]) -> JobId {
    store
        .enqueue(
            NewJob::new(job_type, CHANNEL)
                .with_args(json!({ "kind": job_type }))
                .with_dependencies(deps.iter().copied()),
        )
        .await
        .unwrap()
}

async fn claim_one(store: &dyn JobStore) -> (JobId, LeaseToken) {
    let claim = store
        .dequeue(&channels(), &[])
        .await
        .unwrap()
        .expect("a ready job");
    (claim.id, claim.token)
}

async fn finish_ok(store: &dyn JobStore, id: JobId, token: LeaseToken) {
    store
        .finish(id, token, json!({ "success": true }))
        .await
        .unwrap();
}

fn sorted(mut ids: Vec<JobId>) -> Vec<JobId> {
    ids.sort();
    ids
}

pub async fn enqueue_and_read_back(store: Arc<dyn JobStore>) {
    let dep = put(store.as_ref(), "depsolve", &[]).await;
    let id = store
        .enqueue(
            NewJob::new("manifest", "aarch64")
                .with_args(json!({ "distro": "fedora-40" }))
                .with_dependencies([dep, dep]),
        )
        .await
        .unwrap();

    let job = store.job(id).await.unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.job_type, "manifest");
    assert_eq!(job.channel, "aarch64");
    assert_eq!(job.args, json!({ "distro": "fedora-40" }));
    assert_eq!(job.dependencies, vec![dep]);
    assert!(job.dependants.is_empty());
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.result.is_none());
    assert!(job.started_at.is_none());
    assert!(job.finished_at.is_none());
    assert!(job.token.is_none());
    assert!(!job.cancel_requested);
    assert_eq!(job.retries, 0);

    let dep_job = store.job(dep).await.unwrap();
    assert_eq!(dep_job.dependants, vec![id]);

    assert!(matches!(
        store.job(JobId::new()).await,
        Err(StoreError::NotFound(_))
    ));
}

pub async fn enqueue_rejects_unknown_dependency(store: Arc<dyn JobStore>) {
    let ghost = JobId::new();
    let err = store
        .enqueue(NewJob::new("build", CHANNEL).with_dependencies([ghost]))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidDependency(id) if id == ghost));
    assert!(store.all_root_job_ids().await.unwrap().is_empty());
}

pub async fn enqueue_graph_is_all_or_nothing(store: Arc<dyn JobStore>) {
    let ghost = JobId::new();
    let bad = vec![
        GraphNode::new("depsolve", CHANNEL),
        GraphNode::new("build", CHANNEL)
            .depends_on(GraphDependency::Node(0))
            .depends_on(GraphDependency::Existing(ghost)),
    ];
    let err = store.enqueue_graph(bad).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidDependency(id) if id == ghost));
    assert!(store.all_root_job_ids().await.unwrap().is_empty());

    let forward = vec![
        GraphNode::new("build", CHANNEL).depends_on(GraphDependency::Node(1)),
        GraphNode::new("depsolve", CHANNEL),
    ];
    assert!(store.enqueue_graph(forward).await.is_err());
    assert!(store.all_root_job_ids().await.unwrap().is_empty());

    let existing = put(store.as_ref(), "ostree", &[]).await;
    let ids = store
        .enqueue_graph(vec![
            GraphNode::new("depsolve", CHANNEL),
            GraphNode::new("manifest", CHANNEL)
                .depends_on(GraphDependency::Node(0))
                .depends_on(GraphDependency::Existing(existing)),
            GraphNode::new("build", CHANNEL)
                .with_args(json!({ "image": "qcow2" }))
                .depends_on(GraphDependency::Node(1)),
        ])
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);

    let manifest = store.job(ids[1]).await.unwrap();
    assert_eq!(manifest.dependencies, vec![ids[0], existing]);
    assert_eq!(manifest.dependants, vec![ids[2]]);
    assert_eq!(store.all_root_job_ids().await.unwrap(), vec![ids[2]]);
}

pub async fn dequeue_on_empty_store_returns_none(store: Arc<dyn JobStore>) {
    assert!(store.dequeue(&channels(), &[]).await.unwrap().is_none());
}

pub async fn dequeue_filters_channel_and_type(store: Arc<dyn JobStore>) {
    let arm = store
        .enqueue(NewJob::new("build", "aarch64"))
        .await
        .unwrap();
    let depsolve = put(store.as_ref(), "depsolve", &[]).await;

    let none = store
        .dequeue(&["ppc64le".to_string()], &[])
        .await
        .unwrap();
    assert!(none.is_none());

    let claim = store
        .dequeue(&channels(), &["build".to_string()])
        .await
        .unwrap();
    assert!(claim.is_none());

    let claim = store
        .dequeue(&channels(), &["build".to_string(), "depsolve".to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim.id, depsolve);
    assert_eq!(claim.job_type, "depsolve");

    let claim = store
        .dequeue(&["aarch64".to_string(), CHANNEL.to_string()], &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim.id, arm);
    assert_eq!(claim.channel, "aarch64");
}

pub async fn dequeue_is_fifo(store: Arc<dyn JobStore>) {
    let first = put(store.as_ref(), "a", &[]).await;
    let second = put(store.as_ref(), "b", &[]).await;
    let third = put(store.as_ref(), "c", &[]).await;

    assert_eq!(claim_one(store.as_ref()).await.0, first);
    assert_eq!(claim_one(store.as_ref()).await.0, second);
    assert_eq!(claim_one(store.as_ref()).await.0, third);
    assert!(store.dequeue(&channels(), &[]).await.unwrap().is_none());
}

pub async fn dependency_ordering(store: Arc<dyn JobStore>) {
    let a = put(store.as_ref(), "a", &[]).await;
    let b = put(store.as_ref(), "b", &[]).await;
    let c = put(store.as_ref(), "c", &[a, b]).await;

    assert_eq!(store.all_root_job_ids().await.unwrap(), vec![c]);

    let (first, first_token) = claim_one(store.as_ref()).await;
    let (second, second_token) = claim_one(store.as_ref()).await;
    assert_eq!(sorted(vec![first, second]), sorted(vec![a, b]));
    assert!(store.dequeue(&channels(), &[]).await.unwrap().is_none());

    finish_ok(store.as_ref(), first, first_token).await;
    assert!(store.dequeue(&channels(), &[]).await.unwrap().is_none());

    finish_ok(store.as_ref(), second, second_token).await;
    let claim = store.dequeue(&channels(), &[]).await.unwrap().unwrap();
    assert_eq!(claim.id, c);
    assert_eq!(claim.dependencies, vec![a, b]);
    finish_ok(store.as_ref(), c, claim.token).await;

    store.delete_job(c).await.unwrap();
    assert!(store.all_root_job_ids().await.unwrap().is_empty());
    for id in [a, b, c] {
        assert!(matches!(store.job(id).await, Err(StoreError::NotFound(_))));
    }
}

pub async fn concurrent_dequeue_is_exclusive(store: Arc<dyn JobStore>) {
    const JOBS: usize = 24;
    const WORKERS: usize = 6;

    let mut enqueued = HashSet::new();
    for _ in 0..JOBS {
        enqueued.insert(put(store.as_ref(), "build", &[]).await);
    }

    let tasks = (0..WORKERS).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(claim) = store.dequeue(&channels(), &[]).await.unwrap() {
                claimed.push(claim.id);
            }
            claimed
        })
    });

    let mut seen = HashSet::new();
    for handle in futures::future::join_all(tasks).await {
        for id in handle.unwrap() {
            assert!(seen.insert(id), "job {} claimed twice", id);
        }
    }
    assert_eq!(seen, enqueued);
}

pub async fn heartbeat_checks_token(store: Arc<dyn JobStore>) {
    let id = put(store.as_ref(), "build", &[]).await;

    assert!(matches!(
        store.heartbeat(id, LeaseToken::generate()).await,
        Err(StoreError::TokenMismatch(_))
    ));
    assert!(matches!(
        store.heartbeat(JobId::new(), LeaseToken::generate()).await,
        Err(StoreError::NotFound(_))
    ));

    let (claimed, token) = claim_one(store.as_ref()).await;
    assert_eq!(claimed, id);
    let ack = store.heartbeat(id, token).await.unwrap();
    assert!(!ack.cancel_requested);
    assert!(matches!(
        store.heartbeat(id, LeaseToken::generate()).await,
        Err(StoreError::TokenMismatch(_))
    ));

    finish_ok(store.as_ref(), id, token).await;
    assert!(matches!(
        store.heartbeat(id, token).await,
        Err(StoreError::TokenMismatch(_))
    ));
}

pub async fn finish_checks_token_and_rejects_double_finish(store: Arc<dyn JobStore>) {
    let id = put(store.as_ref(), "build", &[]).await;

    assert!(matches!(
        store.finish(id, LeaseToken::generate(), json!(null)).await,
        Err(StoreError::TokenMismatch(_))
    ));
    assert!(matches!(
        store
            .finish(JobId::new(), LeaseToken::generate(), json!(null))
            .await,
        Err(StoreError::NotFound(_))
    ));

    let (_, token) = claim_one(store.as_ref()).await;
    assert!(matches!(
        store.finish(id, LeaseToken::generate(), json!(null)).await,
        Err(StoreError::TokenMismatch(_))
    ));

    store
        .finish(id, token, json!({ "success": false, "error": "boom" }))
        .await
        .unwrap();
    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.result, Some(json!({ "success": false, "error": "boom" })));
    assert!(job.finished_at.is_some());
    assert!(job.started_at.is_some());

    assert!(matches!(
        store.finish(id, token, json!({ "success": true })).await,
        Err(StoreError::AlreadyFinished(_))
    ));
    assert!(store.dequeue(&channels(), &[]).await.unwrap().is_none());
}

pub async fn stale_lease_is_recovered(store: Arc<dyn JobStore>) {
    let id = put(store.as_ref(), "build", &[]).await;
    let (_, stale_token) = claim_one(store.as_ref()).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    let requeued = store
        .requeue_stale(Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(requeued, vec![id]);

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.token.is_none());
    assert_eq!(job.retries, 1);

    let claim = store.dequeue(&channels(), &[]).await.unwrap().unwrap();
    assert_eq!(claim.id, id);
    assert_ne!(claim.token, stale_token);

    assert!(matches!(
        store.heartbeat(id, stale_token).await,
        Err(StoreError::TokenMismatch(_))
    ));
    assert!(matches!(
        store.finish(id, stale_token, json!(null)).await,
        Err(StoreError::TokenMismatch(_))
    ));
    finish_ok(store.as_ref(), id, claim.token).await;
}

pub async fn requeue_stale_spares_live_leases(store: Arc<dyn JobStore>) {
    let quiet = put(store.as_ref(), "quiet", &[]).await;
    let busy = put(store.as_ref(), "busy", &[]).await;
    let (_, _quiet_token) = claim_one(store.as_ref()).await;
    let (_, busy_token) = claim_one(store.as_ref()).await;

    assert!(store
        .requeue_stale(Duration::from_secs(60))
        .await
        .unwrap()
        .is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    store.heartbeat(busy, busy_token).await.unwrap();

    let requeued = store
        .requeue_stale(Duration::from_millis(40))
        .await
        .unwrap();
    assert_eq!(requeued, vec![quiet]);
    assert_eq!(store.job(busy).await.unwrap().status, JobStatus::Running);
    finish_ok(store.as_ref(), busy, busy_token).await;
}

pub async fn explicit_requeue(store: Arc<dyn JobStore>) {
    let id = put(store.as_ref(), "build", &[]).await;
    let (_, token) = claim_one(store.as_ref()).await;

    assert!(matches!(
        store.requeue(id, LeaseToken::generate()).await,
        Err(StoreError::TokenMismatch(_))
    ));
    store.requeue(id, token).await.unwrap();

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries, 1);
    assert!(matches!(
        store.requeue(id, token).await,
        Err(StoreError::TokenMismatch(_))
    ));

    let (again, new_token) = claim_one(store.as_ref()).await;
    assert_eq!(again, id);
    assert_ne!(new_token, token);
}

pub async fn cancel_is_cooperative(store: Arc<dyn JobStore>) {
    let running = put(store.as_ref(), "build", &[]).await;
    let waiting = put(store.as_ref(), "upload", &[]).await;
    let (_, token) = claim_one(store.as_ref()).await;

    store.cancel(running).await.unwrap();
    store.cancel(running).await.unwrap();
    let ack = store.heartbeat(running, token).await.unwrap();
    assert!(ack.cancel_requested);
    assert_eq!(store.job(running).await.unwrap().status, JobStatus::Running);

    store.cancel(waiting).await.unwrap();
    assert!(store.job(waiting).await.unwrap().cancel_requested);
    assert!(store.dequeue(&channels(), &[]).await.unwrap().is_none());

    store
        .finish(running, token, json!({ "success": false, "error": "cancelled" }))
        .await
        .unwrap();
    assert!(matches!(
        store.cancel(running).await,
        Err(StoreError::AlreadyFinished(_))
    ));
    assert!(matches!(
        store.cancel(JobId::new()).await,
        Err(StoreError::NotFound(_))
    ));
}

pub async fn dequeue_by_id_checks_readiness(store: Arc<dyn JobStore>) {
    let dep = put(store.as_ref(), "depsolve", &[]).await;
    let id = put(store.as_ref(), "build", &[dep]).await;

    assert!(matches!(
        store.dequeue_by_id(id).await,
        Err(StoreError::NotReady(_))
    ));
    assert!(matches!(
        store.dequeue_by_id(JobId::new()).await,
        Err(StoreError::NotFound(_))
    ));

    let claim = store.dequeue_by_id(dep).await.unwrap();
    assert_eq!(claim.id, dep);
    assert!(matches!(
        store.dequeue_by_id(dep).await,
        Err(StoreError::NotPending(_))
    ));
    finish_ok(store.as_ref(), dep, claim.token).await;

    let claim = store.dequeue_by_id(id).await.unwrap();
    assert_eq!(claim.dependencies, vec![dep]);
}

pub async fn id_from_token_tracks_current_lease(store: Arc<dyn JobStore>) {
    let id = put(store.as_ref(), "build", &[]).await;
    let (_, token) = claim_one(store.as_ref()).await;

    assert_eq!(store.id_from_token(token).await.unwrap(), id);
    assert!(matches!(
        store.id_from_token(LeaseToken::generate()).await,
        Err(StoreError::UnknownToken(_))
    ));

    finish_ok(store.as_ref(), id, token).await;
    assert!(matches!(
        store.id_from_token(token).await,
        Err(StoreError::UnknownToken(t)) if t == token
    ));
}

pub async fn delete_is_idempotent(store: Arc<dyn JobStore>) {
    let id = put(store.as_ref(), "build", &[]).await;
    store.delete_job(id).await.unwrap();
    store.delete_job(id).await.unwrap();
    store.delete_job(JobId::new()).await.unwrap();
    assert!(store.all_root_job_ids().await.unwrap().is_empty());
}

pub async fn delete_refuses_job_with_dependants(store: Arc<dyn JobStore>) {
    let dep = put(store.as_ref(), "depsolve", &[]).await;
    let root = put(store.as_ref(), "build", &[dep]).await;

    assert!(matches!(
        store.delete_job(dep).await,
        Err(StoreError::HasDependants(_))
    ));
    assert!(store.job(dep).await.is_ok());
    assert_eq!(store.all_root_job_ids().await.unwrap(), vec![root]);
}

pub async fn delete_keeps_shared_dependency(store: Arc<dyn JobStore>) {
    let x = put(store.as_ref(), "depsolve", &[]).await;
    let d1 = put(store.as_ref(), "build", &[x]).await;
    let d2 = put(store.as_ref(), "build", &[x]).await;

    store.delete_job(d1).await.unwrap();
    assert!(matches!(store.job(d1).await, Err(StoreError::NotFound(_))));
    let shared = store.job(x).await.unwrap();
    assert_eq!(shared.dependants, vec![d2]);
    assert_eq!(store.all_root_job_ids().await.unwrap(), vec![d2]);

    store.delete_job(d2).await.unwrap();
    assert!(matches!(store.job(x).await, Err(StoreError::NotFound(_))));
    assert!(store.all_root_job_ids().await.unwrap().is_empty());
}

pub async fn root_tracking_shapes(store: Arc<dyn JobStore>) {
    let single = put(store.as_ref(), "single", &[]).await;
    assert_eq!(store.all_root_job_ids().await.unwrap(), vec![single]);

    let chain_a = put(store.as_ref(), "chain", &[]).await;
    let chain_b = put(store.as_ref(), "chain", &[chain_a]).await;
    let chain_c = put(store.as_ref(), "chain", &[chain_b]).await;

    let top = put(store.as_ref(), "diamond", &[]).await;
    let left = put(store.as_ref(), "diamond", &[top]).await;
    let right = put(store.as_ref(), "diamond", &[top]).await;
    let bottom = put(store.as_ref(), "diamond", &[left, right]).await;

    assert_eq!(
        store.all_root_job_ids().await.unwrap(),
        sorted(vec![single, chain_c, bottom])
    );
}

pub async fn delete_multi_root_graphs(store: Arc<dyn JobStore>) {
    let lone = put(store.as_ref(), "oneRoot", &[]).await;
    store.delete_job(lone).await.unwrap();
    assert!(store.all_root_job_ids().await.unwrap().is_empty());

    let j1 = put(store.as_ref(), "twoDeps", &[]).await;
    let j2 = put(store.as_ref(), "twoDeps", &[]).await;
    let root2 = put(store.as_ref(), "twoDeps", &[j1, j2]).await;
    let j3 = put(store.as_ref(), "sharedDeps", &[]).await;
    let root3 = put(store.as_ref(), "sharedDeps", &[j1, j3]).await;

    assert_eq!(
        store.all_root_job_ids().await.unwrap(),
        sorted(vec![root2, root3])
    );

    store.delete_job(root2).await.unwrap();
    assert_eq!(store.all_root_job_ids().await.unwrap(), vec![root3]);
    assert!(store.job(j1).await.is_ok());
    assert!(matches!(store.job(j2).await, Err(StoreError::NotFound(_))));

    store.delete_job(root3).await.unwrap();
    assert!(store.all_root_job_ids().await.unwrap().is_empty());
    for id in [lone, j1, j2, j3, root2, root3] {
        assert!(matches!(store.job(id).await, Err(StoreError::NotFound(_))));
    }

    let ostree = put(store.as_ref(), "ostree", &[]).await;
    let depsolve = put(store.as_ref(), "depsolve", &[]).await;
    let manifest = put(store.as_ref(), "manifest", &[ostree, depsolve]).await;
    let init = put(store.as_ref(), "init", &[]).await;
    let root = put(store.as_ref(), "final", &[init, manifest, depsolve]).await;

    store.delete_job(root).await.unwrap();
    assert!(store.all_root_job_ids().await.unwrap().is_empty());
    for id in [root, init, ostree, depsolve, manifest] {
        assert!(matches!(store.job(id).await, Err(StoreError::NotFound(_))));
    }
}
