use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use buildbroker::error::BrokerError;
use buildbroker::jobqueue::{FsJobQueue, JobState};

fn kinds(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn open_queue(dir: &tempfile::TempDir) -> FsJobQueue {
    FsJobQueue::open(dir.path().join("jobs")).unwrap()
}

#[tokio::test]
async fn test_fifo_within_type() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir);

    let first = queue.enqueue("osbuild:x", json!({"n": 1}), &[]).unwrap();
    let second = queue.enqueue("osbuild:x", json!({"n": 2}), &[]).unwrap();
    let third = queue.enqueue("osbuild:x", json!({"n": 3}), &[]).unwrap();

    for expected in [first, second, third] {
        let dispatch = queue
            .dequeue("x", &kinds(&["osbuild"]), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(dispatch.job_id, expected);
    }
}

#[tokio::test]
async fn test_blocked_head_does_not_shadow_ready_successor() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir);

    let gate = queue.enqueue("depsolve", json!({}), &[]).unwrap();
    let blocked = queue.enqueue("osbuild:x", json!({"n": 1}), &[gate]).unwrap();
    let ready = queue.enqueue("osbuild:x", json!({"n": 2}), &[]).unwrap();

    let dispatch = queue
        .dequeue("x", &kinds(&["osbuild"]), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(dispatch.job_id, ready);

    // The blocked head is still waiting on its dependency.
    let err = queue
        .dequeue("x", &kinds(&["osbuild"]), Some(Duration::from_millis(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::DequeueTimeout));
    assert_eq!(queue.snapshot(blocked).unwrap().state, JobState::Pending);
}

#[tokio::test]
async fn test_dependency_gating_and_dep_results_order() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir);

    let dep_a = queue.enqueue("depsolve", json!({}), &[]).unwrap();
    let dep_b = queue.enqueue("depsolve", json!({}), &[]).unwrap();
    let child = queue
        .enqueue("osbuild:x", json!({}), &[dep_a, dep_b])
        .unwrap();

    let err = queue
        .dequeue("x", &kinds(&["osbuild"]), Some(Duration::from_millis(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::DequeueTimeout));

    // Finish the dependencies out of order; results still arrive in
    // dependency order.
    let dispatch_b = loop {
        let d = queue
            .dequeue("x", &kinds(&["depsolve"]), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        if d.job_id == dep_b {
            break d;
        }
        queue.finish(d.token, json!({"which": "a"})).unwrap();
    };
    queue.finish(dispatch_b.token, json!({"which": "b"})).unwrap();

    let dispatch = queue
        .dequeue("x", &kinds(&["osbuild"]), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(dispatch.job_id, child);
    assert_eq!(dispatch.dep_results.len(), 2);
    assert_eq!(dispatch.dep_results[0], json!({"which": "a"}));
    assert_eq!(dispatch.dep_results[1], json!({"which": "b"}));
}

#[tokio::test]
async fn test_unknown_dependency_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir);

    let missing = Uuid::new_v4();
    let err = queue
        .enqueue("osbuild:x", json!({}), &[missing])
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidDependency(id) if id == missing));
}

#[tokio::test]
async fn test_token_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir);

    let job_id = queue.enqueue("osbuild:x", json!({}), &[]).unwrap();
    let dispatch = queue
        .dequeue("x", &kinds(&["osbuild"]), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(dispatch.job_id, job_id);
    assert_ne!(dispatch.token, job_id);

    assert_eq!(queue.job_id_by_token(dispatch.token).unwrap(), job_id);
    assert_eq!(queue.snapshot(job_id).unwrap().state, JobState::Running);

    queue.finish(dispatch.token, json!({"success": true})).unwrap();
    assert_eq!(queue.snapshot(job_id).unwrap().state, JobState::Finished);
    assert_eq!(
        queue.load_result(job_id).unwrap(),
        Some(json!({"success": true}))
    );

    // The token is retired; a second finish is rejected.
    let err = queue.finish(dispatch.token, json!({})).unwrap_err();
    assert!(matches!(err, BrokerError::UnknownToken(_)));
    let err = queue.job_id_by_token(dispatch.token).unwrap_err();
    assert!(matches!(err, BrokerError::UnknownToken(_)));
}

#[tokio::test]
async fn test_cancel_is_sticky_and_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir);

    let job_id = queue.enqueue("osbuild:x", json!({}), &[]).unwrap();
    queue.cancel(job_id).unwrap();
    queue.cancel(job_id).unwrap();
    assert!(queue.snapshot(job_id).unwrap().canceled);

    // A canceled pending job is still dispatched; the worker observes the
    // flag through its token.
    let dispatch = queue
        .dequeue("x", &kinds(&["osbuild"]), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(dispatch.job_id, job_id);
    assert!(queue.is_canceled_by_token(dispatch.token).unwrap());

    // Finishing a canceled job still records the result.
    queue.finish(dispatch.token, json!({"partial": true})).unwrap();
    let snapshot = queue.snapshot(job_id).unwrap();
    assert_eq!(snapshot.state, JobState::Finished);
    assert!(snapshot.canceled);

    let err = queue.cancel(Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, BrokerError::UnknownJob(_)));
}

#[tokio::test]
async fn test_enqueue_wakes_blocked_dequeue() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(open_queue(&dir));

    let waiter = queue.clone();
    let handle = tokio::spawn(async move {
        waiter
            .dequeue("x", &kinds(&["osbuild"]), Some(Duration::from_secs(5)))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let job_id = queue.enqueue("osbuild:x", json!({}), &[]).unwrap();

    let dispatch = handle.await.unwrap().unwrap();
    assert_eq!(dispatch.job_id, job_id);
}

#[tokio::test]
async fn test_finish_wakes_dependent_dequeue() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(open_queue(&dir));

    let gate = queue.enqueue("depsolve", json!({}), &[]).unwrap();
    let child = queue.enqueue("osbuild:x", json!({}), &[gate]).unwrap();

    let waiter = queue.clone();
    let handle = tokio::spawn(async move {
        waiter
            .dequeue("x", &kinds(&["osbuild"]), Some(Duration::from_secs(5)))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let gate_dispatch = queue
        .dequeue("x", &kinds(&["depsolve"]), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(gate_dispatch.job_id, gate);
    queue.finish(gate_dispatch.token, json!({"ok": true})).unwrap();

    let dispatch = handle.await.unwrap().unwrap();
    assert_eq!(dispatch.job_id, child);
    assert_eq!(dispatch.dep_results, vec![json!({"ok": true})]);
}

#[tokio::test]
async fn test_restart_rebuilds_index() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("jobs");

    let finished;
    let running;
    let running_token;
    let pending;
    {
        let queue = FsJobQueue::open(&root).unwrap();
        finished = queue.enqueue("depsolve", json!({"n": 1}), &[]).unwrap();
        running = queue.enqueue("osbuild:x", json!({"n": 2}), &[]).unwrap();
        pending = queue.enqueue("osbuild:x", json!({"n": 3}), &[]).unwrap();

        let d = queue
            .dequeue("x", &kinds(&["depsolve"]), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        queue.finish(d.token, json!({"done": true})).unwrap();
        queue.cancel(pending).unwrap();

        let d = queue
            .dequeue("x", &kinds(&["osbuild"]), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(d.job_id, running);
        running_token = d.token;
    }

    let queue = FsJobQueue::open(&root).unwrap();

    assert_eq!(queue.snapshot(finished).unwrap().state, JobState::Finished);
    assert_eq!(queue.load_result(finished).unwrap(), Some(json!({"done": true})));

    // Running jobs stay running; their token survives the restart.
    assert_eq!(queue.snapshot(running).unwrap().state, JobState::Running);
    assert_eq!(queue.job_id_by_token(running_token).unwrap(), running);
    assert!(!queue.is_canceled_by_token(running_token).unwrap());

    let snapshot = queue.snapshot(pending).unwrap();
    assert_eq!(snapshot.state, JobState::Pending);
    assert!(snapshot.canceled);

    // The rebuilt FIFO dispatches the remaining pending job.
    let d = queue
        .dequeue("x", &kinds(&["osbuild"]), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(d.job_id, pending);

    // And the restored token can still finish its job.
    queue.finish(running_token, json!({"late": true})).unwrap();
    assert_eq!(queue.snapshot(running).unwrap().state, JobState::Finished);
}

#[tokio::test]
async fn test_dequeue_by_id_requires_eligibility() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir);

    let gate = queue.enqueue("depsolve", json!({}), &[]).unwrap();
    let child = queue
        .enqueue("manifest-id-only", json!({}), &[gate])
        .unwrap();

    let err = queue.dequeue_by_id("x", child).unwrap_err();
    assert!(matches!(err, BrokerError::NotPending(_)));

    let err = queue.dequeue_by_id("x", Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, BrokerError::UnknownJob(_)));

    let d = queue
        .dequeue("x", &kinds(&["depsolve"]), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    queue.finish(d.token, json!({})).unwrap();

    let d = queue.dequeue_by_id("x", child).unwrap();
    assert_eq!(d.job_id, child);
    assert_eq!(d.jtype, "manifest-id-only");

    // A running job is no longer eligible.
    let err = queue.dequeue_by_id("x", child).unwrap_err();
    assert!(matches!(err, BrokerError::NotPending(_)));
}
