mod test_harness;

use std::time::Duration;

use dispatch_lite::incident::IncidentKind;
use dispatch_lite::scheduler::{JobId, JobStatus};
use dispatch_lite::worker::{TaskOutcome, WorkerId, WorkerStatus};
use dispatch_lite::DispatchError;
use test_harness::{test_config, TestNode};

/// One job accepted by one worker.
async fn accepted(t: &TestNode, job: &str, worker: &str) -> (JobId, WorkerId) {
    let job_id = t.submit(job, 41.30, 69.24).await;
    let worker_id = t.idle_worker(worker, 41.30, 69.24).await;
    let offer = t.node.scheduler.offer_job(&job_id).await.unwrap().unwrap();
    t.node.accept_offer(&offer.id).await.unwrap();
    (job_id, worker_id)
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_completions_have_one_effect() {
    let t = TestNode::manual(test_config());
    let (job, worker) = accepted(&t, "bin-1", "w1").await;

    let mut calls = Vec::new();
    for _ in 0..8 {
        let node = t.node.clone();
        let (job, worker) = (job.clone(), worker.clone());
        calls.push(tokio::spawn(async move { node.complete_job(&job, &worker).await }));
    }

    let mut fresh = 0;
    for call in calls {
        let completion = call.await.unwrap().unwrap();
        assert_eq!(completion.job.status, JobStatus::Completed);
        assert_eq!(completion.job.completed_by, Some(worker.clone()));
        if !completion.already_completed {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 1);

    let history = t.node.worker_history(&worker).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(t.node.worker(&worker).await.unwrap().status, WorkerStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_completion_returns_same_job() {
    let t = TestNode::manual(test_config());
    let (job, worker) = accepted(&t, "bin-2", "w2").await;

    let first = t.node.complete_job(&job, &worker).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    let second = t.node.complete_job(&job, &worker).await.unwrap();

    assert!(second.already_completed);
    assert_eq!(second.job.completed_at, first.job.completed_at);
    assert_eq!(second.job.seq, first.job.seq);
}

#[tokio::test(start_paused = true)]
async fn test_complete_by_stranger_is_refused() {
    let t = TestNode::manual(test_config());
    let (job, owner) = accepted(&t, "bin-3", "owner").await;
    let stranger = t.idle_worker("stranger", 41.30, 69.24).await;

    let err = t.node.complete_job(&job, &stranger).await.unwrap_err();
    assert!(matches!(err, DispatchError::NotOwner { .. }));
    assert!(!err.is_stale());

    t.node.complete_job(&job, &owner).await.unwrap();
    let err = t.node.complete_job(&job, &stranger).await.unwrap_err();
    assert!(matches!(err, DispatchError::NotOwner { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_complete_before_accept_is_conflict() {
    let t = TestNode::manual(test_config());
    let job = t.submit("bin-4", 41.30, 69.24).await;
    let worker = t.idle_worker("w4", 41.30, 69.24).await;
    t.node.scheduler.offer_job(&job).await.unwrap().unwrap();

    let err = t.node.complete_job(&job, &worker).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::StateConflict {
            actual: JobStatus::Offered,
            ..
        }
    ));

    let missing = t
        .node
        .complete_job(&JobId::from("nope"), &worker)
        .await
        .unwrap_err();
    assert!(matches!(missing, DispatchError::JobNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn test_abandon_requeues_and_reports() {
    let t = TestNode::manual(test_config());
    let (job, worker) = accepted(&t, "bin-5", "w5").await;

    let requeued = t
        .node
        .abandon_job(&job, &worker, "truck broke down")
        .await
        .unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.assigned_worker, None);
    assert_eq!(requeued.avoid_worker, Some(worker.clone()));

    let w = t.node.worker(&worker).await.unwrap();
    assert_eq!(w.status, WorkerStatus::Idle);
    assert!(w.is_consistent());

    let incidents = t.node.incidents.for_job(&job).await;
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].kind, IncidentKind::Rejected);
    assert!(incidents[0].message.contains("abandoned"));
    assert!(incidents[0].message.contains("truck broke down"));

    let history = t.node.worker_history(&worker).await.unwrap();
    assert_eq!(history[0].outcome, TaskOutcome::Abandoned);

    // Completing an abandoned job is no longer possible.
    assert!(t.node.complete_job(&job, &worker).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_completed_worker_picks_up_next_job() {
    let t = TestNode::running(test_config());
    let worker = t.idle_worker("steady", 41.30, 69.24).await;
    let first = t.submit("first", 41.30, 69.24).await;
    let second = t.submit("second", 41.31, 69.25).await;

    let offer = t.wait_for_offer(&worker).await;
    assert_eq!(offer.job_id, first);
    t.node.accept_offer(&offer.id).await.unwrap();
    t.node.complete_job(&first, &worker).await.unwrap();

    let next = t.wait_for_offer(&worker).await;
    assert_eq!(next.job_id, second);

    t.node.stop().await;
}
