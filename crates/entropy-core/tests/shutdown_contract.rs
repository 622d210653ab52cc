//! Architectural Contract Test: Worker Pool Lifecycle
//!
//! Verifies that a started syncer works the queue on its own and that
//! shutdown never strands a job:
//!
//! - Workers pick up due jobs without being driven by the test
//! - In-flight steps that finish within the grace period are recorded
//! - Steps still running after the grace period are cancelled and their
//!   leases released, so the job is immediately reclaimable
//! - An idle pool stops promptly

mod common;

use std::time::Duration;

use common::*;
use entropy_core::{Status, Store};

const URN: &str = "orn:entropy:log:p1:a";

async fn wait_until_leased(harness: &Harness) {
    let leased = eventually(Duration::from_secs(2), || async move {
        harness
            .store
            .pending_job(URN)
            .await
            .unwrap()
            .is_some_and(|job| job.claimed_by.is_some())
    })
    .await;
    assert!(leased, "job was never claimed");
}

#[tokio::test]
async fn started_syncer_drives_resources_to_completion() {
    let harness = Harness::new(ScriptedModule::new());
    harness.module.script([
        Step::Running { poll_after_ms: 50 },
        Step::Complete,
    ]);
    let handle = harness.syncer(fast_syncer_config()).start();

    harness
        .service
        .create(create_request("a"), "alice")
        .await
        .unwrap();

    let service = &harness.service;
    let completed = eventually(Duration::from_secs(3), || async move {
        service.get(URN).await.unwrap().state.status == Status::Completed
    })
    .await;
    assert!(completed);
    assert!(harness.service.get_pending_job(URN).await.unwrap().is_none());

    handle.shutdown().await;
    assert_eq!(harness.module.sync_calls(), 2);
}

#[tokio::test]
async fn step_within_grace_period_is_recorded() {
    let harness = Harness::new(ScriptedModule::new());
    harness
        .module
        .script([Step::Sleep(Duration::from_millis(100))]);
    let handle = harness.syncer(fast_syncer_config()).start();

    harness
        .service
        .create(create_request("a"), "alice")
        .await
        .unwrap();
    wait_until_leased(&harness).await;

    handle.shutdown().await;

    let res = harness.service.get(URN).await.unwrap();
    assert_eq!(res.state.status, Status::Completed);
    assert!(harness.service.get_pending_job(URN).await.unwrap().is_none());
}

#[tokio::test]
async fn step_past_grace_period_is_cancelled_and_released() {
    let harness = Harness::new(ScriptedModule::new());
    // Longer than the 200ms grace, shorter than the 500ms step deadline
    harness
        .module
        .script([Step::Sleep(Duration::from_millis(450))]);
    let handle = harness.syncer(fast_syncer_config()).start();

    harness
        .service
        .create(create_request("a"), "alice")
        .await
        .unwrap();
    wait_until_leased(&harness).await;

    handle.shutdown().await;

    let job = harness.service.get_pending_job(URN).await.unwrap().unwrap();
    assert!(job.claimed_by.is_none());
    assert_eq!(job.attempts, 0);
    assert_eq!(
        harness.service.get(URN).await.unwrap().state.status,
        Status::Pending
    );

    // Another worker takes over right away
    let syncer = harness.syncer(fast_syncer_config());
    assert!(syncer.run_once("w2").await.unwrap());
    assert_eq!(
        harness.service.get(URN).await.unwrap().state.status,
        Status::Completed
    );
}

#[tokio::test]
async fn idle_pool_stops_promptly() {
    let harness = Harness::new(ScriptedModule::new());
    let handle = harness.syncer(fast_syncer_config()).start();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stopped = tokio::time::timeout(Duration::from_secs(1), handle.shutdown()).await;
    assert!(stopped.is_ok());
    assert_eq!(harness.module.sync_calls(), 0);
}
