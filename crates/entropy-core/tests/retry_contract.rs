//! Architectural Contract Test: Syncer-Owned Retry Logic
//!
//! Verifies that failed sync steps are retried by the syncer, not by
//! modules:
//!
//! - Failures reschedule with truncated exponential backoff and a growing
//!   attempt counter
//! - After `max_attempts` the resource moves to ERROR with a structured
//!   sync result, and its job is retained but never run
//! - An update on an ERROR resource starts over immediately
//! - Deadline overruns and panics count as failed attempts
//! - Leases are kept alive while a step runs

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use entropy_core::{ErrorKind, Spec, Status, Store, UpdateRequest};

const URN: &str = "orn:entropy:log:p1:a";

#[tokio::test]
async fn failures_back_off_then_succeed() {
    let harness = Harness::new(ScriptedModule::new());
    harness.module.script([
        Step::Fail("upstream unavailable"),
        Step::Fail("upstream unavailable"),
        Step::Fail("upstream unavailable"),
        Step::Complete,
    ]);
    let syncer = harness.syncer(fast_syncer_config());

    harness
        .service
        .create(create_request("a"), "alice")
        .await
        .unwrap();

    let mut last_attempts = 0;
    for k in 1..=3u32 {
        let before = Utc::now();
        assert!(syncer.run_once("w1").await.unwrap());

        let job = harness.service.get_pending_job(URN).await.unwrap().unwrap();
        assert_eq!(job.attempts, k);
        assert!(job.attempts >= last_attempts);
        last_attempts = job.attempts;

        // base = 1s: delays of at least 1s, 2s, 4s
        let min_delay = chrono::Duration::milliseconds(1_000 * 2i64.pow(k - 1));
        assert!(job.run_at >= before + min_delay);
        assert_eq!(job.last_error.as_deref(), Some("internal error: upstream unavailable"));

        let res = harness.service.get(URN).await.unwrap();
        assert_eq!(res.state.status, Status::Pending);
        assert_eq!(res.state.sync_result.retries, k);

        // Not due yet
        assert!(!syncer.run_once("w1").await.unwrap());
        harness.make_due(URN).await;
    }

    assert!(syncer.run_once("w1").await.unwrap());
    let res = harness.service.get(URN).await.unwrap();
    assert_eq!(res.state.status, Status::Completed);
    assert_eq!(res.state.sync_result.retries, 0);
    assert!(harness.service.get_pending_job(URN).await.unwrap().is_none());
    assert_eq!(harness.module.sync_calls(), 4);
}

#[tokio::test]
async fn exhausted_retries_park_the_job_until_update() {
    let harness = Harness::new(ScriptedModule::new());
    harness
        .module
        .script([Step::Fail("boom"), Step::Fail("boom again")]);
    let mut config = fast_syncer_config();
    config.retry.max_attempts = 2;
    let syncer = harness.syncer(config);

    harness
        .service
        .create(create_request("a"), "alice")
        .await
        .unwrap();
    assert!(syncer.run_once("w1").await.unwrap());

    // Retrying resources cannot be re-planned
    let err = harness
        .service
        .update(URN, UpdateRequest::default(), "alice")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    harness.make_due(URN).await;
    assert!(syncer.run_once("w1").await.unwrap());

    let res = harness.service.get(URN).await.unwrap();
    assert_eq!(res.state.status, Status::Error);
    assert!(res.state.next_action.is_none());
    assert_eq!(res.state.sync_result.retries, 2);
    assert_eq!(
        res.state.sync_result.last_error.as_deref(),
        Some("internal error: boom again")
    );
    assert!(res.state.sync_result.first_failure_at.is_some());

    let parked = harness.service.get_pending_job(URN).await.unwrap().unwrap();
    assert!(parked.parked);
    assert_eq!(parked.attempts, 2);

    // Parked jobs are never claimed, even when due
    harness.make_due(URN).await;
    assert!(!syncer.run_once("w1").await.unwrap());

    // Update resets the streak and reschedules immediately
    let updated = harness
        .service
        .update(
            URN,
            UpdateRequest {
                spec: Spec {
                    configs: serde_json::json!({ "fixed": true }),
                    ..Spec::default()
                },
                labels: None,
            },
            "alice",
        )
        .await
        .unwrap();
    assert_eq!(updated.state.sync_result.retries, 0);

    let job = harness.service.get_pending_job(URN).await.unwrap().unwrap();
    assert_eq!(job.attempts, 0);
    assert!(!job.parked);
    assert!(job.run_at <= Utc::now());

    assert!(syncer.run_once("w1").await.unwrap());
    let res = harness.service.get(URN).await.unwrap();
    assert_eq!(res.state.status, Status::Completed);
}

#[tokio::test]
async fn deadline_overrun_counts_as_failed_attempt() {
    let harness = Harness::new(ScriptedModule::new());
    harness
        .module
        .script([Step::Sleep(Duration::from_millis(400))]);
    let mut config = fast_syncer_config();
    config.sync_interval_ms = 100;
    let syncer = harness.syncer(config);

    harness
        .service
        .create(create_request("a"), "alice")
        .await
        .unwrap();
    assert!(syncer.run_once("w1").await.unwrap());

    let job = harness.service.get_pending_job(URN).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(job.claimed_by.is_none());
    assert!(job.last_error.as_deref().is_some_and(|e| e.contains("deadline")));
}

#[tokio::test]
async fn panicking_step_backs_off_like_a_failure() {
    let harness = Harness::new(ScriptedModule::new());
    harness.module.script([Step::Panic]);
    let syncer = harness.syncer(fast_syncer_config());

    harness
        .service
        .create(create_request("a"), "alice")
        .await
        .unwrap();
    let before = Utc::now();
    assert!(syncer.run_once("w1").await.unwrap());

    let job = harness.service.get_pending_job(URN).await.unwrap().unwrap();
    assert!(job.claimed_by.is_none());
    assert_eq!(job.attempts, 1);
    assert!(job.run_at >= before + chrono::Duration::milliseconds(1000));
    assert!(job.last_error.as_deref().is_some_and(|e| e.contains("panicked")));

    // Not due again until the backoff elapses
    assert!(!syncer.run_once("w2").await.unwrap());

    harness.make_due(URN).await;
    assert!(syncer.run_once("w2").await.unwrap());
    assert_eq!(
        harness.service.get(URN).await.unwrap().state.status,
        Status::Completed
    );
}

#[tokio::test]
async fn repeated_panics_end_in_error() {
    let harness = Harness::new(ScriptedModule::new());
    harness.module.script(std::iter::repeat_n(Step::Panic, 10));
    let mut config = fast_syncer_config();
    config.retry.max_attempts = 3;
    let syncer = harness.syncer(config);

    harness
        .service
        .create(create_request("a"), "alice")
        .await
        .unwrap();

    let mut claims = 0;
    for _ in 0..10 {
        harness.make_due(URN).await;
        if syncer.run_once("w1").await.unwrap() {
            claims += 1;
        }
    }
    assert_eq!(claims, 3);
    assert_eq!(harness.module.sync_calls(), 3);

    let res = harness.service.get(URN).await.unwrap();
    assert_eq!(res.state.status, Status::Error);
    let job = harness.service.get_pending_job(URN).await.unwrap().unwrap();
    assert!(job.parked);
    assert_eq!(job.attempts, 3);
}

#[tokio::test]
async fn lease_is_extended_while_step_runs() {
    let harness = Harness::new(ScriptedModule::new());
    harness
        .module
        .script([Step::Sleep(Duration::from_millis(450))]);
    let mut config = fast_syncer_config();
    config.refresh_interval_ms = Some(100);
    let syncer = Arc::new(harness.syncer(config));

    harness
        .service
        .create(create_request("a"), "alice")
        .await
        .unwrap();

    let running = {
        let syncer = Arc::clone(&syncer);
        tokio::spawn(async move { syncer.run_once("w1").await.unwrap() })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    let first = harness
        .store
        .pending_job(URN)
        .await
        .unwrap()
        .unwrap()
        .claimed_until
        .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    let later = harness
        .store
        .pending_job(URN)
        .await
        .unwrap()
        .unwrap()
        .claimed_until
        .unwrap();
    assert!(later > first);

    assert!(running.await.unwrap());
    assert_eq!(
        harness.service.get(URN).await.unwrap().state.status,
        Status::Completed
    );
}
