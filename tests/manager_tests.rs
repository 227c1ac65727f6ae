
use std::time::Duration;

use benchctl::error::BenchError;
use benchctl::job::{JobStatus, Mode, Workload};
use pretty_assertions::assert_eq;
use serde_json::json;
use test_harness::{bench, bench_with_poll, wait_for_terminal, MockStatus};

#[tokio::test]
async fn manual_job_with_three_steps_completes() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.push_status(MockStatus::Operating); // readiness
    t.push_status(MockStatus::Completed); // step 1
    t.push_status(MockStatus::Completed); // step 2
    t.push_status(MockStatus::Completed); // step 3

    let plan = vec![
        json!({"op": "aspirate", "vol": 50}),
        json!({"op": "dispense", "vol": 50}),
        json!({"op": "home"}),
    ];
    let state = tb
        .manager
        .submit_job("j1", "d1", Workload::manual("assay", plan))
        .await
        .unwrap();
    assert_eq!(state.mode, Mode::Manual);
    assert_eq!(state.status, JobStatus::Running);

    let final_state = wait_for_terminal(&tb.manager, "j1").await;
    assert_eq!(final_state.status, JobStatus::Completed);
    assert_eq!(final_state.current_step, Some(3));

    // Three payloads delivered to the workload inbox, in plan order.
    let uploads = t.uploads();
    assert_eq!(uploads.len(), 3);
    for (remote, _) in &uploads {
        assert!(remote.starts_with("/data/jobs/assay/inbox/"), "{remote}");
    }
    assert!(uploads[0].1.contains("aspirate"));
    assert!(uploads[1].1.contains("dispense"));
    assert!(uploads[2].1.contains("home"));

    assert_eq!(tb.hooks.final_count("j1"), 1);
    assert_eq!(tb.hooks.cleanup_count("j1"), 1);
}

#[tokio::test]
async fn auto_job_steps_increment_and_wait() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.push_status(MockStatus::Operating);
    t.push_status(MockStatus::Completed);
    t.push_status(MockStatus::Completed);

    let state = tb
        .manager
        .submit_job("j1", "d1", Workload::auto("assay"))
        .await
        .unwrap();
    assert_eq!(state.mode, Mode::Auto);
    assert_eq!(state.status, JobStatus::Waiting);
    assert_eq!(state.current_step, None);

    let s1 = tb
        .manager
        .step_and_wait("j1", &json!({"op": "noop"}))
        .await
        .unwrap();
    assert_eq!(s1.status, JobStatus::Waiting);
    assert_eq!(s1.current_step, Some(1));

    let s2 = tb
        .manager
        .step_and_wait("j1", &json!({"op": "noop"}))
        .await
        .unwrap();
    assert_eq!(s2.current_step, Some(2));

    // Still live: no finalization has happened.
    assert_eq!(tb.hooks.final_count("j1"), 0);
}

#[tokio::test]
async fn auto_step_failure_finalizes_and_releases_device() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.push_status(MockStatus::Operating);
    t.push_status(MockStatus::Error("motor fault".to_string()));

    tb.manager
        .submit_job("j1", "d1", Workload::auto("assay"))
        .await
        .unwrap();

    let err = tb
        .manager
        .step_and_wait("j1", &json!({"op": "noop"}))
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::Remote(_)));

    let state = tb.manager.get_state("j1").await.unwrap();
    assert_eq!(state.status, JobStatus::Failed);
    // Remote failure message surfaced verbatim.
    assert_eq!(state.message.as_deref(), Some("motor fault"));
    assert_eq!(tb.hooks.final_count("j1"), 1);

    // The device lock was released: a second job on d1 starts immediately.
    t.push_status(MockStatus::Operating);
    let state = tb
        .manager
        .submit_job("j2", "d1", Workload::auto("assay2"))
        .await
        .unwrap();
    assert_eq!(state.status, JobStatus::Waiting);
}

#[tokio::test]
async fn duplicate_job_id_is_rejected() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.push_status(MockStatus::Operating);

    tb.manager
        .submit_job("j1", "d1", Workload::auto("w"))
        .await
        .unwrap();
    let err = tb
        .manager
        .submit_job("j1", "d1", Workload::auto("w"))
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::JobAlreadyExists(_)));
}

#[tokio::test]
async fn unknown_device_is_rejected_without_registration() {
    let tb = bench(&["d1"]);
    let err = tb
        .manager
        .submit_job("j1", "nope", Workload::auto("w"))
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::DeviceNotFound(_)));
    assert!(matches!(
        tb.manager.get_state("j1").await.unwrap_err(),
        BenchError::JobNotFound(_)
    ));
}

#[tokio::test]
async fn get_state_unknown_job_fails() {
    let tb = bench(&["d1"]);
    assert!(matches!(
        tb.manager.get_state("ghost").await.unwrap_err(),
        BenchError::JobNotFound(_)
    ));
}

#[tokio::test]
async fn stepping_a_manual_job_is_invalid() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.push_status(MockStatus::Operating);
    t.push_status(MockStatus::Completed);

    tb.manager
        .submit_job("j1", "d1", Workload::manual("w", vec![json!({"op": "home"})]))
        .await
        .unwrap();

    let err = tb
        .manager
        .step_and_wait("j1", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::InvalidOperation(_)));

    wait_for_terminal(&tb.manager, "j1").await;
}

#[tokio::test]
async fn stepping_a_terminal_job_is_invalid() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.push_status(MockStatus::Operating);

    tb.manager
        .submit_job("j1", "d1", Workload::auto("w"))
        .await
        .unwrap();
    tb.manager.abort_job("j1").await;

    let err = tb
        .manager
        .step_and_wait("j1", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::InvalidOperation(_)));
}

#[tokio::test]
async fn startup_failure_marks_failed_and_releases_lock() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.fail_commands(); // workspace preparation fails hard

    let err = tb
        .manager
        .submit_job("j1", "d1", Workload::auto("w"))
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::Transport { .. }));

    let state = tb.manager.get_state("j1").await.unwrap();
    assert_eq!(state.status, JobStatus::Failed);
    assert_eq!(tb.hooks.final_count("j1"), 1);

    // Lock released: a fresh mock for the same device can start a job.
    let tb2 = bench(&["d1"]);
    tb2.transports["d1"].push_status(MockStatus::Operating);
    tb2.manager
        .submit_job("j2", "d1", Workload::auto("w"))
        .await
        .unwrap();
}

#[tokio::test]
async fn abort_is_noop_for_unknown_and_terminal_jobs() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.push_status(MockStatus::Operating);

    tb.manager.abort_job("ghost").await;

    tb.manager
        .submit_job("j1", "d1", Workload::auto("w"))
        .await
        .unwrap();
    tb.manager.abort_job("j1").await;
    assert_eq!(tb.hooks.final_count("j1"), 1);

    // Second abort of an already-terminal job changes nothing.
    tb.manager.abort_job("j1").await;
    assert_eq!(tb.hooks.final_count("j1"), 1);
    let state = tb.manager.get_state("j1").await.unwrap();
    assert_eq!(state.status, JobStatus::Aborted);
}

#[tokio::test]
async fn abort_during_auto_step_reaches_aborted_within_one_tick() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.push_status(MockStatus::Operating);
    t.set_fallback(MockStatus::Operating); // step never completes

    tb.manager
        .submit_job("j1", "d1", Workload::auto("w"))
        .await
        .unwrap();

    let manager = tb.manager.clone();
    let step = tokio::spawn(async move { manager.step_and_wait("j1", &json!({"op": "mix"})).await });

    // Let the step get into its poll loop, then abort.
    tokio::time::sleep(Duration::from_millis(20)).await;
    tb.manager.abort_job("j1").await;

    let err = step.await.unwrap().unwrap_err();
    assert!(matches!(err, BenchError::Aborted));

    let state = tb.manager.get_state("j1").await.unwrap();
    assert_eq!(state.status, JobStatus::Aborted);
    // abort_job finalized; the failing step path must not finalize again
    assert_eq!(tb.hooks.final_count("j1"), 1);
    // The stop file was delivered to the device.
    assert_eq!(t.stop_signal_count(), 1);
}

#[tokio::test]
async fn abort_of_manual_job_mid_run_finalizes_once() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.push_status(MockStatus::Operating);
    t.set_fallback(MockStatus::Operating); // first step polls forever

    tb.manager
        .submit_job(
            "j1",
            "d1",
            Workload::manual("w", vec![json!({"op": "a"}), json!({"op": "b"})]),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    tb.manager.abort_job("j1").await;

    let state = wait_for_terminal(&tb.manager, "j1").await;
    assert_eq!(state.status, JobStatus::Aborted);
    assert_eq!(state.current_step, Some(1));

    // Give the manual driver time to run its own exit path, then confirm
    // finalization still happened exactly once.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tb.hooks.final_count("j1"), 1);
    assert_eq!(tb.hooks.cleanup_count("j1"), 1);
    // Only the first step was ever delivered.
    assert_eq!(t.uploads().len(), 1);
}

#[tokio::test]
async fn abort_during_agent_startup_keeps_aborted_state() {
    let tb = bench(&["d1"]);
    // No statuses scripted: every readiness fetch misses, so the submit
    // sits in the startup poll until the abort lands.

    let manager = tb.manager.clone();
    let submit = tokio::spawn(async move {
        manager
            .submit_job("j1", "d1", Workload::auto("w"))
            .await
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    let state = tb.manager.get_state("j1").await.unwrap();
    assert_eq!(state.status, JobStatus::Starting);

    tb.manager.abort_job("j1").await;
    assert_eq!(
        tb.manager.get_state("j1").await.unwrap().status,
        JobStatus::Aborted
    );

    let err = submit.await.unwrap().unwrap_err();
    assert!(matches!(err, BenchError::Aborted));

    // The startup-failure path must not overwrite the terminal abort.
    let state = tb.manager.get_state("j1").await.unwrap();
    assert_eq!(state.status, JobStatus::Aborted);
    assert_eq!(tb.hooks.final_count("j1"), 1);
    assert_eq!(tb.hooks.cleanup_count("j1"), 1);
}

#[tokio::test]
async fn abort_of_job_queued_behind_lock_never_drives_device() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.push_status(MockStatus::Operating); // j1 readiness

    tb.manager
        .submit_job("j1", "d1", Workload::auto("hold"))
        .await
        .unwrap();

    // j2 queues behind j1's device lock.
    let manager = tb.manager.clone();
    let queued = tokio::spawn(async move {
        manager
            .submit_job("j2", "d1", Workload::auto("queued"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        tb.manager.get_state("j2").await.unwrap().status,
        JobStatus::Starting
    );

    tb.manager.abort_job("j2").await;
    assert_eq!(
        tb.manager.get_state("j2").await.unwrap().status,
        JobStatus::Aborted
    );

    // Free the device; the queued submit must bail out instead of
    // resurrecting the aborted job.
    tb.manager.abort_job("j1").await;
    let err = queued.await.unwrap().unwrap_err();
    assert!(matches!(err, BenchError::Aborted));

    let state = tb.manager.get_state("j2").await.unwrap();
    assert_eq!(state.status, JobStatus::Aborted);
    assert_eq!(tb.hooks.final_count("j2"), 1);
    assert_eq!(tb.hooks.cleanup_count("j2"), 1);

    // The device never saw j2's workload: no workspace prepared, no
    // agent launched for it.
    assert!(
        t.commands().iter().all(|c| !c.contains("queued")),
        "{:?}",
        t.commands()
    );

    // And the device is free for the next job.
    t.push_status(MockStatus::Operating);
    tb.manager
        .submit_job("j3", "d1", Workload::auto("next"))
        .await
        .unwrap();
}

#[tokio::test]
async fn same_device_jobs_never_interleave() {
    let tb = bench_with_poll(&["d1"], Duration::from_millis(20));
    let t = &tb.transports["d1"];
    // Job 1: readiness, then a slow single step (three "operating" polls
    // before completion keeps the device busy for ~60ms).
    t.push_status(MockStatus::Operating);
    t.push_status(MockStatus::Operating);
    t.push_status(MockStatus::Operating);
    t.push_status(MockStatus::Operating);
    t.push_status(MockStatus::Completed);
    // Job 2: readiness, then one immediate completion.
    t.push_status(MockStatus::Operating);
    t.push_status(MockStatus::Completed);

    tb.manager
        .submit_job("j1", "d1", Workload::manual("w1", vec![json!({"op": "a"})]))
        .await
        .unwrap();

    let manager = tb.manager.clone();
    let second = tokio::spawn(async move {
        manager
            .submit_job("j2", "d1", Workload::manual("w2", vec![json!({"op": "b"})]))
            .await
    });

    // While j1 holds the device, j2 must still be starting.
    tokio::time::sleep(Duration::from_millis(15)).await;
    let s2 = tb.manager.get_state("j2").await.unwrap();
    assert_eq!(s2.status, JobStatus::Starting);

    second.await.unwrap().unwrap();
    let f1 = wait_for_terminal(&tb.manager, "j1").await;
    let f2 = wait_for_terminal(&tb.manager, "j2").await;
    assert_eq!(f1.status, JobStatus::Completed);
    assert_eq!(f2.status, JobStatus::Completed);

    // All of j1's inbox traffic strictly precedes all of j2's.
    let uploads: Vec<String> = t.uploads().into_iter().map(|(r, _)| r).collect();
    assert_eq!(uploads.len(), 2);
    assert!(uploads[0].contains("/w1/"), "{uploads:?}");
    assert!(uploads[1].contains("/w2/"), "{uploads:?}");

    assert_eq!(tb.hooks.final_count("j1"), 1);
    assert_eq!(tb.hooks.final_count("j2"), 1);
}

#[tokio::test]
async fn concurrent_submissions_on_one_device_serialize() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    // Each job consumes one readiness fetch and one completed step.
    for _ in 0..3 {
        t.push_status(MockStatus::Operating);
        t.push_status(MockStatus::Completed);
    }

    let mut handles = Vec::new();
    for i in 1..=3 {
        let manager = tb.manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .submit_job(
                    &format!("j{i}"),
                    "d1",
                    Workload::manual(format!("w{i}"), vec![json!({"op": "x"})]),
                )
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    for i in 1..=3 {
        let state = wait_for_terminal(&tb.manager, &format!("j{i}")).await;
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(tb.hooks.final_count(&format!("j{i}")), 1);
    }

    // Deliveries are grouped per workload: the device never saw two jobs'
    // steps interleaved.
    let uploads: Vec<String> = t.uploads().into_iter().map(|(r, _)| r).collect();
    assert_eq!(uploads.len(), 3);
    let mut seen = Vec::new();
    for remote in &uploads {
        let workload = remote.split('/').nth(3).unwrap().to_string();
        if seen.last() != Some(&workload) {
            assert!(!seen.contains(&workload), "interleaved: {uploads:?}");
            seen.push(workload);
        }
    }
}

#[tokio::test]
async fn jobs_on_different_devices_run_concurrently() {
    let tb = bench(&["d1", "d2"]);
    for id in ["d1", "d2"] {
        let t = &tb.transports[id];
        t.push_status(MockStatus::Operating);
        t.push_status(MockStatus::Completed);
    }

    let m1 = tb.manager.clone();
    let m2 = tb.manager.clone();
    let (r1, r2) = tokio::join!(
        m1.submit_job("j1", "d1", Workload::manual("w1", vec![json!({"op": "a"})])),
        m2.submit_job("j2", "d2", Workload::manual("w2", vec![json!({"op": "b"})])),
    );
    r1.unwrap();
    r2.unwrap();

    assert_eq!(
        wait_for_terminal(&tb.manager, "j1").await.status,
        JobStatus::Completed
    );
    assert_eq!(
        wait_for_terminal(&tb.manager, "j2").await.status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn every_transition_persists_before_returning() {
    let tb = bench(&["d1"]);
    let t = &tb.transports["d1"];
    t.push_status(MockStatus::Operating);
    t.push_status(MockStatus::Completed);

    tb.manager
        .submit_job("j1", "d1", Workload::auto("w"))
        .await
        .unwrap();
    let after_submit = tb.hooks.state_count("j1");
    assert!(after_submit >= 2, "registration and waiting both persisted");

    tb.manager.step_and_wait("j1", &json!({})).await.unwrap();
    let after_step = tb.hooks.state_count("j1");
    assert!(after_step >= after_submit + 2, "running and waiting persisted");
}
