mod common;

use common::{harness, prompt, test_config, token, wait_for, wait_for_state, Turn};
use relay_core::core_types::{
    ControlAction, ControlRequest, DeviceRegistration, ExecutionOutcome, Platform, PromptOrigin,
    WorkerEvent,
};
use relay_core::delivery::NotificationKind;
use relay_core::errors::RelayError;
use relay_core::runner::HealthStatus;
use relay_core::session::{SessionState, SubmitReceipt, TerminationReason};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const DIR: &str = "/work/app";

fn queued_session(receipt: &SubmitReceipt) -> String {
    match receipt {
        SubmitReceipt::Queued { session_id, .. } => session_id.clone(),
        other => panic!("expected a queued receipt, got {:?}", other),
    }
}

fn control(action: ControlAction) -> ControlRequest {
    ControlRequest {
        user_id: "alice".into(),
        device_id: "phone".into(),
        working_directory: PathBuf::from(DIR),
        action,
    }
}

#[tokio::test]
async fn test_first_prompt_creates_starting_session() {
    let h = harness(test_config());
    let gate = Arc::new(Notify::new());
    h.runner.push_turn(Turn::reply("All set.").gated(gate.clone()));

    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "P1"))
        .await
        .unwrap();
    let session_id = queued_session(&receipt);

    let snapshot = h.relay.sessions().status(&session_id).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Starting);
    assert_eq!(snapshot.owner_user_id, "alice");
    assert_eq!(snapshot.working_directory, PathBuf::from(DIR));
    assert_eq!(snapshot.queue.unwrap().length, 1);

    gate.notify_one();
    let tok = token("phone");
    wait_for("result", || h.transport.count(&tok, NotificationKind::Result) == 1).await;
    assert_eq!(h.transport.bodies(&tok, NotificationKind::Result), vec!["All set."]);

    wait_for_state(&h.relay, &session_id, SessionState::Idle).await;
    let snapshot = h.relay.sessions().status(&session_id).await.unwrap();
    assert_eq!(snapshot.turn_count, 1);
    assert_eq!(snapshot.queue.unwrap().length, 0);
}

#[tokio::test]
async fn test_same_prompt_from_two_devices_runs_once() {
    let h = harness(test_config());
    h.relay.register_device(&DeviceRegistration {
        device_id: "tablet".into(),
        user_id: "alice".into(),
        push_token: token("tablet"),
        platform: Platform::Android,
    });

    let first = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "run the tests"))
        .await
        .unwrap();
    let second = h
        .relay
        .submit_prompt(prompt("alice", "tablet", DIR, "  run the   tests "))
        .await
        .unwrap();

    let session_id = queued_session(&first);
    assert_eq!(
        second,
        SubmitReceipt::Duplicate {
            session_id: Some(session_id)
        }
    );

    for device in ["phone", "tablet"] {
        let tok = token(device);
        wait_for("result on every device", || {
            h.transport.count(&tok, NotificationKind::Result) == 1
        })
        .await;
    }
    assert_eq!(h.runner.prompt_texts(), vec!["run the tests"]);
    assert_eq!(h.runner.spawned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_same_text_in_other_directory_is_not_duplicate() {
    let h = harness(test_config());
    let a = h
        .relay
        .submit_prompt(prompt("alice", "phone", "/work/a", "status"))
        .await
        .unwrap();
    let b = h
        .relay
        .submit_prompt(prompt("alice", "phone", "/work/b", "status"))
        .await
        .unwrap();
    assert_ne!(queued_session(&a), queued_session(&b));
    assert_eq!(h.runner.spawned.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_prompts_in_one_session_never_overlap() {
    let h = harness(test_config());
    for i in 0..4 {
        h.runner
            .push_turn(Turn::reply(&format!("reply {}", i)).delayed(Duration::from_millis(20)));
    }

    for i in 0..4 {
        h.relay
            .submit_prompt(prompt("alice", "phone", DIR, &format!("step {}", i)))
            .await
            .unwrap();
    }

    let tok = token("phone");
    wait_for("four results", || h.transport.count(&tok, NotificationKind::Result) == 4).await;
    assert_eq!(h.runner.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.runner.prompt_texts(),
        vec!["step 0", "step 1", "step 2", "step 3"]
    );
    assert_eq!(
        h.transport.bodies(&tok, NotificationKind::Result),
        vec!["reply 0", "reply 1", "reply 2", "reply 3"]
    );
}

#[tokio::test]
async fn test_sessions_do_not_block_each_other() {
    let h = harness(test_config());
    let gate = Arc::new(Notify::new());
    h.runner.push_turn(Turn::reply("slow").gated(gate.clone()));

    h.relay
        .submit_prompt(prompt("alice", "phone", "/work/slow", "long job"))
        .await
        .unwrap();
    wait_for("slow turn started", || h.runner.prompt_texts().len() == 1).await;

    h.relay
        .submit_prompt(prompt("bob", "laptop", "/work/fast", "quick one"))
        .await
        .unwrap();
    let bob = token("laptop");
    wait_for("bob's result", || h.transport.count(&bob, NotificationKind::Result) == 1).await;
    assert_eq!(h.transport.count(&token("phone"), NotificationKind::Result), 0);

    gate.notify_one();
    wait_for("alice's result", || {
        h.transport.count(&token("phone"), NotificationKind::Result) == 1
    })
    .await;
}

#[tokio::test]
async fn test_events_arrive_in_worker_order() {
    let h = harness(test_config());
    let events = ["Read", "Edit", "Bash"]
        .iter()
        .map(|name| WorkerEvent::ToolUse {
            name: name.to_string(),
            input: json!({}),
        })
        .collect();
    h.runner.push_turn(Turn::reply("Done.").with_events(events));

    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "fix it"))
        .await
        .unwrap();
    let session_id = queued_session(&receipt);

    let tok = token("phone");
    wait_for("result", || h.transport.count(&tok, NotificationKind::Result) == 1).await;
    assert_eq!(
        h.transport.bodies(&tok, NotificationKind::Progress),
        vec!["Using tool: Read", "Using tool: Edit", "Using tool: Bash"]
    );
    let progress = h.transport.sent_to(&tok);
    assert!(progress
        .iter()
        .filter(|p| p.kind == NotificationKind::Progress)
        .all(|p| p.silent));
    // Progress is pushed before the final result.
    assert_eq!(progress.last().unwrap().kind, NotificationKind::Result);

    let snapshot = h.relay.sessions().status(&session_id).await.unwrap();
    let kinds: Vec<_> = snapshot.buffer.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds.first(),
        Some(&relay_core::session::BufferEntryKind::Prompt(PromptOrigin::User))
    );
    assert_eq!(
        kinds.last(),
        Some(&relay_core::session::BufferEntryKind::Response)
    );
    assert_eq!(snapshot.buffer.len(), 5);
}

#[tokio::test]
async fn test_stall_alerts_once_and_keeps_worker() {
    let h = harness(test_config());
    let gate = Arc::new(Notify::new());
    h.runner.push_turn(
        Turn::reply("finally done")
            .with_events(vec![WorkerEvent::PlainText {
                text: "thinking".into(),
            }])
            .gated(gate.clone()),
    );

    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "big refactor"))
        .await
        .unwrap();
    let session_id = queued_session(&receipt);
    wait_for_state(&h.relay, &session_id, SessionState::Active).await;

    h.runner.set_health(&session_id, HealthStatus::Stalled);
    let first = h.relay.sessions().check_health().await;
    let second = h.relay.sessions().check_health().await;
    assert_eq!(first.alerts_sent, 1);
    assert_eq!(second.alerts_sent, 0);
    assert_eq!(second.stalled, 1);

    let tok = token("phone");
    assert_eq!(h.transport.count(&tok, NotificationKind::StallAlert), 1);
    let snapshot = h.relay.sessions().status(&session_id).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Stalled);
    assert_eq!(h.runner.shutdown_count(), 0);

    h.runner.set_health(&session_id, HealthStatus::Alive);
    gate.notify_one();
    wait_for("result after stall", || {
        h.transport.count(&tok, NotificationKind::Result) == 1
    })
    .await;
    wait_for_state(&h.relay, &session_id, SessionState::Idle).await;
}

#[tokio::test]
async fn test_soft_stop_delivers_pause_message() {
    let config = test_config();
    let pause_text = config.worker.soft_stop_message.clone();
    let h = harness(config);
    h.runner.push_turn(
        Turn::outcome(Ok(ExecutionOutcome::SoftStopped {
            text: pause_text.clone(),
        }))
        .with_events(vec![WorkerEvent::PlainText {
            text: "half of the ans".into(),
        }]),
    );

    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "write the whole module"))
        .await
        .unwrap();
    let session_id = queued_session(&receipt);

    let tok = token("phone");
    wait_for("soft stop result", || h.transport.count(&tok, NotificationKind::Result) == 1).await;
    assert_eq!(h.transport.bodies(&tok, NotificationKind::Result), vec![pause_text]);
    assert_eq!(h.transport.count(&tok, NotificationKind::Error), 0);

    // The session stays usable.
    h.relay
        .submit_prompt(prompt("alice", "phone", DIR, "continue"))
        .await
        .unwrap();
    wait_for("next result", || h.transport.count(&tok, NotificationKind::Result) == 2).await;
    assert_eq!(h.runner.spawned.load(Ordering::SeqCst), 1);
    assert!(h.relay.sessions().status(&session_id).await.is_ok());
}

#[tokio::test]
async fn test_oversized_result_is_fetchable() {
    let h = harness(test_config());
    let long = "x".repeat(10_000);
    h.runner.push_turn(Turn::reply(&long));

    h.relay
        .submit_prompt(prompt("alice", "phone", DIR, "dump the log"))
        .await
        .unwrap();

    let tok = token("phone");
    wait_for("result", || h.transport.count(&tok, NotificationKind::Result) == 1).await;
    let pushed = h
        .transport
        .sent_to(&tok)
        .into_iter()
        .find(|p| p.kind == NotificationKind::Result)
        .unwrap();
    assert!(pushed.encoded_len() <= 4096);
    let body_ref = pushed.body_ref.clone().expect("fetch pointer");

    let stored = h.relay.fetch_body(&body_ref).await.expect("stored body");
    assert_eq!(stored.content, long);
}

#[tokio::test]
async fn test_worker_crash_errors_every_prompt_once() {
    let h = harness(test_config());
    let gate = Arc::new(Notify::new());
    h.runner.push_turn(
        Turn::outcome(Err(RelayError::WorkerCrash {
            session_id: "ignored".into(),
            message: "exit status 3".into(),
        }))
        .gated(gate.clone()),
    );

    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "first"))
        .await
        .unwrap();
    let session_id = queued_session(&receipt);
    wait_for("first turn started", || h.runner.prompt_texts().len() == 1).await;
    h.relay
        .submit_prompt(prompt("alice", "phone", DIR, "second"))
        .await
        .unwrap();
    h.relay
        .submit_prompt(prompt("alice", "phone", DIR, "third"))
        .await
        .unwrap();

    gate.notify_one();
    let tok = token("phone");
    wait_for("three errors", || h.transport.count(&tok, NotificationKind::Error) == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.count(&tok, NotificationKind::Error), 3);
    assert_eq!(h.transport.count(&tok, NotificationKind::Result), 0);
    assert_eq!(h.runner.prompt_texts(), vec!["first"]);

    assert!(matches!(
        h.relay.sessions().status(&session_id).await,
        Err(RelayError::SessionNotFound(_))
    ));
    assert_eq!(h.runner.shutdown_count(), 1);

    // The next prompt for the key gets a fresh session and worker.
    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "try again"))
        .await
        .unwrap();
    assert_ne!(queued_session(&receipt), session_id);
    assert_eq!(h.runner.spawned.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_spawn_failure_leaves_nothing_registered() {
    let h = harness(test_config());
    h.runner
        .fail_next_spawn(RelayError::SpawnError("claude: not found".into()));

    let result = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "hello"))
        .await;
    assert!(matches!(result, Err(RelayError::SpawnError(_))));
    assert!(h.relay.sessions().is_empty());
    assert!(h.relay.sessions().find("alice", Path::new(DIR)).await.is_none());

    let tok = token("phone");
    wait_for("spawn error", || h.transport.count(&tok, NotificationKind::Error) == 1).await;

    // The retry is not swallowed as a duplicate.
    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "hello"))
        .await
        .unwrap();
    queued_session(&receipt);
}

#[tokio::test]
async fn test_stop_cancels_in_flight_and_queued() {
    let h = harness(test_config());
    let gate = Arc::new(Notify::new());
    h.runner.push_turn(Turn::reply("never seen").gated(gate));

    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "long task"))
        .await
        .unwrap();
    let session_id = queued_session(&receipt);
    wait_for("turn started", || h.runner.prompt_texts().len() == 1).await;
    h.relay
        .submit_prompt(prompt("alice", "phone", DIR, "queued task"))
        .await
        .unwrap();

    h.relay.control(control(ControlAction::Stop)).await.unwrap();

    let tok = token("phone");
    wait_for("two errors", || h.transport.count(&tok, NotificationKind::Error) == 2).await;
    assert_eq!(h.transport.count(&tok, NotificationKind::ControlAck), 1);
    assert_eq!(h.transport.count(&tok, NotificationKind::Result), 0);
    assert_eq!(h.runner.shutdown_count(), 1);

    // Terminating again is a no-op.
    assert!(
        !h.relay
            .sessions()
            .terminate(&session_id, TerminationReason::Cleared)
            .await
    );
    assert_eq!(h.runner.shutdown_count(), 1);
    assert!(matches!(
        h.relay.control(control(ControlAction::Pause)).await,
        Err(RelayError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_pause_holds_prompts_until_resume() {
    let h = harness(test_config());
    let tok = token("phone");

    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "one"))
        .await
        .unwrap();
    let session_id = queued_session(&receipt);
    wait_for("first result", || h.transport.count(&tok, NotificationKind::Result) == 1).await;

    h.relay.control(control(ControlAction::Pause)).await.unwrap();
    wait_for("pause ack", || h.transport.count(&tok, NotificationKind::ControlAck) == 1).await;

    h.relay
        .submit_prompt(prompt("alice", "phone", DIR, "two"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.runner.prompt_texts(), vec!["one"]);
    let status = h.relay.sessions().status(&session_id).await.unwrap();
    let queue = status.queue.unwrap();
    assert!(queue.paused);
    assert_eq!(queue.pending, 1);

    h.relay.control(control(ControlAction::Resume)).await.unwrap();
    wait_for("second result", || h.transport.count(&tok, NotificationKind::Result) == 2).await;
    assert_eq!(h.transport.count(&tok, NotificationKind::ControlAck), 2);
    assert_eq!(h.runner.prompt_texts(), vec!["one", "two"]);
}

#[tokio::test]
async fn test_full_queue_rejects_with_error() {
    let mut config = test_config();
    config.queue.max_pending = 1;
    let h = harness(config);
    let gate = Arc::new(Notify::new());
    h.runner.push_turn(Turn::reply("first").gated(gate.clone()));

    h.relay
        .submit_prompt(prompt("alice", "phone", DIR, "a"))
        .await
        .unwrap();
    wait_for("turn started", || h.runner.prompt_texts().len() == 1).await;
    h.relay
        .submit_prompt(prompt("alice", "phone", DIR, "b"))
        .await
        .unwrap();
    let rejected = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "c"))
        .await
        .unwrap();
    assert!(matches!(rejected, SubmitReceipt::Rejected { .. }));
    wait_for("rejection error", || {
        h.transport.count(&token("phone"), NotificationKind::Error) == 1
    })
    .await;

    gate.notify_one();
    wait_for("two results", || {
        h.transport.count(&token("phone"), NotificationKind::Result) == 2
    })
    .await;
}

#[tokio::test]
async fn test_rejected_prompt_can_be_resent() {
    let mut config = test_config();
    config.queue.max_pending = 1;
    let h = harness(config);
    let gate = Arc::new(Notify::new());
    h.runner.push_turn(Turn::reply("first").gated(gate.clone()));

    for text in ["a", "b"] {
        h.relay
            .submit_prompt(prompt("alice", "phone", DIR, text))
            .await
            .unwrap();
        wait_for("turn started", || !h.runner.prompt_texts().is_empty()).await;
    }
    let rejected = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "c"))
        .await
        .unwrap();
    assert!(matches!(rejected, SubmitReceipt::Rejected { .. }));

    gate.notify_one();
    let tok = token("phone");
    wait_for("two results", || h.transport.count(&tok, NotificationKind::Result) == 2).await;

    let retry = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "c"))
        .await
        .unwrap();
    queued_session(&retry);
    wait_for("three results", || h.transport.count(&tok, NotificationKind::Result) == 3).await;
    assert_eq!(h.runner.prompt_texts(), vec!["a", "b", "c"]);
    assert_eq!(h.transport.count(&tok, NotificationKind::Error), 1);
}

#[tokio::test]
async fn test_idle_sessions_are_evicted() {
    let h = harness(test_config());
    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "hi"))
        .await
        .unwrap();
    let session_id = queued_session(&receipt);
    wait_for_state(&h.relay, &session_id, SessionState::Idle).await;

    let sessions = h.relay.sessions();
    assert_eq!(sessions.sweep_idle().await, 0);
    let later = chrono::Utc::now() + chrono::Duration::hours(1);
    assert_eq!(sessions.sweep_idle_at(later).await, 1);
    assert!(sessions.is_empty());
    assert_eq!(h.runner.shutdown_count(), 1);
    // Nothing was queued, so nobody is notified.
    assert_eq!(h.transport.count(&token("phone"), NotificationKind::Error), 0);
}

#[tokio::test]
async fn test_dead_worker_terminates_session() {
    let h = harness(test_config());
    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "hi"))
        .await
        .unwrap();
    let session_id = queued_session(&receipt);
    wait_for_state(&h.relay, &session_id, SessionState::Idle).await;

    h.runner.set_health(&session_id, HealthStatus::Dead);
    let report = h.relay.sessions().check_health().await;
    assert_eq!(report.terminated, 1);
    assert!(h.relay.sessions().is_empty());
}

#[tokio::test]
async fn test_unregister_is_idempotent() {
    let h = harness(test_config());
    h.relay.register_device(&DeviceRegistration {
        device_id: "watch".into(),
        user_id: "alice".into(),
        push_token: token("watch"),
        platform: Platform::Ios,
    });
    assert!(h.relay.unregister_device("watch"));
    assert!(!h.relay.unregister_device("watch"));
    assert!(h.relay.devices().get("watch").is_none());
}
