mod common;

use common::{harness, prompt, test_config, token, wait_for, Turn};
use relay_core::continuation::{AgentState, DecisionAction};
use relay_core::core_types::PromptOrigin;
use relay_core::delivery::NotificationKind;
use relay_core::session::SubmitReceipt;
use std::time::Duration;

const DIR: &str = "/work/agent";

fn agent_config(max_iterations: u32) -> relay_core::config::RelayConfig {
    let mut config = test_config();
    config.agent.enabled = true;
    config.agent.max_iterations = max_iterations;
    config
}

#[tokio::test]
async fn test_agent_continues_until_iteration_cap() {
    let h = harness(agent_config(1));
    h.runner
        .push_turn(Turn::reply("The parser compiles. Next, I'll wire it into the CLI."));
    h.runner
        .push_turn(Turn::reply("CLI wired. Next, I'll add the integration tests."));

    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "build the parser"))
        .await
        .unwrap();
    let session_id = match receipt {
        SubmitReceipt::Queued { session_id, .. } => session_id,
        other => panic!("unexpected receipt {:?}", other),
    };

    let tok = token("phone");
    wait_for("two results", || h.transport.count(&tok, NotificationKind::Result) == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // One automatic continuation, then the cap pauses the agent.
    assert_eq!(
        h.runner.prompt_texts(),
        vec!["build the parser", "Continue with the next step."]
    );
    let origins: Vec<PromptOrigin> = h
        .runner
        .prompts
        .lock()
        .unwrap()
        .iter()
        .map(|(_, p)| p.origin)
        .collect();
    assert_eq!(origins, vec![PromptOrigin::User, PromptOrigin::Agent]);

    let snapshot = h.relay.agent().snapshot(&session_id).unwrap();
    assert_eq!(snapshot.state, AgentState::Paused);

    let results = h.transport.sent_to(&tok);
    let last = results
        .iter()
        .filter(|p| p.kind == NotificationKind::Result)
        .last()
        .unwrap();
    assert_eq!(
        last.metadata.get("agent_action"),
        Some(&serde_json::to_value(DecisionAction::PausedForReview).unwrap())
    );
}

#[tokio::test]
async fn test_destructive_question_reaches_human() {
    let h = harness(agent_config(10));
    h.runner.push_turn(Turn::reply(
        "The disk is full. I can run rm -rf ./data to free space. Should I do that?",
    ));

    let receipt = h
        .relay
        .submit_prompt(prompt("alice", "phone", DIR, "why is the build failing"))
        .await
        .unwrap();
    let session_id = match receipt {
        SubmitReceipt::Queued { session_id, .. } => session_id,
        other => panic!("unexpected receipt {:?}", other),
    };

    let tok = token("phone");
    wait_for("result", || h.transport.count(&tok, NotificationKind::Result) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.runner.prompt_texts().len(), 1);
    assert_eq!(
        h.relay.agent().snapshot(&session_id).unwrap().state,
        AgentState::Escalated
    );
    let pushed = h
        .transport
        .sent_to(&tok)
        .into_iter()
        .find(|p| p.kind == NotificationKind::Result)
        .unwrap();
    let note = pushed.metadata.get("agent").and_then(|v| v.as_str()).unwrap();
    assert!(note.starts_with("Needs your attention"));
}

#[tokio::test]
async fn test_disabled_agent_never_enqueues() {
    let h = harness(test_config());
    h.runner
        .push_turn(Turn::reply("Step 1 done. Next, I'll do step 2."));

    h.relay
        .submit_prompt(prompt("alice", "phone", DIR, "start"))
        .await
        .unwrap();
    let tok = token("phone");
    wait_for("result", || h.transport.count(&tok, NotificationKind::Result) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.runner.prompt_texts(), vec!["start"]);
    let pushed = h.transport.sent_to(&tok);
    assert!(pushed.iter().all(|p| !p.metadata.contains_key("agent")));
}
