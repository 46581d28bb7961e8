//! Lane processor: runs one queued message against the session's worker.

use super::types::{BufferEntryKind, Session, SessionState, TerminationReason};
use super::ManagerInner;
use crate::core_types::{ControlAction, ExecutionOutcome, PromptPayload};
use crate::delivery::Notification;
use crate::errors::RelayError;
use crate::queue::{EnqueueOutcome, MessageProcessor, QueueItem, QueuedMessage};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(super) struct SessionProcessor {
    manager: Weak<ManagerInner>,
}

impl SessionProcessor {
    pub(super) fn new(manager: Weak<ManagerInner>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MessageProcessor for SessionProcessor {
    async fn process(&self, message: QueuedMessage, cancel: CancellationToken) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let Ok(session) = manager.session(&message.session_id) else {
            log::debug!(
                "Dropping message '{}' for vanished session '{}'",
                message.id,
                message.session_id
            );
            return;
        };

        match message.item {
            QueueItem::Control(action) => manager.apply_control(&session, action).await,
            QueueItem::Prompt(payload) => {
                manager.run_turn(&session, &message.id, payload, cancel).await
            }
        }
    }
}

impl ManagerInner {
    /// The lane has already flipped its pause flag by the time this runs.
    async fn apply_control(&self, session: &Session, action: ControlAction) {
        match action {
            ControlAction::Resume => {
                if self.agent.resume(&session.id) {
                    log::info!("Auto-continue resumed for session '{}'", session.id);
                }
            }
            ControlAction::Pause => {}
            ControlAction::Stop => {
                self.terminate(&session.id, TerminationReason::UserStop).await;
            }
        }
        self.delivery
            .deliver_control_ack(session.owner(), &session.id, action)
            .await;
    }

    async fn run_turn(
        &self,
        session: &Arc<Session>,
        message_id: &str,
        payload: PromptPayload,
        cancel: CancellationToken,
    ) {
        {
            let mut inner = session.inner.lock().await;
            if inner.state.is_live() {
                session.push_entry(&mut inner, BufferEntryKind::Prompt(payload.origin), &payload.text);
                inner.last_activity_at = Utc::now();
            }
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let outcome = if cancel.is_cancelled() {
            None
        } else {
            let execute = self.runner.execute(&session.worker, &payload, events_tx);
            tokio::pin!(execute);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break None,
                    Some(event) = events_rx.recv() => self.on_worker_output(session, event).await,
                    outcome = &mut execute => break Some(outcome),
                }
            }
        };

        let Some(outcome) = outcome else {
            self.report_cancelled(session, message_id).await;
            return;
        };
        // The sender went away with `execute`; flush what the worker produced last.
        while let Ok(event) = events_rx.try_recv() {
            self.on_worker_output(session, event).await;
        }

        match outcome {
            Ok(ExecutionOutcome::Completed { text }) => {
                self.finish_turn(session, message_id, &text, false).await
            }
            Ok(ExecutionOutcome::Failed { message }) => {
                self.finish_turn(session, message_id, &message, true).await
            }
            Ok(ExecutionOutcome::SoftStopped { text }) => {
                self.record_response(session, &text).await;
                let result = Notification::result(&session.id, text)
                    .with_metadata("message_id", message_id)
                    .with_metadata("soft_stop", true);
                self.delivery.deliver_result(session.owner(), result).await;
                // A limit signal takes the process with it; the next prompt starts fresh.
                if session.worker.activity.has_exited() {
                    self.terminate(&session.id, TerminationReason::ResourceLimit).await;
                }
            }
            Err(e) => self.fail_turn(session, message_id, e).await,
        }
    }

    async fn report_cancelled(&self, session: &Session, message_id: &str) {
        let reason = session
            .inner
            .lock()
            .await
            .termination_reason
            .clone()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "cancelled".to_string());
        log::info!(
            "In-flight message '{}' for session '{}': {}",
            message_id,
            session.id,
            RelayError::Cancelled(reason.clone())
        );
        let error = Notification::error(
            &session.id,
            format!("Your message did not finish: {}.", reason),
        )
        .with_metadata("message_id", message_id);
        self.delivery.deliver_error(session.owner(), error).await;
    }

    async fn record_response(&self, session: &Session, text: &str) {
        let mut inner = session.inner.lock().await;
        if !inner.state.is_live() {
            return;
        }
        inner.turn_count += 1;
        inner.state = SessionState::Idle;
        inner.last_activity_at = Utc::now();
        session.push_entry(&mut inner, BufferEntryKind::Response, text);
    }

    /// Agent first, then delivery, then any follow-up the agent asked for.
    async fn finish_turn(&self, session: &Session, message_id: &str, text: &str, failed: bool) {
        self.record_response(session, text).await;

        let decision = self.agent.analyze(&session.id, text, failed).await;
        let mut notification = if failed {
            Notification::error(&session.id, text)
        } else {
            Notification::result(&session.id, text)
        }
        .with_metadata("message_id", message_id);
        if self.agent.is_enabled() {
            notification = notification
                .with_metadata("agent", decision.summary())
                .with_metadata(
                    "agent_action",
                    serde_json::to_value(decision.action).unwrap_or_default(),
                );
        }

        if failed {
            self.delivery.deliver_error(session.owner(), notification).await;
        } else {
            self.delivery.deliver_result(session.owner(), notification).await;
        }

        if !decision.should_continue {
            return;
        }
        let Some(follow_up) = decision.follow_up else {
            return;
        };
        let message =
            QueuedMessage::prompt(&session.id, PromptPayload::from_agent(session.owner(), follow_up), None);
        match self.queue.enqueue(&session.id, message).await {
            Ok(EnqueueOutcome::Accepted { message_id, .. }) => log::debug!(
                "Queued agent follow-up '{}' for session '{}'",
                message_id,
                session.id
            ),
            Ok(outcome) => log::warn!(
                "Agent follow-up for session '{}' not queued: {:?}",
                session.id,
                outcome
            ),
            Err(e) => log::debug!("Agent follow-up for session '{}' dropped: {}", session.id, e),
        }
    }

    async fn fail_turn(&self, session: &Session, message_id: &str, error: RelayError) {
        log::error!(
            "Prompt '{}' for session '{}' failed: {}",
            message_id,
            session.id,
            error
        );
        let notification = Notification::error(&session.id, error.to_string())
            .with_metadata("message_id", message_id);
        self.delivery.deliver_error(session.owner(), notification).await;

        if error.is_fatal_for_session() {
            let reason = match error {
                RelayError::WorkerCrash { message, .. } => TerminationReason::WorkerCrash(message),
                other => TerminationReason::WorkerCrash(other.to_string()),
            };
            self.terminate(&session.id, reason).await;
        } else {
            let mut inner = session.inner.lock().await;
            if inner.state.is_live() {
                inner.state = SessionState::Idle;
            }
        }
    }
}
