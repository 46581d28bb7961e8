use super::{EnqueueOutcome, MessageProcessor, QueueItem, QueueStatus, QueuedMessage};
use crate::core_types::ControlAction;
use crate::errors::RelayError;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct LaneState {
    control: VecDeque<QueuedMessage>,
    prompts: VecDeque<QueuedMessage>,
    paused: bool,
    processing: bool,
    closed: bool,
    /// dedup hash -> accepted at
    recent: HashMap<String, Instant>,
}

impl LaneState {
    fn pending(&self) -> usize {
        self.control.len() + self.prompts.len()
    }

    /// Control messages drain even while paused; prompts only when running.
    fn pop_next(&mut self) -> Option<QueuedMessage> {
        if let Some(message) = self.control.pop_front() {
            return Some(message);
        }
        if self.paused {
            return None;
        }
        self.prompts.pop_front()
    }
}

pub(super) struct Lane {
    session_id: String,
    state: Mutex<LaneState>,
    wake: Notify,
    cancel: CancellationToken,
    dedup_window: Duration,
}

impl Lane {
    pub(super) fn new(session_id: &str, dedup_window: Duration) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: Mutex::new(LaneState::default()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            dedup_window,
        }
    }

    pub(super) async fn push(
        &self,
        message: QueuedMessage,
        max_pending: usize,
    ) -> Result<EnqueueOutcome, RelayError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RelayError::QueueClosed(self.session_id.clone()));
        }

        let message_id = message.id.clone();
        let position = match message.item {
            QueueItem::Control(_) => {
                state.control.push_back(message);
                state.control.len()
            }
            QueueItem::Prompt(_) => {
                let now = Instant::now();
                let window = self.dedup_window;
                state
                    .recent
                    .retain(|_, accepted| now.saturating_duration_since(*accepted) < window);

                if let Some(hash) = &message.dedup_hash {
                    if state.recent.contains_key(hash) {
                        log::info!(
                            "Dropped duplicate prompt for session '{}'",
                            self.session_id
                        );
                        return Ok(EnqueueOutcome::Duplicate);
                    }
                }
                if state.prompts.len() >= max_pending {
                    log::warn!(
                        "Queue for session '{}' is full ({} pending prompts)",
                        self.session_id,
                        state.prompts.len()
                    );
                    return Ok(EnqueueOutcome::Full);
                }
                if let Some(hash) = &message.dedup_hash {
                    state.recent.insert(hash.clone(), now);
                }
                state.prompts.push_back(message);
                state.pending()
            }
        };
        drop(state);

        self.wake.notify_one();
        Ok(EnqueueOutcome::Accepted {
            message_id,
            position,
        })
    }

    pub(super) async fn set_paused(&self, paused: bool) {
        self.state.lock().await.paused = paused;
        if !paused {
            self.wake.notify_one();
        }
        log::debug!(
            "Queue for session '{}' {}",
            self.session_id,
            if paused { "paused" } else { "resumed" }
        );
    }

    pub(super) async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        let pending = state.pending();
        QueueStatus {
            length: pending + usize::from(state.processing),
            pending,
            paused: state.paused,
            processing: state.processing,
        }
    }

    pub(super) async fn close(&self) -> Vec<QueuedMessage> {
        self.cancel.cancel();
        let mut state = self.state.lock().await;
        state.closed = true;
        let mut undrained: Vec<QueuedMessage> = state.control.drain(..).collect();
        undrained.extend(state.prompts.drain(..));
        undrained
    }

    async fn next(&self) -> Option<QueuedMessage> {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(message) = state.pop_next() {
                    if let QueueItem::Control(action) = &message.item {
                        match action {
                            ControlAction::Pause => state.paused = true,
                            ControlAction::Resume => state.paused = false,
                            ControlAction::Stop => {}
                        }
                    }
                    state.processing = true;
                    return Some(message);
                }
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    async fn finish(&self) {
        self.state.lock().await.processing = false;
    }
}

/// Start the drain task for `lane`. It exits once the lane is closed.
pub(super) fn spawn_drain(lane: Arc<Lane>, processor: Arc<dyn MessageProcessor>) {
    tokio::spawn(async move {
        while let Some(message) = lane.next().await {
            log::debug!(
                "Session '{}' processing message {}",
                lane.session_id,
                message.id
            );
            processor.process(message, lane.cancel.child_token()).await;
            lane.finish().await;
        }
        log::debug!("Drain task for session '{}' stopped", lane.session_id);
    });
}
