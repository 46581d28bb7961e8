//! Per-session message queue
//!
//! Every session owns one lane: an ordered, priority-aware, pausable queue drained by a
//! dedicated task. The lane pops one message, awaits the `MessageProcessor` and only
//! then pops the next, so at most one message per session is ever in flight while
//! separate sessions drain independently.

mod lane;

use crate::core_types::{ControlAction, PromptPayload, SessionId};
use crate::errors::RelayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lane::Lane;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Control,
    Prompt,
}

#[derive(Debug, Clone)]
pub enum QueueItem {
    Prompt(PromptPayload),
    Control(ControlAction),
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    pub session_id: SessionId,
    pub item: QueueItem,
    pub priority: Priority,
    pub dedup_hash: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn prompt(session_id: &str, payload: PromptPayload, dedup_hash: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            item: QueueItem::Prompt(payload),
            priority: Priority::Prompt,
            dedup_hash,
            enqueued_at: Utc::now(),
        }
    }

    pub fn control(session_id: &str, action: ControlAction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            item: QueueItem::Control(action),
            priority: Priority::Control,
            dedup_hash: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn prompt_payload(&self) -> Option<&PromptPayload> {
        match &self.item {
            QueueItem::Prompt(payload) => Some(payload),
            QueueItem::Control(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted { message_id: String, position: usize },
    Duplicate,
    /// The lane already holds `max_pending` prompts.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// `pending` plus the in-flight message, if any.
    pub length: usize,
    pub pending: usize,
    pub paused: bool,
    pub processing: bool,
}

/// Consumer of drained messages. Called once per message, never concurrently for the
/// same session. Implementations must return promptly once `cancel` fires.
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    async fn process(&self, message: QueuedMessage, cancel: CancellationToken);
}

pub struct MessageQueue {
    lanes: DashMap<SessionId, Arc<Lane>>,
    dedup_window: Duration,
    max_pending: usize,
}

impl MessageQueue {
    pub fn new(dedup_window: Duration, max_pending: usize) -> Self {
        Self {
            lanes: DashMap::new(),
            dedup_window,
            max_pending,
        }
    }

    pub fn from_config(config: &crate::config::QueueConfig) -> Self {
        Self::new(config.dedup_window(), config.max_pending)
    }

    /// Create the lane for `session_id` and start its drain task. Opening an existing
    /// lane is a no-op.
    pub fn open(&self, session_id: &str, processor: Arc<dyn MessageProcessor>) {
        if self.lanes.contains_key(session_id) {
            return;
        }
        let lane = Arc::new(Lane::new(session_id, self.dedup_window));
        self.lanes.insert(session_id.to_string(), lane.clone());
        lane::spawn_drain(lane, processor);
        log::debug!("Opened queue lane for session '{}'", session_id);
    }

    pub async fn enqueue(
        &self,
        session_id: &str,
        message: QueuedMessage,
    ) -> Result<EnqueueOutcome, RelayError> {
        let lane = self.lane(session_id)?;
        lane.push(message, self.max_pending).await
    }

    pub async fn pause(&self, session_id: &str) -> Result<(), RelayError> {
        self.lane(session_id)?.set_paused(true).await;
        Ok(())
    }

    pub async fn resume(&self, session_id: &str) -> Result<(), RelayError> {
        self.lane(session_id)?.set_paused(false).await;
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> Result<QueueStatus, RelayError> {
        Ok(self.lane(session_id)?.status().await)
    }

    /// Stop the lane, cancel the in-flight message and hand back everything undrained,
    /// in drain order. Closing an unknown lane returns nothing.
    pub async fn close(&self, session_id: &str) -> Vec<QueuedMessage> {
        match self.lanes.remove(session_id) {
            Some((_, lane)) => {
                let undrained = lane.close().await;
                log::debug!(
                    "Closed queue lane for session '{}' with {} undrained messages",
                    session_id,
                    undrained.len()
                );
                undrained
            }
            None => Vec::new(),
        }
    }

    fn lane(&self, session_id: &str) -> Result<Arc<Lane>, RelayError> {
        self.lanes
            .get(session_id)
            .map(|lane| lane.value().clone())
            .ok_or_else(|| RelayError::QueueClosed(session_id.to_string()))
    }
}
