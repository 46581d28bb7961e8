use crate::core_types::{PromptOrigin, SessionId, UserId};
use crate::queue::QueueStatus;
use crate::runner::WorkerHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Worker spawned, no output yet.
    Starting,
    Active,
    Idle,
    /// Mid-turn and silent past the stall threshold. Still alive.
    Stalled,
    Terminated,
}

impl SessionState {
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionState::Terminated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum TerminationReason {
    UserStop,
    Cleared,
    WorkerCrash(String),
    /// The worker exited on a resource limit after a soft stop.
    ResourceLimit,
    IdleTimeout,
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::UserStop => write!(f, "stopped by user"),
            TerminationReason::Cleared => write!(f, "session cleared"),
            TerminationReason::WorkerCrash(detail) => write!(f, "worker crashed: {}", detail),
            TerminationReason::ResourceLimit => write!(f, "worker stopped at a resource limit"),
            TerminationReason::IdleTimeout => write!(f, "idle timeout"),
            TerminationReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// One live session per (user, working directory).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: UserId,
    pub working_directory: PathBuf,
}

impl SessionKey {
    pub fn new(user_id: &str, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            user_id: user_id.to_string(),
            working_directory: working_directory.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferEntryKind {
    Prompt(PromptOrigin),
    Output,
    Response,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferEntry {
    pub kind: BufferEntryKind,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct SessionInner {
    pub state: SessionState,
    pub last_activity_at: DateTime<Utc>,
    pub buffer: VecDeque<BufferEntry>,
    pub turn_count: u64,
    pub termination_reason: Option<TerminationReason>,
}

#[derive(Debug)]
pub(crate) struct Session {
    pub id: SessionId,
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
    pub worker: WorkerHandle,
    /// Set once a stall alert went out; cleared when output resumes.
    pub stall_alerted: AtomicBool,
    pub inner: Mutex<SessionInner>,
    buffer_capacity: usize,
}

impl Session {
    pub fn new(id: &str, key: SessionKey, worker: WorkerHandle, buffer_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            key,
            created_at: now,
            worker,
            stall_alerted: AtomicBool::new(false),
            inner: Mutex::new(SessionInner {
                state: SessionState::Starting,
                last_activity_at: now,
                buffer: VecDeque::new(),
                turn_count: 0,
                termination_reason: None,
            }),
            buffer_capacity: buffer_capacity.max(1),
        }
    }

    pub fn owner(&self) -> &str {
        &self.key.user_id
    }

    pub fn push_entry(&self, inner: &mut SessionInner, kind: BufferEntryKind, text: &str) {
        inner.buffer.push_back(BufferEntry {
            kind,
            text: text.to_string(),
            at: Utc::now(),
        });
        while inner.buffer.len() > self.buffer_capacity {
            inner.buffer.pop_front();
        }
    }

    pub async fn snapshot(&self, queue: Option<QueueStatus>) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            id: self.id.clone(),
            owner_user_id: self.key.user_id.clone(),
            working_directory: self.key.working_directory.clone(),
            state: inner.state,
            created_at: self.created_at,
            last_activity_at: inner.last_activity_at,
            turn_count: inner.turn_count,
            buffer: inner.buffer.iter().cloned().collect(),
            termination_reason: inner.termination_reason.clone(),
            worker_pid: self.worker.pid,
            queue,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub owner_user_id: UserId,
    pub working_directory: PathBuf,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub turn_count: u64,
    pub buffer: Vec<BufferEntry>,
    pub termination_reason: Option<TerminationReason>,
    pub worker_pid: Option<u32>,
    pub queue: Option<QueueStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitReceipt {
    Queued {
        session_id: SessionId,
        message_id: String,
        position: usize,
    },
    /// Same content from the same user was accepted moments ago.
    Duplicate { session_id: Option<SessionId> },
    /// The session's queue is full; an error notification was sent.
    Rejected { session_id: SessionId, reason: String },
}
