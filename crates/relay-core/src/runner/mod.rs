//! Worker process runner
//!
//! A worker is a long-lived assistant CLI process bound to one session's working
//! directory. The `WorkerRunner` trait is the seam between the session machinery and
//! that process: spawn it, run one prompt turn while streaming classified events, check
//! its health and shut it down. `CliWorkerRunner` is the process-backed implementation.

pub mod classifier;
pub mod process;

pub use process::CliWorkerRunner;

use crate::config::WorkerSpec;
use crate::core_types::{ExecutionOutcome, PromptPayload, WorkerEvent};
use crate::errors::RelayError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Alive,
    /// Alive and mid-turn, but silent for longer than the stall threshold.
    Stalled,
    Dead,
}

/// Liveness bookkeeping shared between a runner and whoever holds the handle.
#[derive(Debug)]
pub struct WorkerActivity {
    origin: Instant,
    last_output_ms: AtomicU64,
    busy: AtomicBool,
    exited: AtomicBool,
}

impl WorkerActivity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_output_ms: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        }
    }

    pub fn record_output(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_output_ms.store(elapsed, Ordering::SeqCst);
    }

    pub fn begin_turn(&self) {
        self.record_output();
        self.busy.store(true, Ordering::SeqCst);
    }

    pub fn end_turn(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn silent_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_output_ms.load(Ordering::SeqCst)))
    }

    /// Health derived purely from bookkeeping.
    pub fn health(&self, stall_threshold: Duration) -> HealthStatus {
        if self.has_exited() {
            HealthStatus::Dead
        } else if self.is_busy() && self.silent_for() >= stall_threshold {
            HealthStatus::Stalled
        } else {
            HealthStatus::Alive
        }
    }
}

impl Default for WorkerActivity {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque reference to a spawned worker. Owned by exactly one session.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: String,
    pub session_id: String,
    pub pid: Option<u32>,
    pub activity: Arc<WorkerActivity>,
}

impl WorkerHandle {
    pub fn new(session_id: &str, pid: Option<u32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            pid,
            activity: Arc::new(WorkerActivity::new()),
        }
    }
}

#[async_trait]
pub trait WorkerRunner: Send + Sync + 'static {
    /// Start a worker for `spec`. Fails with `SpawnError` when the executable or the
    /// working directory is unusable.
    async fn spawn(&self, spec: &WorkerSpec) -> Result<WorkerHandle, RelayError>;

    /// Run one prompt turn. Classified events go to `events` in the order the worker
    /// produced them. Callers guarantee a single `execute` per handle at a time.
    async fn execute(
        &self,
        handle: &WorkerHandle,
        prompt: &PromptPayload,
        events: EventSender,
    ) -> Result<ExecutionOutcome, RelayError>;

    async fn health_check(&self, handle: &WorkerHandle) -> HealthStatus;

    /// Kill and reap the worker. Safe to call more than once.
    async fn shutdown(&self, handle: &WorkerHandle);
}
