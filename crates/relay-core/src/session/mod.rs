//! Session lifecycle and routing
//!
//! A session binds one (user, working directory) pair to one worker process and one
//! queue lane. The manager owns every worker handle; nothing else may talk to a worker
//! outside the lane's processor.
//!
//! ```text
//! Starting ──first output──▶ Active ──turn end──▶ Idle ──next prompt──▶ Active
//!                              │  ▲
//!                        stall │  │ output resumes
//!                              ▼  │
//!                             Stalled
//! any ──stop / crash / idle eviction / shutdown──▶ Terminated
//! ```

mod processor;
pub mod types;

pub use types::{
    BufferEntry, BufferEntryKind, SessionKey, SessionSnapshot, SessionState, SubmitReceipt,
    TerminationReason,
};

use crate::config::{SessionConfig, WorkerConfig, WorkerSpec};
use crate::continuation::ContinuationAgent;
use crate::core_types::{ControlAction, PromptOrigin, PromptPayload, SessionId, WorkerEvent};
use crate::delivery::{DeliveryService, Notification};
use crate::errors::RelayError;
use crate::queue::{EnqueueOutcome, MessageQueue, QueueItem, QueuedMessage};
use crate::runner::{HealthStatus, WorkerRunner};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use processor::SessionProcessor;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Mutex;
use types::Session;

/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    worker_config: WorkerConfig,
    config: SessionConfig,
    runner: Arc<dyn WorkerRunner>,
    queue: MessageQueue,
    delivery: Arc<DeliveryService>,
    agent: Arc<ContinuationAgent>,
    sessions: DashMap<SessionId, Arc<Session>>,
    keys: DashMap<SessionKey, SessionId>,
    /// Serializes creation per key so concurrent first prompts share one worker.
    creating: DashMap<SessionKey, Arc<Mutex<()>>>,
}

/// What a health sweep found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub stalled: usize,
    pub alerts_sent: usize,
    pub terminated: usize,
}

impl SessionManager {
    pub fn new(
        worker_config: WorkerConfig,
        config: SessionConfig,
        runner: Arc<dyn WorkerRunner>,
        queue: MessageQueue,
        delivery: Arc<DeliveryService>,
        agent: Arc<ContinuationAgent>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                worker_config,
                config,
                runner,
                queue,
                delivery,
                agent,
                sessions: DashMap::new(),
                keys: DashMap::new(),
                creating: DashMap::new(),
            }),
        }
    }

    /// Find the live session for (user, directory) or start a new one. A failed spawn
    /// leaves nothing behind for the key.
    pub async fn resolve_or_create(
        &self,
        user_id: &str,
        working_directory: &Path,
    ) -> Result<SessionSnapshot, RelayError> {
        let session = self.inner.resolve_or_create(user_id, working_directory).await?;
        Ok(self.inner.snapshot(&session).await)
    }

    /// The live session id for (user, directory), if any.
    pub async fn find(&self, user_id: &str, working_directory: &Path) -> Option<SessionId> {
        let key = SessionKey::new(user_id, working_directory);
        self.inner
            .live_session(&key)
            .await
            .map(|session| session.id.clone())
    }

    /// Queue a prompt. Returns as soon as the queue has answered; the reply arrives
    /// through delivery.
    pub async fn submit(
        &self,
        session_id: &str,
        prompt: PromptPayload,
        dedup_hash: Option<String>,
    ) -> Result<SubmitReceipt, RelayError> {
        self.inner.submit(session_id, prompt, dedup_hash).await
    }

    /// Tear the session down. Returns false when it was already gone.
    pub async fn terminate(&self, session_id: &str, reason: TerminationReason) -> bool {
        self.inner.terminate(session_id, reason).await
    }

    pub async fn on_worker_output(
        &self,
        session_id: &str,
        event: WorkerEvent,
    ) -> Result<(), RelayError> {
        let session = self.inner.session(session_id)?;
        self.inner.on_worker_output(&session, event).await;
        Ok(())
    }

    /// Pause and resume go through the lane ahead of queued prompts; stop is immediate.
    pub async fn control(&self, session_id: &str, action: ControlAction) -> Result<(), RelayError> {
        self.inner.control(session_id, action).await
    }

    pub async fn status(&self, session_id: &str) -> Result<SessionSnapshot, RelayError> {
        let session = self.inner.session(session_id)?;
        Ok(self.inner.snapshot(&session).await)
    }

    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> =
            self.inner.sessions.iter().map(|e| e.value().clone()).collect();
        let mut snapshots = Vec::with_capacity(sessions.len());
        for session in sessions {
            snapshots.push(self.inner.snapshot(&session).await);
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Terminate sessions idle past the configured timeout.
    pub async fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Utc::now()).await
    }

    pub async fn sweep_idle_at(&self, now: DateTime<Utc>) -> usize {
        self.inner.sweep_idle_at(now).await
    }

    /// Probe every live worker. Stalls raise one alert each; dead workers end their session.
    pub async fn check_health(&self) -> HealthReport {
        self.inner.check_health().await
    }

    /// Terminate every session. Used on server shutdown.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
        let mut terminated = 0;
        for id in ids {
            if self.inner.terminate(&id, TerminationReason::Shutdown).await {
                terminated += 1;
            }
        }
        terminated
    }
}

impl ManagerInner {
    fn session(&self, session_id: &str) -> Result<Arc<Session>, RelayError> {
        self.sessions
            .get(session_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))
    }

    async fn live_session(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let id = self.keys.get(key).map(|e| e.value().clone())?;
        let session = self.session(&id).ok()?;
        let live = session.inner.lock().await.state.is_live();
        live.then_some(session)
    }

    async fn snapshot(&self, session: &Session) -> SessionSnapshot {
        let queue = self.queue.status(&session.id).await.ok();
        session.snapshot(queue).await
    }

    async fn resolve_or_create(
        self: &Arc<Self>,
        user_id: &str,
        working_directory: &Path,
    ) -> Result<Arc<Session>, RelayError> {
        let key = SessionKey::new(user_id, working_directory);
        if let Some(session) = self.live_session(&key).await {
            return Ok(session);
        }

        let lock = self.creating.entry(key.clone()).or_default().value().clone();
        let created = {
            let _guard = lock.lock().await;
            match self.live_session(&key).await {
                Some(session) => Ok(session),
                None => self.create(key.clone(), user_id, working_directory).await,
            }
        };
        drop(lock);
        // Only the map still holds the lock once no other caller is waiting on it.
        self.creating
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        created
    }

    async fn create(
        self: &Arc<Self>,
        key: SessionKey,
        user_id: &str,
        working_directory: &Path,
    ) -> Result<Arc<Session>, RelayError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let spec = WorkerSpec::from_config(
            &self.worker_config,
            &session_id,
            working_directory.to_path_buf(),
        );
        let worker = self.runner.spawn(&spec).await.map_err(|e| {
            log::error!(
                "Failed to start worker for user '{}' in {}: {}",
                user_id,
                working_directory.display(),
                e
            );
            e
        })?;

        let session = Arc::new(Session::new(
            &session_id,
            key.clone(),
            worker,
            self.config.buffer_capacity,
        ));
        self.sessions.insert(session_id.clone(), session.clone());
        self.keys.insert(key, session_id.clone());
        self.queue
            .open(&session_id, Arc::new(SessionProcessor::new(Arc::downgrade(self))));

        log::info!(
            "Created session '{}' for user '{}' in {}",
            session_id,
            user_id,
            working_directory.display()
        );
        Ok(session)
    }

    async fn submit(
        &self,
        session_id: &str,
        prompt: PromptPayload,
        dedup_hash: Option<String>,
    ) -> Result<SubmitReceipt, RelayError> {
        let session = self.session(session_id)?;
        if !session.inner.lock().await.state.is_live() {
            return Err(RelayError::SessionTerminated(session_id.to_string()));
        }

        let origin = prompt.origin;
        let message = QueuedMessage::prompt(session_id, prompt, dedup_hash);
        let outcome = self
            .queue
            .enqueue(session_id, message)
            .await
            .map_err(|e| match e {
                RelayError::QueueClosed(id) => RelayError::SessionTerminated(id),
                other => other,
            })?;

        match outcome {
            EnqueueOutcome::Accepted {
                message_id,
                position,
            } => {
                if origin == PromptOrigin::User {
                    self.agent.note_human_prompt(session_id);
                }
                log::debug!(
                    "Queued {:?} prompt '{}' for session '{}' at position {}",
                    origin,
                    message_id,
                    session_id,
                    position
                );
                Ok(SubmitReceipt::Queued {
                    session_id: session_id.to_string(),
                    message_id,
                    position,
                })
            }
            EnqueueOutcome::Duplicate => Ok(SubmitReceipt::Duplicate {
                session_id: Some(session_id.to_string()),
            }),
            EnqueueOutcome::Full => {
                let reason = "Too many messages are waiting for this session. Try again once it catches up.";
                self.delivery
                    .spawn_errors(session.owner(), vec![Notification::error(session_id, reason)]);
                Ok(SubmitReceipt::Rejected {
                    session_id: session_id.to_string(),
                    reason: reason.to_string(),
                })
            }
        }
    }

    async fn terminate(&self, session_id: &str, reason: TerminationReason) -> bool {
        let Ok(session) = self.session(session_id) else {
            return false;
        };
        {
            let mut inner = session.inner.lock().await;
            if !inner.state.is_live() {
                return false;
            }
            inner.state = SessionState::Terminated;
            inner.termination_reason = Some(reason.clone());
            inner.last_activity_at = Utc::now();
            inner.buffer.clear();
        }

        self.keys.remove_if(&session.key, |_, id| id == session_id);
        let undrained = self.queue.close(session_id).await;
        self.runner.shutdown(&session.worker).await;
        self.agent.remove(session_id);
        self.sessions.remove(session_id);

        log::info!(
            "Terminated session '{}' ({}); {} queued messages dropped",
            session_id,
            reason,
            undrained.len()
        );

        let errors: Vec<Notification> = undrained
            .into_iter()
            .filter(|message| matches!(message.item, QueueItem::Prompt(_)))
            .map(|message| {
                Notification::error(session_id, format!("Your message was not run: {}.", reason))
                    .with_metadata("message_id", message.id)
            })
            .collect();
        if !errors.is_empty() {
            self.delivery.spawn_errors(session.owner(), errors);
        }
        true
    }

    async fn on_worker_output(&self, session: &Session, event: WorkerEvent) {
        let resumed = {
            let mut inner = session.inner.lock().await;
            if !inner.state.is_live() {
                return;
            }
            let resumed = inner.state == SessionState::Stalled;
            inner.state = SessionState::Active;
            inner.last_activity_at = Utc::now();
            session.push_entry(&mut inner, BufferEntryKind::Output, &event.summary());
            resumed
        };
        if resumed {
            session.stall_alerted.store(false, Ordering::SeqCst);
            log::info!("Worker for session '{}' produced output again", session.id);
        }

        if self.config.progress_notifications && is_progress(&event) {
            let progress = Notification::progress(&session.id, event.summary())
                .with_metadata("event", event.kind());
            self.delivery.deliver_progress(session.owner(), progress).await;
        }
    }

    async fn control(&self, session_id: &str, action: ControlAction) -> Result<(), RelayError> {
        let session = self.session(session_id)?;
        match action {
            ControlAction::Stop => {
                self.terminate(session_id, TerminationReason::UserStop).await;
                self.delivery
                    .deliver_control_ack(session.owner(), session_id, action)
                    .await;
                Ok(())
            }
            ControlAction::Pause | ControlAction::Resume => {
                let message = QueuedMessage::control(session_id, action);
                self.queue
                    .enqueue(session_id, message)
                    .await
                    .map_err(|e| match e {
                        RelayError::QueueClosed(id) => RelayError::SessionTerminated(id),
                        other => other,
                    })?;
                Ok(())
            }
        }
    }

    async fn sweep_idle_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = match chrono::Duration::from_std(self.config.idle_timeout()) {
            Ok(timeout) => now - timeout,
            Err(_) => return 0,
        };

        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut evicted = 0;
        for session in sessions {
            let expired = {
                let inner = session.inner.lock().await;
                matches!(inner.state, SessionState::Idle | SessionState::Starting)
                    && inner.last_activity_at < cutoff
            };
            if !expired {
                continue;
            }
            let busy = self
                .queue
                .status(&session.id)
                .await
                .map(|status| status.length > 0)
                .unwrap_or(false);
            if busy {
                continue;
            }
            if self.terminate(&session.id, TerminationReason::IdleTimeout).await {
                evicted += 1;
            }
        }
        if evicted > 0 {
            log::info!("Idle sweep evicted {} sessions", evicted);
        }
        evicted
    }

    async fn check_health(&self) -> HealthReport {
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut report = HealthReport::default();

        for session in sessions {
            if !session.inner.lock().await.state.is_live() {
                continue;
            }
            report.checked += 1;

            match self.runner.health_check(&session.worker).await {
                HealthStatus::Alive => {}
                HealthStatus::Stalled => {
                    report.stalled += 1;
                    {
                        let mut inner = session.inner.lock().await;
                        if !inner.state.is_live() {
                            continue;
                        }
                        inner.state = SessionState::Stalled;
                    }
                    if !session.stall_alerted.swap(true, Ordering::SeqCst) {
                        let silent_for = session.worker.activity.silent_for();
                        log::warn!(
                            "{} after {:?} without output",
                            RelayError::StallTimeout(session.id.clone()),
                            silent_for
                        );
                        self.delivery
                            .deliver_stall_alert(session.owner(), &session.id, silent_for)
                            .await;
                        report.alerts_sent += 1;
                    }
                }
                HealthStatus::Dead => {
                    log::warn!("Worker for session '{}' is gone", session.id);
                    let reason = TerminationReason::WorkerCrash("worker exited".to_string());
                    if self.terminate(&session.id, reason).await {
                        report.terminated += 1;
                    }
                }
            }
        }
        report
    }
}

/// Events worth a silent progress push.
fn is_progress(event: &WorkerEvent) -> bool {
    matches!(
        event,
        WorkerEvent::ToolUse { .. } | WorkerEvent::PermissionRequest { .. } | WorkerEvent::Error { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, DeliveryConfig, DeviceConfig, QueueConfig};
    use crate::core_types::ExecutionOutcome;
    use crate::delivery::{InMemoryBodyStore, NotificationPayload, PushTransport};
    use crate::devices::DeviceRegistry;
    use crate::errors::TransportError;
    use crate::runner::{EventSender, WorkerHandle};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Default)]
    struct InstantRunner {
        fail_spawn: AtomicBool,
    }

    #[async_trait]
    impl WorkerRunner for InstantRunner {
        async fn spawn(&self, spec: &WorkerSpec) -> Result<WorkerHandle, RelayError> {
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(RelayError::SpawnError("no such binary".into()));
            }
            Ok(WorkerHandle::new(&spec.session_id, None))
        }

        async fn execute(
            &self,
            _handle: &WorkerHandle,
            prompt: &PromptPayload,
            _events: EventSender,
        ) -> Result<ExecutionOutcome, RelayError> {
            Ok(ExecutionOutcome::Completed {
                text: prompt.text.clone(),
            })
        }

        async fn health_check(&self, _handle: &WorkerHandle) -> HealthStatus {
            HealthStatus::Alive
        }

        async fn shutdown(&self, handle: &WorkerHandle) {
            handle.activity.mark_exited();
        }
    }

    struct NullTransport;

    #[async_trait]
    impl PushTransport for NullTransport {
        async fn send(&self, _payload: &NotificationPayload, _token: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn manager(runner: Arc<InstantRunner>) -> SessionManager {
        let devices = Arc::new(DeviceRegistry::new(&DeviceConfig::default()));
        let delivery = Arc::new(DeliveryService::new(
            devices,
            Arc::new(NullTransport),
            Arc::new(InMemoryBodyStore::new(Duration::from_secs(60))),
            DeliveryConfig::default(),
        ));
        let agent = Arc::new(ContinuationAgent::new(AgentConfig::default()).unwrap());
        SessionManager::new(
            WorkerConfig::default(),
            SessionConfig::default(),
            runner,
            MessageQueue::from_config(&QueueConfig::default()),
            delivery,
            agent,
        )
    }

    #[tokio::test]
    async fn test_creation_locks_do_not_accumulate() {
        let runner = Arc::new(InstantRunner::default());
        let sessions = manager(runner.clone());

        let first = sessions
            .resolve_or_create("u1", Path::new("/tmp/a"))
            .await
            .unwrap();
        let again = sessions
            .resolve_or_create("u1", Path::new("/tmp/a"))
            .await
            .unwrap();
        assert_eq!(first.id, again.id);
        sessions.resolve_or_create("u1", Path::new("/tmp/b")).await.unwrap();
        assert!(sessions.inner.creating.is_empty());

        runner.fail_spawn.store(true, Ordering::SeqCst);
        assert!(sessions
            .resolve_or_create("u2", Path::new("/tmp/c"))
            .await
            .is_err());
        assert!(sessions.inner.creating.is_empty());

        assert!(sessions.terminate(&first.id, TerminationReason::Cleared).await);
        assert!(sessions.inner.creating.is_empty());
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_prompts_share_one_session() {
        let sessions = manager(Arc::new(InstantRunner::default()));
        let (a, b) = tokio::join!(
            sessions.resolve_or_create("u1", Path::new("/tmp/a")),
            sessions.resolve_or_create("u1", Path::new("/tmp/a")),
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.inner.creating.is_empty());
    }

    #[test]
    fn test_progress_classes() {
        assert!(is_progress(&WorkerEvent::ToolUse {
            name: "Bash".into(),
            input: json!({"command": "ls"})
        }));
        assert!(is_progress(&WorkerEvent::PermissionRequest {
            tool: "Edit".into(),
            description: "edit main.rs".into()
        }));
        assert!(!is_progress(&WorkerEvent::PlainText {
            text: "thinking".into()
        }));
        assert!(!is_progress(&WorkerEvent::SoftStop {
            reason: "max turns".into()
        }));
    }

    #[tokio::test]
    async fn test_buffer_is_bounded() {
        let session = Session::new(
            "s1",
            SessionKey::new("u1", "/tmp/project"),
            WorkerHandle::new("s1", None),
            3,
        );
        {
            let mut inner = session.inner.lock().await;
            for i in 0..5 {
                session.push_entry(&mut inner, BufferEntryKind::Output, &format!("line {}", i));
            }
        }
        let snapshot = session.snapshot(None).await;
        assert_eq!(snapshot.state, SessionState::Starting);
        let texts: Vec<&str> = snapshot.buffer.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_termination_reason_display() {
        assert_eq!(TerminationReason::UserStop.to_string(), "stopped by user");
        assert_eq!(
            TerminationReason::WorkerCrash("exit 3".into()).to_string(),
            "worker crashed: exit 3"
        );
    }
}
