#![allow(dead_code)]

use async_trait::async_trait;
use relay_core::config::{RelayConfig, WorkerSpec};
use relay_core::core_types::{
    ExecutionOutcome, InboundPrompt, Platform, PromptPayload, WorkerEvent,
};
use relay_core::delivery::{InMemoryBodyStore, NotificationKind, NotificationPayload, PushTransport};
use relay_core::errors::{RelayError, TransportError};
use relay_core::runner::{EventSender, HealthStatus, WorkerHandle, WorkerRunner};
use relay_core::Relay;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// One scripted worker turn.
pub struct Turn {
    pub events: Vec<WorkerEvent>,
    pub outcome: Result<ExecutionOutcome, RelayError>,
    pub gate: Option<Arc<Notify>>,
    pub delay: Option<Duration>,
}

impl Turn {
    pub fn reply(text: &str) -> Self {
        Self {
            events: Vec::new(),
            outcome: Ok(ExecutionOutcome::Completed {
                text: text.to_string(),
            }),
            gate: None,
            delay: None,
        }
    }

    pub fn outcome(outcome: Result<ExecutionOutcome, RelayError>) -> Self {
        Self {
            events: Vec::new(),
            outcome,
            gate: None,
            delay: None,
        }
    }

    pub fn with_events(mut self, events: Vec<WorkerEvent>) -> Self {
        self.events = events;
        self
    }

    /// Block after emitting events until the gate is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Scripted stand-in for the worker process. Unscripted turns echo the prompt.
#[derive(Default)]
pub struct MockRunner {
    turns: Mutex<VecDeque<Turn>>,
    spawn_error: Mutex<Option<RelayError>>,
    health: Mutex<HashMap<String, HealthStatus>>,
    in_flight: Mutex<HashMap<String, usize>>,
    pub spawned: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub prompts: Mutex<Vec<(String, PromptPayload)>>,
    pub shutdowns: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_turn(&self, turn: Turn) {
        self.turns.lock().unwrap().push_back(turn);
    }

    pub fn fail_next_spawn(&self, error: RelayError) {
        *self.spawn_error.lock().unwrap() = Some(error);
    }

    pub fn set_health(&self, session_id: &str, status: HealthStatus) {
        self.health
            .lock()
            .unwrap()
            .insert(session_id.to_string(), status);
    }

    pub fn prompt_texts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.text.clone())
            .collect()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkerRunner for MockRunner {
    async fn spawn(&self, spec: &WorkerSpec) -> Result<WorkerHandle, RelayError> {
        if let Some(error) = self.spawn_error.lock().unwrap().take() {
            return Err(error);
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(WorkerHandle::new(&spec.session_id, Some(4242)))
    }

    async fn execute(
        &self,
        handle: &WorkerHandle,
        prompt: &PromptPayload,
        events: EventSender,
    ) -> Result<ExecutionOutcome, RelayError> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(handle.session_id.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.prompts
            .lock()
            .unwrap()
            .push((handle.session_id.clone(), prompt.clone()));

        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Turn::reply(&format!("echo: {}", prompt.text)));

        handle.activity.begin_turn();
        for event in turn.events {
            handle.activity.record_output();
            let _ = events.send(event);
        }
        if let Some(delay) = turn.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gate) = turn.gate {
            gate.notified().await;
        }
        handle.activity.end_turn();

        *self
            .in_flight
            .lock()
            .unwrap()
            .get_mut(&handle.session_id)
            .unwrap() -= 1;
        turn.outcome
    }

    async fn health_check(&self, handle: &WorkerHandle) -> HealthStatus {
        self.health
            .lock()
            .unwrap()
            .get(&handle.session_id)
            .copied()
            .unwrap_or(HealthStatus::Alive)
    }

    async fn shutdown(&self, handle: &WorkerHandle) {
        self.shutdowns.lock().unwrap().push(handle.session_id.clone());
        handle.activity.mark_exited();
    }
}

/// Records every push and answers with scripted outcomes per token.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, NotificationPayload)>>,
    scripts: Mutex<HashMap<String, VecDeque<Result<(), TransportError>>>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, token: &str, outcomes: Vec<Result<(), TransportError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(token.to_string(), outcomes.into());
    }

    pub fn sent(&self) -> Vec<(String, NotificationPayload)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, token: &str) -> Vec<NotificationPayload> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == token)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn count(&self, token: &str, kind: NotificationKind) -> usize {
        self.sent_to(token).iter().filter(|p| p.kind == kind).count()
    }

    pub fn bodies(&self, token: &str, kind: NotificationKind) -> Vec<String> {
        self.sent_to(token)
            .into_iter()
            .filter(|p| p.kind == kind)
            .filter_map(|p| p.body)
            .collect()
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn send(&self, payload: &NotificationPayload, token: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((token.to_string(), payload.clone()));
        match self.scripts.lock().unwrap().get_mut(token) {
            Some(outcomes) => outcomes.pop_front().unwrap_or(Ok(())),
            None => Ok(()),
        }
    }
}

pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.delivery.backoff_step_ms = 1;
    config.sessions.progress_notifications = true;
    config
}

pub struct Harness {
    pub relay: Arc<Relay>,
    pub runner: Arc<MockRunner>,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<InMemoryBodyStore>,
}

pub fn harness(config: RelayConfig) -> Harness {
    let runner = MockRunner::new();
    let transport = RecordingTransport::new();
    let store = Arc::new(InMemoryBodyStore::new(config.delivery.body_ttl()));
    let relay = Relay::builder(config)
        .with_runner(runner.clone())
        .with_transport(transport.clone())
        .with_body_store(store.clone())
        .build()
        .expect("relay builds");
    Harness {
        relay: Arc::new(relay),
        runner,
        transport,
        store,
    }
}

pub fn token(device_id: &str) -> String {
    format!("tok-{}", device_id)
}

/// A prompt that also registers the sending device.
pub fn prompt(user_id: &str, device_id: &str, dir: &str, text: &str) -> InboundPrompt {
    InboundPrompt {
        user_id: user_id.to_string(),
        device_id: device_id.to_string(),
        working_directory: PathBuf::from(dir),
        prompt_text: text.to_string(),
        attachments: Vec::new(),
        push_token: Some(token(device_id)),
        platform: Some(Platform::Ios),
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll a session until it reaches `state` or five seconds pass.
pub async fn wait_for_state(relay: &Relay, session_id: &str, state: relay_core::session::SessionState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(snapshot) = relay.sessions().status(session_id).await {
            if snapshot.state == state {
                return;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for session {} to reach {:?}", session_id, state);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
