//! Entry point for the route layer
//!
//! `Relay` wires the components together from a `RelayConfig` and exposes the handful
//! of calls an external request handler needs. Inbound prompts go through device
//! bookkeeping, duplicate detection and session resolution before they reach a queue.

use crate::config::RelayConfig;
use crate::continuation::{ContinuationAgent, DecisionModel, LearningSink};
use crate::core_types::{ControlRequest, DeviceRegistration, InboundPrompt, PromptPayload};
use crate::dedup::DuplicateDetector;
use crate::delivery::{
    DeliveryService, ExpoPushTransport, InMemoryBodyStore, MessageBodyStore, Notification,
    PushTransport, StoredBody,
};
use crate::devices::DeviceRegistry;
use crate::errors::RelayError;
use crate::queue::MessageQueue;
use crate::runner::{CliWorkerRunner, WorkerRunner};
use crate::session::{SessionManager, SessionSnapshot, SubmitReceipt};
use std::path::Path;
use std::sync::Arc;

pub struct Relay {
    config: RelayConfig,
    devices: Arc<DeviceRegistry>,
    dedup: Arc<DuplicateDetector>,
    delivery: Arc<DeliveryService>,
    agent: Arc<ContinuationAgent>,
    sessions: SessionManager,
}

/// Builds a `Relay`. Every collaborator left unset falls back to the production one
/// described by the config.
pub struct RelayBuilder {
    config: RelayConfig,
    runner: Option<Arc<dyn WorkerRunner>>,
    transport: Option<Arc<dyn PushTransport>>,
    store: Option<Arc<dyn MessageBodyStore>>,
    model: Option<Arc<dyn DecisionModel>>,
    sink: Option<Arc<dyn LearningSink>>,
}

impl RelayBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            runner: None,
            transport: None,
            store: None,
            model: None,
            sink: None,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn WorkerRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn PushTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_body_store(mut self, store: Arc<dyn MessageBodyStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_decision_model(mut self, model: Arc<dyn DecisionModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_learning_sink(mut self, sink: Arc<dyn LearningSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the config and assemble the pipeline. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Relay, RelayError> {
        let config = self.config;
        config.validate()?;

        let runner: Arc<dyn WorkerRunner> = match self.runner {
            Some(runner) => runner,
            None => Arc::new(CliWorkerRunner::new(config.worker.clone())),
        };
        let transport: Arc<dyn PushTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                ExpoPushTransport::new(&config.delivery.expo)
                    .map_err(|e| RelayError::ConfigError(format!("Push transport: {}", e)))?,
            ),
        };
        let store: Arc<dyn MessageBodyStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryBodyStore::new(config.delivery.body_ttl())),
        };

        let mut agent = ContinuationAgent::new(config.agent.clone())?;
        if let Some(model) = self.model {
            agent = agent.with_model(model);
        }
        if let Some(sink) = self.sink {
            agent = agent.with_learning_sink(sink);
        }
        let agent = Arc::new(agent);

        let devices = Arc::new(DeviceRegistry::new(&config.devices));
        let dedup = Arc::new(DuplicateDetector::new(&config.dedup));
        let delivery = Arc::new(DeliveryService::new(
            devices.clone(),
            transport,
            store,
            config.delivery.clone(),
        ));
        let sessions = SessionManager::new(
            config.worker.clone(),
            config.sessions.clone(),
            runner,
            MessageQueue::from_config(&config.queue),
            delivery.clone(),
            agent.clone(),
        );

        log::info!(
            "Relay ready: worker '{}', auto-continue {}",
            config.worker.command,
            if agent.is_enabled() { "on" } else { "off" }
        );

        Ok(Relay {
            config,
            devices,
            dedup,
            delivery,
            agent,
            sessions,
        })
    }
}

impl Relay {
    pub fn builder(config: RelayConfig) -> RelayBuilder {
        RelayBuilder::new(config)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn dedup(&self) -> &Arc<DuplicateDetector> {
        &self.dedup
    }

    pub fn delivery(&self) -> &Arc<DeliveryService> {
        &self.delivery
    }

    pub fn agent(&self) -> &Arc<ContinuationAgent> {
        &self.agent
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Accept a prompt from a device. Duplicates are answered without touching a
    /// session; a worker that cannot start is reported to the user's devices and
    /// returned as `SpawnError`. Notifications raised here are sent in the background.
    pub async fn submit_prompt(&self, prompt: InboundPrompt) -> Result<SubmitReceipt, RelayError> {
        match (&prompt.push_token, prompt.platform) {
            (Some(token), Some(platform)) => {
                self.devices
                    .register(&prompt.device_id, &prompt.user_id, token, platform)
            }
            _ => {
                if !self.devices.touch(&prompt.device_id) {
                    log::debug!(
                        "Prompt from unregistered device '{}' for user '{}'",
                        prompt.device_id,
                        prompt.user_id
                    );
                }
            }
        }

        let session_key = prompt.working_directory.to_string_lossy();
        let hash = DuplicateDetector::fingerprint(&prompt.user_id, &session_key, &prompt.prompt_text);
        if self.dedup.check_and_record(&hash) {
            log::info!(
                "Duplicate prompt from device '{}' for user '{}' dropped",
                prompt.device_id,
                prompt.user_id
            );
            let session_id = self
                .sessions
                .find(&prompt.user_id, &prompt.working_directory)
                .await;
            return Ok(SubmitReceipt::Duplicate { session_id });
        }

        let session = match self
            .sessions
            .resolve_or_create(&prompt.user_id, &prompt.working_directory)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.dedup.forget(&hash);
                let error = Notification::error("", format!("Could not start the assistant: {}", e))
                    .with_metadata(
                        "working_directory",
                        prompt.working_directory.display().to_string(),
                    );
                self.delivery.spawn_errors(&prompt.user_id, vec![error]);
                return Err(e);
            }
        };

        let payload = PromptPayload::from_inbound(&prompt);
        match self.sessions.submit(&session.id, payload, Some(hash.clone())).await {
            Ok(receipt @ SubmitReceipt::Rejected { .. }) => {
                // Nothing ran, so a retry must not be taken for a duplicate.
                self.dedup.forget(&hash);
                Ok(receipt)
            }
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                self.dedup.forget(&hash);
                Err(e)
            }
        }
    }

    pub async fn control(&self, request: ControlRequest) -> Result<(), RelayError> {
        self.devices.touch(&request.device_id);
        let session_id = self
            .sessions
            .find(&request.user_id, &request.working_directory)
            .await
            .ok_or_else(|| {
                RelayError::SessionNotFound(request.working_directory.display().to_string())
            })?;
        log::info!(
            "Control '{}' for session '{}' from device '{}'",
            request.action,
            session_id,
            request.device_id
        );
        self.sessions.control(&session_id, request.action).await
    }

    pub fn register_device(&self, registration: &DeviceRegistration) {
        self.devices.register_device(registration);
    }

    /// Returns false when the device was not registered.
    pub fn unregister_device(&self, device_id: &str) -> bool {
        self.devices.unregister(device_id).is_some()
    }

    /// Full body of a notification that was pushed as a fetch pointer.
    pub async fn fetch_body(&self, id: &str) -> Option<StoredBody> {
        self.delivery.body_store().fetch(id).await
    }

    pub async fn session_status(
        &self,
        user_id: &str,
        working_directory: &Path,
    ) -> Result<SessionSnapshot, RelayError> {
        let session_id = self
            .sessions
            .find(user_id, working_directory)
            .await
            .ok_or_else(|| RelayError::SessionNotFound(working_directory.display().to_string()))?;
        self.sessions.status(&session_id).await
    }

    /// Terminate every session. Returns how many were live.
    pub async fn shutdown(&self) -> usize {
        let terminated = self.sessions.shutdown().await;
        log::info!("Relay shut down; {} sessions terminated", terminated);
        terminated
    }
}
