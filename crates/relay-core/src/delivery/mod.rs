//! Push delivery
//!
//! Formats notifications, enforces the payload ceiling and fans out to a user's devices
//! with bounded concurrency. Each notification class has its own targeting and retry
//! rules:
//!
//! | class         | targets          | attempts       | silent |
//! |---------------|------------------|----------------|--------|
//! | result        | all retained     | `max_attempts` | no     |
//! | error         | all retained     | `max_attempts` | no     |
//! | stall alert   | all retained     | `max_attempts` | no     |
//! | control ack   | all retained     | `max_attempts` | yes    |
//! | progress      | active only      | 1              | yes    |
//!
//! A rejected token removes the device on the spot. An expired provider credential
//! latches the service-level alarm and is never retried.

pub mod expo;
pub mod payload;
pub mod store;
pub mod transport;

pub use expo::ExpoPushTransport;
pub use payload::{Notification, NotificationKind, NotificationPayload, SizeStep};
pub use store::{InMemoryBodyStore, MessageBodyStore, StoredBody};
pub use transport::PushTransport;

use crate::config::DeliveryConfig;
use crate::core_types::ControlAction;
use crate::devices::{Device, DeviceRegistry};
use crate::errors::{RelayError, TransportError};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub targeted: usize,
    pub delivered: usize,
    /// Devices dropped because their token was rejected.
    pub removed: usize,
    pub failed: usize,
    pub size_step: SizeStep,
}

impl DeliveryReport {
    fn empty() -> Self {
        Self {
            targeted: 0,
            delivered: 0,
            removed: 0,
            failed: 0,
            size_step: SizeStep::Unmodified,
        }
    }

    /// `DeliveryError` when devices were targeted and none received the notification.
    pub fn check(self) -> Result<Self, RelayError> {
        if self.targeted > 0 && self.delivered == 0 {
            return Err(RelayError::DeliveryError(format!(
                "{} devices targeted, {} failed, {} removed",
                self.targeted, self.failed, self.removed
            )));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Targets {
    Retained,
    Active,
}

#[derive(Debug, Clone, Copy)]
struct DeliveryPolicy {
    targets: Targets,
    attempts: u32,
    silent: bool,
    ttl_secs: u64,
}

enum SendOutcome {
    Delivered,
    Removed,
    Failed,
}

pub struct DeliveryService {
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn PushTransport>,
    store: Arc<dyn MessageBodyStore>,
    config: DeliveryConfig,
    credential_alarm: AtomicBool,
}

impl DeliveryService {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        transport: Arc<dyn PushTransport>,
        store: Arc<dyn MessageBodyStore>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            store,
            config,
            credential_alarm: AtomicBool::new(false),
        }
    }

    pub fn body_store(&self) -> Arc<dyn MessageBodyStore> {
        self.store.clone()
    }

    /// Whether the provider credential has been reported expired since the last clear.
    pub fn credential_alarm(&self) -> bool {
        self.credential_alarm.load(Ordering::SeqCst)
    }

    pub fn clear_credential_alarm(&self) {
        self.credential_alarm.store(false, Ordering::SeqCst);
    }

    pub async fn deliver_result(&self, user_id: &str, result: Notification) -> DeliveryReport {
        let policy = self.full_policy(false, self.config.result_ttl_secs);
        self.deliver(user_id, result, policy).await
    }

    pub async fn deliver_progress(&self, user_id: &str, progress: Notification) -> DeliveryReport {
        let policy = DeliveryPolicy {
            targets: Targets::Active,
            attempts: 1,
            silent: true,
            ttl_secs: self.config.progress_ttl_secs,
        };
        self.deliver(user_id, progress, policy).await
    }

    pub async fn deliver_error(&self, user_id: &str, error: Notification) -> DeliveryReport {
        let policy = self.full_policy(false, self.config.result_ttl_secs);
        self.deliver(user_id, error, policy).await
    }

    /// Deliver error notifications in order on a background task, off the caller's path.
    pub fn spawn_errors(
        self: &Arc<Self>,
        user_id: &str,
        errors: Vec<Notification>,
    ) -> JoinHandle<()> {
        let service = self.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            for error in errors {
                if let Err(e) = service.deliver_error(&user_id, error).await.check() {
                    log::warn!("Error notification for user '{}' not delivered: {}", user_id, e);
                }
            }
        })
    }

    pub async fn deliver_stall_alert(
        &self,
        user_id: &str,
        session_id: &str,
        silent_for: Duration,
    ) -> DeliveryReport {
        let alert = Notification::new(
            NotificationKind::StallAlert,
            session_id,
            "Assistant seems stuck",
            format!(
                "No output for {} seconds. It is still running; you can wait or stop it.",
                silent_for.as_secs()
            ),
        )
        .with_metadata("silent_for_secs", silent_for.as_secs());
        let policy = self.full_policy(false, self.config.result_ttl_secs);
        self.deliver(user_id, alert, policy).await
    }

    pub async fn deliver_control_ack(
        &self,
        user_id: &str,
        session_id: &str,
        action: ControlAction,
    ) -> DeliveryReport {
        let ack = Notification::new(
            NotificationKind::ControlAck,
            session_id,
            "Session updated",
            format!("{} acknowledged", action),
        )
        .with_metadata("action", action.to_string());
        let policy = self.full_policy(true, self.config.progress_ttl_secs);
        self.deliver(user_id, ack, policy).await
    }

    fn full_policy(&self, silent: bool, ttl_secs: u64) -> DeliveryPolicy {
        DeliveryPolicy {
            targets: Targets::Retained,
            attempts: self.config.max_attempts.max(1),
            silent,
            ttl_secs,
        }
    }

    async fn deliver(
        &self,
        user_id: &str,
        notification: Notification,
        policy: DeliveryPolicy,
    ) -> DeliveryReport {
        let devices = match policy.targets {
            Targets::Retained => self.registry.devices_for(user_id),
            Targets::Active => self.registry.active_devices_for(user_id),
        };
        if devices.is_empty() {
            log::debug!(
                "No devices to receive {:?} notification for user '{}'",
                notification.kind,
                user_id
            );
            return DeliveryReport::empty();
        }

        let notification_id = uuid::Uuid::new_v4().to_string();
        let mut payload = NotificationPayload::from_notification(
            &notification_id,
            &notification,
            policy.silent,
            policy.ttl_secs,
        );
        let mut body_ref = None;
        if payload.encoded_len() > self.config.max_payload_bytes {
            let metadata = json!({
                "kind": notification.kind,
                "session_id": notification.session_id,
                "title": notification.title,
                "metadata": notification.metadata,
            });
            match self
                .store
                .store(&notification_id, &notification.body, metadata)
                .await
            {
                Ok(()) => body_ref = Some(notification_id.as_str()),
                Err(e) => log::error!(
                    "Failed to store body for {}; sending preview only: {}",
                    notification_id,
                    e
                ),
            }
        }
        let size_step = payload::fit_payload(
            &mut payload,
            self.config.max_payload_bytes,
            body_ref,
            self.config.preview_chars,
        );
        if size_step != SizeStep::Unmodified {
            log::debug!(
                "Notification {} over {} bytes; sending as {:?}",
                notification_id,
                self.config.max_payload_bytes,
                size_step
            );
        }

        let delivered = AtomicUsize::new(0);
        let removed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let targeted = devices.len();
        let payload = &payload;

        stream::iter(devices)
            .for_each_concurrent(self.config.fan_out_concurrency.max(1), |device| {
                let (delivered, removed, failed) = (&delivered, &removed, &failed);
                async move {
                    let counter = match self.send_with_retry(payload, &device, policy.attempts).await {
                        SendOutcome::Delivered => delivered,
                        SendOutcome::Removed => removed,
                        SendOutcome::Failed => failed,
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        let report = DeliveryReport {
            targeted,
            delivered: delivered.into_inner(),
            removed: removed.into_inner(),
            failed: failed.into_inner(),
            size_step,
        };
        log::info!(
            "{:?} notification for user '{}': {}/{} delivered, {} removed, {} failed",
            notification.kind,
            user_id,
            report.delivered,
            report.targeted,
            report.removed,
            report.failed
        );
        report
    }

    async fn send_with_retry(
        &self,
        payload: &NotificationPayload,
        device: &Device,
        attempts: u32,
    ) -> SendOutcome {
        for attempt in 1..=attempts {
            match self.transport.send(payload, &device.push_token).await {
                Ok(()) => return SendOutcome::Delivered,
                Err(TransportError::BadToken) => {
                    self.registry.remove_by_token(&device.push_token);
                    return SendOutcome::Removed;
                }
                Err(TransportError::ExpiredCredential) => {
                    self.credential_alarm.store(true, Ordering::SeqCst);
                    log::error!(
                        "Push provider credential expired; operator action required (device '{}')",
                        device.device_id
                    );
                    return SendOutcome::Failed;
                }
                Err(TransportError::Transient(reason)) => {
                    log::warn!(
                        "Push to device '{}' failed (attempt {}/{}): {}",
                        device.device_id,
                        attempt,
                        attempts,
                        reason
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.backoff_step() * attempt).await;
                    }
                }
            }
        }
        SendOutcome::Failed
    }
}
