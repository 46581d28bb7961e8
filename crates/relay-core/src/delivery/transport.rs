use super::payload::NotificationPayload;
use crate::errors::TransportError;
use async_trait::async_trait;

/// Sends one payload to one device token. The caller enforces the size ceiling and
/// decides on retries from the returned error class.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, payload: &NotificationPayload, token: &str) -> Result<(), TransportError>;
}
