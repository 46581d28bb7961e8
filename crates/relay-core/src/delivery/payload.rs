//! Notification payloads and the size policy
//!
//! Push providers reject payloads above a hard byte ceiling. A payload at or under the
//! ceiling goes out unmodified; anything larger walks a fixed fallback chain until it
//! fits, storing the full body server-side so the device can fetch it on demand.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Result,
    Progress,
    Error,
    StallAlert,
    ControlAck,
}

/// What the session layer wants a user's devices to see.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub session_id: String,
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, Value>,
}

impl Notification {
    pub fn new(kind: NotificationKind, session_id: &str, title: &str, body: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            title: title.to_string(),
            body: body.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn result(session_id: &str, text: impl Into<String>) -> Self {
        Self::new(NotificationKind::Result, session_id, "Response ready", text)
    }

    pub fn progress(session_id: &str, text: impl Into<String>) -> Self {
        Self::new(NotificationKind::Progress, session_id, "Working", text)
    }

    pub fn error(session_id: &str, text: impl Into<String>) -> Self {
        Self::new(NotificationKind::Error, session_id, "Something went wrong", text)
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// The structured object handed to a push transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Fetch pointer into the message body store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_ref: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub silent: bool,
    pub ttl_secs: u64,
}

impl NotificationPayload {
    pub fn from_notification(id: &str, notification: &Notification, silent: bool, ttl_secs: u64) -> Self {
        Self {
            kind: notification.kind,
            id: id.to_string(),
            session_id: notification.session_id.clone(),
            title: Some(notification.title.clone()),
            body: Some(notification.body.clone()),
            body_ref: None,
            metadata: notification.metadata.clone(),
            silent,
            ttl_secs,
        }
    }

    /// Serialized size in bytes, as measured against the ceiling.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

/// Where the size policy stopped. Ordered by how much was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeStep {
    Unmodified,
    FetchPointer,
    StrippedMetadata,
    StrippedPreview,
    IdentifiersOnly,
    PointerOnly,
}

/// Apply one step of the chain to `payload`. `body_ref` and `preview` are only used by
/// the `FetchPointer` step; without a `body_ref` the step degrades to preview only.
fn apply_step(
    payload: &mut NotificationPayload,
    step: SizeStep,
    body_ref: Option<&str>,
    preview: &str,
) {
    match step {
        SizeStep::Unmodified => {}
        SizeStep::FetchPointer => {
            payload.body_ref = body_ref.map(str::to_string);
            payload.body = Some(preview.to_string());
        }
        SizeStep::StrippedMetadata => payload.metadata.clear(),
        SizeStep::StrippedPreview => payload.body = None,
        SizeStep::IdentifiersOnly => payload.title = None,
        SizeStep::PointerOnly => {
            payload.id.clear();
            payload.session_id.clear();
        }
    }
}

const CHAIN: [SizeStep; 5] = [
    SizeStep::FetchPointer,
    SizeStep::StrippedMetadata,
    SizeStep::StrippedPreview,
    SizeStep::IdentifiersOnly,
    SizeStep::PointerOnly,
];

/// Fit `payload` under `max_bytes`. Returns the step reached. A `body_ref` must only be
/// passed once the original body is stored under it.
pub fn fit_payload(
    payload: &mut NotificationPayload,
    max_bytes: usize,
    body_ref: Option<&str>,
    preview_chars: usize,
) -> SizeStep {
    if payload.encoded_len() <= max_bytes {
        return SizeStep::Unmodified;
    }

    let preview = preview_of(payload.body.as_deref().unwrap_or_default(), preview_chars);
    let mut reached = SizeStep::Unmodified;
    for step in CHAIN {
        apply_step(payload, step, body_ref, &preview);
        reached = step;
        if payload.encoded_len() <= max_bytes {
            break;
        }
    }
    if payload.encoded_len() > max_bytes {
        log::warn!(
            "Payload still {} bytes after full truncation chain (ceiling {})",
            payload.encoded_len(),
            max_bytes
        );
    }
    reached
}

/// First `chars` characters of `text`, with an ellipsis when cut.
pub fn preview_of(text: &str, chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(chars) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
