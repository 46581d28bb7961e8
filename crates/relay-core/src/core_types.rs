//! Core type definitions shared across the relay pipeline
//!
//! These types form the contract between the external route layer, the session
//! machinery and the worker process. Inbound requests arrive as `InboundPrompt`,
//! `ControlRequest` and `DeviceRegistration`; worker output leaves the runner as
//! classified `WorkerEvent`s and a final `ExecutionOutcome`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

pub type UserId = String;
pub type DeviceId = String;
pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Ios => write!(f, "ios"),
            Platform::Android => write!(f, "android"),
            Platform::Web => write!(f, "web"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Base64 payload or a path on the worker host, depending on `kind`.
    pub content: String,
    #[serde(default)]
    pub kind: AttachmentKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    #[default]
    Inline,
    FilePath,
}

/// A prompt as submitted by a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundPrompt {
    pub user_id: UserId,
    pub device_id: DeviceId,
    /// The session key: one live session per (user, working directory).
    pub working_directory: PathBuf,
    pub prompt_text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub push_token: Option<String>,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAction::Pause => write!(f, "pause"),
            ControlAction::Resume => write!(f, "resume"),
            ControlAction::Stop => write!(f, "stop"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub working_directory: PathBuf,
    pub action: ControlAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub push_token: String,
    pub platform: Platform,
}

/// Who produced a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptOrigin {
    User,
    Agent,
}

/// The validated unit of work handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPayload {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub user_id: UserId,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    pub origin: PromptOrigin,
}

impl PromptPayload {
    pub fn from_inbound(prompt: &InboundPrompt) -> Self {
        Self {
            text: prompt.prompt_text.clone(),
            attachments: prompt.attachments.clone(),
            user_id: prompt.user_id.clone(),
            device_id: Some(prompt.device_id.clone()),
            origin: PromptOrigin::User,
        }
    }

    pub fn from_agent(user_id: &str, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
            user_id: user_id.to_string(),
            device_id: None,
            origin: PromptOrigin::Agent,
        }
    }
}

/// One classified chunk of worker output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    PlainText { text: String },
    ToolUse { name: String, input: Value },
    ToolResult { content: String, is_error: bool },
    PermissionRequest { tool: String, description: String },
    Error { message: String },
    SoftStop { reason: String },
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::PlainText { .. } => "plain_text",
            WorkerEvent::ToolUse { .. } => "tool_use",
            WorkerEvent::ToolResult { .. } => "tool_result",
            WorkerEvent::PermissionRequest { .. } => "permission_request",
            WorkerEvent::Error { .. } => "error",
            WorkerEvent::SoftStop { .. } => "soft_stop",
        }
    }

    /// Short human-readable line for progress notifications and the session buffer.
    pub fn summary(&self) -> String {
        match self {
            WorkerEvent::PlainText { text } => text.clone(),
            WorkerEvent::ToolUse { name, .. } => format!("Using tool: {}", name),
            WorkerEvent::ToolResult { is_error: true, .. } => "Tool failed".to_string(),
            WorkerEvent::ToolResult { .. } => "Tool finished".to_string(),
            WorkerEvent::PermissionRequest { tool, .. } => {
                format!("Permission requested for {}", tool)
            }
            WorkerEvent::Error { message } => format!("Error: {}", message),
            WorkerEvent::SoftStop { reason } => format!("Paused: {}", reason),
        }
    }
}

/// How a single worker turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed { text: String },
    /// The worker hit a resource or turn limit. `text` is the synthesized pause message.
    SoftStopped { text: String },
    /// The worker reported a failed turn but is still alive.
    Failed { message: String },
}

impl ExecutionOutcome {
    pub fn text(&self) -> &str {
        match self {
            ExecutionOutcome::Completed { text } => text,
            ExecutionOutcome::SoftStopped { text } => text,
            ExecutionOutcome::Failed { message } => message,
        }
    }
}
