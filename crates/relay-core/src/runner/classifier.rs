//! Classification of worker stdout lines
//!
//! The worker speaks newline-delimited JSON: assistant and user messages carrying
//! content blocks, permission control requests, and a terminal `result` line closing
//! each turn. Anything that does not parse is passed through as plain text.

use crate::core_types::WorkerEvent;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamLine {
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    Assistant {
        message: StreamMessage,
    },
    User {
        message: StreamMessage,
    },
    ControlRequest {
        #[serde(default)]
        request: Value,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// How a `result` line closed the turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEnd {
    Success { text: Option<String> },
    SoftStop { subtype: String },
    Failure { message: String },
}

#[derive(Debug, Default, PartialEq)]
pub struct ClassifiedLine {
    pub events: Vec<WorkerEvent>,
    pub end: Option<TurnEnd>,
}

impl ClassifiedLine {
    fn event(event: WorkerEvent) -> Self {
        Self {
            events: vec![event],
            end: None,
        }
    }
}

/// Classify one stdout line. `soft_stop_subtypes` lists `result` subtypes that mean
/// the worker hit a turn or resource limit.
pub fn classify_line(line: &str, soft_stop_subtypes: &[String]) -> ClassifiedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ClassifiedLine::default();
    }

    let parsed: StreamLine = match serde_json::from_str(trimmed) {
        Ok(parsed) => parsed,
        Err(_) => {
            return ClassifiedLine::event(WorkerEvent::PlainText {
                text: trimmed.to_string(),
            })
        }
    };

    match parsed {
        StreamLine::System { subtype } => {
            log::debug!("Worker system line: {}", subtype.as_deref().unwrap_or("-"));
            ClassifiedLine::default()
        }
        StreamLine::Assistant { message } | StreamLine::User { message } => ClassifiedLine {
            events: message_events(message.content),
            end: None,
        },
        StreamLine::ControlRequest { request } => {
            let tool = request
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let description = request
                .get("input")
                .map(value_to_text)
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| format!("{} requests permission", tool));
            ClassifiedLine::event(WorkerEvent::PermissionRequest { tool, description })
        }
        StreamLine::Result {
            subtype,
            result,
            is_error,
        } => {
            let subtype = subtype.unwrap_or_else(|| "success".to_string());
            if soft_stop_subtypes.iter().any(|s| *s == subtype) {
                ClassifiedLine {
                    events: vec![WorkerEvent::SoftStop {
                        reason: subtype.clone(),
                    }],
                    end: Some(TurnEnd::SoftStop { subtype }),
                }
            } else if is_error || subtype != "success" {
                let message = result.unwrap_or_else(|| format!("worker reported {}", subtype));
                ClassifiedLine {
                    events: vec![WorkerEvent::Error {
                        message: message.clone(),
                    }],
                    end: Some(TurnEnd::Failure { message }),
                }
            } else {
                ClassifiedLine {
                    events: Vec::new(),
                    end: Some(TurnEnd::Success { text: result }),
                }
            }
        }
        StreamLine::Unknown => ClassifiedLine::event(WorkerEvent::PlainText {
            text: trimmed.to_string(),
        }),
    }
}

fn message_events(content: MessageContent) -> Vec<WorkerEvent> {
    match content {
        MessageContent::Text(text) if text.trim().is_empty() => Vec::new(),
        MessageContent::Text(text) => vec![WorkerEvent::PlainText { text }],
        MessageContent::Blocks(blocks) => blocks
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.trim().is_empty() => {
                    Some(WorkerEvent::PlainText { text })
                }
                ContentBlock::ToolUse { name, input } => Some(WorkerEvent::ToolUse { name, input }),
                ContentBlock::ToolResult { content, is_error } => Some(WorkerEvent::ToolResult {
                    content: value_to_text(&content),
                    is_error,
                }),
                _ => None,
            })
            .collect(),
    }
}

/// Flatten a tool payload into display text.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => value_to_text(item),
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => match map.get("description").or_else(|| map.get("command")) {
            Some(Value::String(s)) => s.clone(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}
