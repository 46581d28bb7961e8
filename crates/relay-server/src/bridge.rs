//! Newline-delimited JSON intake
//!
//! Each input line is one request object tagged by `type`, optionally carrying an `id`
//! that is echoed on its response. Every request gets exactly one response line.
//! Requests run concurrently, so a slow session never holds up another one; requests
//! for the same session (or the same device) are still handled in arrival order and
//! answered in that order. The route layer runs the server as a subprocess and talks
//! to it through this bridge.

use relay_core::core_types::{ControlRequest, DeviceRegistration, InboundPrompt};
use relay_core::errors::RelayError;
use relay_core::Relay;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    Prompt(InboundPrompt),
    Control(ControlRequest),
    Register(DeviceRegistration),
    Unregister { device_id: String },
    Fetch { id: String },
    Status {
        user_id: String,
        working_directory: PathBuf,
    },
    Sessions,
    AgentResume { session_id: String },
    AgentReset { session_id: String },
    ClearAlarm,
    Health,
}

impl BridgeRequest {
    /// Requests sharing a key are handled one after another.
    fn ordering_key(&self) -> Option<String> {
        fn session(user_id: &str, working_directory: &Path) -> String {
            format!("session:{}:{}", user_id, working_directory.display())
        }

        match self {
            BridgeRequest::Prompt(p) => Some(session(&p.user_id, &p.working_directory)),
            BridgeRequest::Control(c) => Some(session(&c.user_id, &c.working_directory)),
            BridgeRequest::Status {
                user_id,
                working_directory,
            } => Some(session(user_id, working_directory)),
            BridgeRequest::Register(r) => Some(format!("device:{}", r.device_id)),
            BridgeRequest::Unregister { device_id } => Some(format!("device:{}", device_id)),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct BridgeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeResponse {
    fn ok(id: Option<Value>, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(id: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

pub async fn handle(relay: &Relay, request: BridgeRequest) -> Result<Value, RelayError> {
    match request {
        BridgeRequest::Prompt(prompt) => {
            let receipt = relay.submit_prompt(prompt).await?;
            Ok(serde_json::to_value(receipt)?)
        }
        BridgeRequest::Control(control) => {
            let action = control.action;
            relay.control(control).await?;
            Ok(json!({ "acknowledged": action }))
        }
        BridgeRequest::Register(registration) => {
            relay.register_device(&registration);
            Ok(json!({ "registered": registration.device_id }))
        }
        BridgeRequest::Unregister { device_id } => {
            let removed = relay.unregister_device(&device_id);
            Ok(json!({ "removed": removed }))
        }
        BridgeRequest::Fetch { id } => {
            let body = relay.fetch_body(&id).await;
            Ok(json!({ "body": body }))
        }
        BridgeRequest::Status {
            user_id,
            working_directory,
        } => {
            let snapshot = relay.session_status(&user_id, &working_directory).await?;
            Ok(serde_json::to_value(snapshot)?)
        }
        BridgeRequest::Sessions => {
            let sessions = relay.sessions().list_sessions().await;
            Ok(serde_json::to_value(sessions)?)
        }
        BridgeRequest::AgentResume { session_id } => {
            Ok(json!({ "resumed": relay.agent().resume(&session_id) }))
        }
        BridgeRequest::AgentReset { session_id } => {
            relay.agent().reset(&session_id);
            Ok(json!({ "reset": true }))
        }
        BridgeRequest::ClearAlarm => {
            relay.delivery().clear_credential_alarm();
            log::info!("Push credential alarm cleared by operator");
            Ok(json!({ "credential_alarm": false }))
        }
        BridgeRequest::Health => Ok(json!({
            "sessions": relay.sessions().len(),
            "devices": relay.devices().len(),
            "credential_alarm": relay.delivery().credential_alarm(),
        })),
    }
}

/// Split a raw line into its correlation id and the request it carries.
fn decode(line: &str) -> (Option<Value>, Result<BridgeRequest, String>) {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return (None, Err(format!("invalid request: {}", e))),
    };
    let id = value.as_object_mut().and_then(|fields| fields.remove("id"));
    let request = serde_json::from_value(value).map_err(|e| format!("invalid request: {}", e));
    (id, request)
}

async fn answer(
    relay: &Relay,
    id: Option<Value>,
    request: Result<BridgeRequest, String>,
) -> BridgeResponse {
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            log::warn!("Unparseable bridge request: {}", e);
            return BridgeResponse::error(id, e);
        }
    };
    match handle(relay, request).await {
        Ok(data) => BridgeResponse::ok(id, data),
        Err(e) => BridgeResponse::error(id, e.to_string()),
    }
}

/// Answer one raw input line.
pub async fn respond(relay: &Relay, line: &str) -> BridgeResponse {
    let (id, request) = decode(line);
    answer(relay, id, request).await
}

/// Start one request on its own task, chained behind the previous request with the
/// same ordering key.
fn dispatch(
    relay: &Arc<Relay>,
    line: &str,
    responses: mpsc::UnboundedSender<BridgeResponse>,
    tails: &mut HashMap<String, oneshot::Receiver<()>>,
) {
    // Finished chains need no successor to wait on.
    tails.retain(|_, done| matches!(done.try_recv(), Err(oneshot::error::TryRecvError::Empty)));

    let (id, request) = decode(line);
    let chain = request
        .as_ref()
        .ok()
        .and_then(BridgeRequest::ordering_key)
        .map(|key| {
            let (done_tx, done_rx) = oneshot::channel();
            (done_tx, tails.insert(key, done_rx))
        });

    let relay = relay.clone();
    tokio::spawn(async move {
        let done = match chain {
            Some((done_tx, previous)) => {
                if let Some(previous) = previous {
                    // An error only means the previous request's task is gone.
                    let _ = previous.await;
                }
                Some(done_tx)
            }
            None => None,
        };

        let response = answer(&relay, id, request).await;
        if responses.send(response).is_err() {
            log::warn!("Bridge closed before a response could be written");
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
    });
}

/// Serve requests from `input` until EOF or cancellation, then wait for the requests
/// already accepted and write their responses.
pub async fn serve<R, W>(
    relay: Arc<Relay>,
    input: R,
    mut output: W,
    shutdown: CancellationToken,
) -> Result<(), RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let (responses_tx, mut responses) = mpsc::unbounded_channel();
    let mut intake = Some(responses_tx);
    let mut tails = HashMap::new();

    loop {
        tokio::select! {
            response = responses.recv() => {
                let Some(response) = response else {
                    break;
                };
                let mut encoded = serde_json::to_string(&response)?;
                encoded.push('\n');
                output.write_all(encoded.as_bytes()).await?;
                output.flush().await?;
            }
            _ = shutdown.cancelled(), if intake.is_some() => {
                log::info!("Bridge intake stopped; finishing accepted requests");
                intake = None;
            }
            line = lines.next_line(), if intake.is_some() => {
                let Some(line) = line? else {
                    log::info!("Bridge input closed");
                    intake = None;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(responses_tx) = &intake {
                    dispatch(&relay, &line, responses_tx.clone(), &mut tails);
                }
            }
        }
    }
    Ok(())
}
