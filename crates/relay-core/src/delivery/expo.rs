//! Expo push API transport

use super::payload::{NotificationKind, NotificationPayload};
use super::transport::PushTransport;
use crate::config::ExpoConfig;
use crate::errors::TransportError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct ExpoResponse {
    #[serde(default)]
    data: Option<ExpoData>,
    #[serde(default)]
    errors: Vec<ExpoRequestError>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpoData {
    One(ExpoTicket),
    Many(Vec<ExpoTicket>),
}

#[derive(Debug, Deserialize)]
struct ExpoTicket {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<ExpoTicketDetails>,
}

#[derive(Debug, Deserialize)]
struct ExpoTicketDetails {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExpoRequestError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

pub struct ExpoPushTransport {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl ExpoPushTransport {
    pub fn new(config: &ExpoConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            access_token: config.access_token.clone(),
        })
    }

    fn message(payload: &NotificationPayload, token: &str) -> Value {
        let mut message = json!({
            "to": token,
            "ttl": payload.ttl_secs,
            "priority": if payload.silent { "normal" } else { "high" },
            "data": payload,
        });
        if payload.silent {
            message["_contentAvailable"] = json!(true);
        } else {
            message["sound"] = json!("default");
            if let Some(title) = &payload.title {
                message["title"] = json!(title);
            }
            if let Some(body) = &payload.body {
                message["body"] = json!(body);
            }
        }
        if payload.kind == NotificationKind::Progress {
            message["channelId"] = json!("progress");
        }
        message
    }
}

/// Map an Expo response to a transport outcome.
fn classify_response(status: StatusCode, body: &str) -> Result<(), TransportError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(TransportError::ExpiredCredential);
    }

    let parsed: Option<ExpoResponse> = serde_json::from_str(body).ok();

    if let Some(response) = &parsed {
        if response
            .errors
            .iter()
            .any(|e| e.code.eq_ignore_ascii_case("INVALID_CREDENTIALS") || e.code == "UNAUTHORIZED")
        {
            return Err(TransportError::ExpiredCredential);
        }
    }

    if !status.is_success() {
        let detail = parsed
            .as_ref()
            .and_then(|r| r.errors.first())
            .map(|e| e.message.clone())
            .unwrap_or_else(|| body.chars().take(200).collect());
        return Err(TransportError::Transient(format!("HTTP {}: {}", status, detail)));
    }

    let ticket = match parsed.and_then(|r| r.data) {
        Some(ExpoData::One(ticket)) => ticket,
        Some(ExpoData::Many(tickets)) => match tickets.into_iter().next() {
            Some(ticket) => ticket,
            None => return Err(TransportError::Transient("empty ticket list".to_string())),
        },
        None => {
            return Err(TransportError::Transient(
                "response carried no push ticket".to_string(),
            ))
        }
    };

    if ticket.status == "ok" {
        return Ok(());
    }

    match ticket.details.and_then(|d| d.error).as_deref() {
        Some("DeviceNotRegistered") => Err(TransportError::BadToken),
        Some("InvalidCredentials") => Err(TransportError::ExpiredCredential),
        other => Err(TransportError::Transient(format!(
            "{}: {}",
            other.unwrap_or("error"),
            ticket.message.unwrap_or_default()
        ))),
    }
}

#[async_trait]
impl PushTransport for ExpoPushTransport {
    async fn send(&self, payload: &NotificationPayload, token: &str) -> Result<(), TransportError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(&Self::message(payload, token));
        if let Some(access_token) = &self.access_token {
            request = request.bearer_auth(access_token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        log::debug!("Expo push responded {} for {:?} notification", status, payload.kind);
        classify_response(status, &body)
    }
}
