// src/test_utils/mock_push_server.rs
use axum::http::{HeaderMap, StatusCode};
use axum::{routing::post, Json, Router};
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct RecordedPush {
    pub body: Value,
    pub authorization: Option<String>,
}

#[derive(Clone)]
struct MockServerState {
    responses: Arc<Mutex<VecDeque<(u16, Value)>>>,
    requests: Arc<Mutex<Vec<RecordedPush>>>,
}

async fn push_handler(
    axum::extract::State(state): axum::extract::State<MockServerState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    log::debug!("Mock push server received: {}", body);
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().unwrap().push(RecordedPush {
        body,
        authorization,
    });

    match state.responses.lock().unwrap().pop_front() {
        Some((status, response)) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(response),
        ),
        None => {
            log::error!("Mock push server ran out of responses!");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"errors": [{"code": "EXHAUSTED", "message": "no response"}]})),
            )
        }
    }
}

/// Scripted stand-in for the Expo push endpoint.
pub struct MockPushServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    recorded: Arc<Mutex<Vec<RecordedPush>>>,
}

impl MockPushServer {
    pub async fn start(responses: Vec<(u16, Value)>) -> Self {
        let state = MockServerState {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let recorded = state.requests.clone();

        let app = Router::new()
            .route("/--/api/v2/push/send", post(push_handler))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap_or_else(|e| {
            panic!("Failed to bind mock push server to 127.0.0.1:0. Error: {}", e);
        });
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap_or_else(|e| log::error!("Mock push server error: {}", e));
        });

        MockPushServer {
            addr,
            shutdown_tx,
            recorded,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/--/api/v2/push/send", self.addr)
    }

    pub fn get_requests(&self) -> Vec<RecordedPush> {
        self.recorded.lock().unwrap().clone()
    }

    pub async fn shutdown(self) {
        if self.shutdown_tx.send(()).is_err() {
            log::warn!("Mock push server already stopped.");
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
