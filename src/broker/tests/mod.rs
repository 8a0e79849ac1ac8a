//! Cross-component scenarios driven through the dispatcher against a
//! scripted mock upstream.


use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// One request as the mock upstream saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub path: String,
    pub authorization: String,
    pub user_agent: String,
    pub body: Value,
}

/// A scripted reply: status, headers, body. When the script runs dry the
/// upstream answers with a default success.
#[derive(Debug, Clone)]
pub struct Scripted {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Scripted {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn status(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            status: 429,
            headers: vec![("retry-after".to_string(), retry_after_secs.to_string())],
            body: json!({"error": {"code": 429, "message": "Resource exhausted"}}).to_string(),
        }
    }

    pub fn sse(events: &str) -> Self {
        Self {
            status: 200,
            headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
            body: events.to_string(),
        }
    }
}

pub fn default_success() -> Value {
    json!({
        "response": {
            "candidates": [{"content": {"parts": [{"text": "ok"}]}}],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15}
        }
    })
}

#[derive(Default)]
pub struct UpstreamState {
    pub script: Mutex<VecDeque<Scripted>>,
    pub seen: Mutex<Vec<SeenRequest>>,
}

impl UpstreamState {
    pub fn push(&self, scripted: Scripted) {
        self.script.lock().unwrap().push_back(scripted);
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

async fn handle(state: Arc<UpstreamState>, request: Request<Body>) -> Response {
    let path = request.uri().path().to_string();
    let headers: HeaderMap = request.headers().clone();
    let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

    state.seen.lock().unwrap().push(SeenRequest {
        path,
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        body,
    });

    let scripted = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Scripted::ok(default_success()));

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(scripted.status).unwrap_or(StatusCode::OK));
    let has_content_type = scripted
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-type"));
    for (name, value) in &scripted.headers {
        builder = builder.header(name, value);
    }
    if !has_content_type {
        builder = builder.header("content-type", "application/json");
    }
    builder.body(Body::from(scripted.body)).unwrap()
}

/// Spawn the mock upstream; returns its base url and the shared state.
pub async fn spawn_upstream() -> (String, Arc<UpstreamState>) {
    let state = Arc::new(UpstreamState::default());
    let handler_state = state.clone();
    let app = axum::Router::new().fallback(move |request: Request<Body>| {
        let state = handler_state.clone();
        async move { handle(state, request).await }
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });
    (format!("http://{}", addr), state)
}
