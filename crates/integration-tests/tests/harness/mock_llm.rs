//! Mock upstreams for integration tests
//!
//! One server plays three backends: an OpenAI-compatible chat endpoint, the
//! Gemini `generateContent` API and the cloud proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub const CLOUD_TOKEN: &str = "cloud-session-token";

/// Mock backend that returns predictable responses
pub struct MockLlm {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockLlmState>,
}

struct MockLlmState {
    completion_count: AtomicU32,
    gemini_count: AtomicU32,
    cloud_count: AtomicU32,
    /// Number of chat requests to fail before succeeding
    fail_count: AtomicU32,
    fail_status: AtomicU16,
}

impl MockLlm {
    /// Start the mock server, returning immediately
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_failing(0, 503).await
    }

    /// Start a mock server that fails the first `n` chat requests with `status`
    pub async fn start_failing(n: u32, status: u16) -> anyhow::Result<Self> {
        let state = Arc::new(MockLlmState {
            completion_count: AtomicU32::new(0),
            gemini_count: AtomicU32::new(0),
            cloud_count: AtomicU32::new(0),
            fail_count: AtomicU32::new(n),
            fail_status: AtomicU16::new(status),
        });

        let app = Router::new()
            .route("/v1/chat/completions", routing::post(handle_chat_completions))
            .route("/v1beta/models/{call}", routing::post(handle_gemini))
            .route("/cloud/v1/chat/completions", routing::post(handle_cloud))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self { addr, shutdown, state })
    }

    /// Chat completions URL of the OpenAI-compatible mock
    pub fn chat_url(&self) -> String {
        format!("http://{}/v1/chat/completions", self.addr)
    }

    /// Base URL of the Gemini mock
    pub fn gemini_base_url(&self) -> String {
        format!("http://{}/v1beta", self.addr)
    }

    /// Chat completions URL of the cloud proxy mock
    pub fn cloud_url(&self) -> String {
        format!("http://{}/cloud/v1/chat/completions", self.addr)
    }

    /// Number of OpenAI-compatible chat requests received, failures included
    pub fn completion_count(&self) -> u32 {
        self.state.completion_count.load(Ordering::Relaxed)
    }

    pub fn gemini_count(&self) -> u32 {
        self.state.gemini_count.load(Ordering::Relaxed)
    }

    pub fn cloud_count(&self) -> u32 {
        self.state.cloud_count.load(Ordering::Relaxed)
    }
}

impl Drop for MockLlm {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_chat_completions(
    State(state): State<Arc<MockLlmState>>,
    Json(body): Json<Value>,
) -> Response {
    state.completion_count.fetch_add(1, Ordering::Relaxed);

    let remaining = state.fail_count.load(Ordering::Relaxed);
    if remaining > 0 {
        state.fail_count.store(remaining - 1, Ordering::Relaxed);
        let status = StatusCode::from_u16(state.fail_status.load(Ordering::Relaxed))
            .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return (status, "mock failure").into_response();
    }

    let model = body["model"].as_str().unwrap_or_default().to_owned();

    if body["stream"] == true {
        let frames = ["Hello", " from", " mock"]
            .iter()
            .map(|text| format!("data: {}\n\n", chunk(&model, text)))
            .chain(std::iter::once("data: [DONE]\n\n".to_owned()))
            .collect::<String>();

        return ([(header::CONTENT_TYPE, "text/event-stream")], frames).into_response();
    }

    Json(completion(&model, "Hello from mock LLM")).into_response()
}

async fn handle_gemini(
    State(state): State<Arc<MockLlmState>>,
    Path(call): Path<String>,
) -> Response {
    state.gemini_count.fetch_add(1, Ordering::Relaxed);

    if call.ends_with(":streamGenerateContent") {
        let frames = ["Hello", " from Gemini"]
            .iter()
            .map(|text| {
                let content = json!({"role": "model", "parts": [{"text": text}]});
                let chunk = json!({"candidates": [{"content": content}]});
                format!("data: {chunk}\n\n")
            })
            .collect::<String>();

        return ([(header::CONTENT_TYPE, "text/event-stream")], frames).into_response();
    }

    Json(json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": "Hello from Gemini"}]},
            "finishReason": "STOP"
        }],
        "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 3, "totalTokenCount": 7}
    }))
    .into_response()
}

async fn handle_cloud(
    State(state): State<Arc<MockLlmState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.cloud_count.fetch_add(1, Ordering::Relaxed);

    let expected = format!("Bearer {CLOUD_TOKEN}");
    if headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
        return (StatusCode::UNAUTHORIZED, "login required").into_response();
    }

    let model = body["model"].as_str().unwrap_or_default().to_owned();

    if body["stream"] == true {
        // The proxy streams one JSON chunk per line
        let lines = ["Hello", " from cloud"]
            .iter()
            .map(|text| format!("{}\n", chunk(&model, text)))
            .collect::<String>();

        return ([(header::CONTENT_TYPE, "application/x-ndjson")], lines).into_response();
    }

    let mut response = completion(&model, "Hello from cloud");
    response["cloud_usage"] = json!({"credits_used": 2, "plan": "pro"});

    Json(response).into_response()
}

fn completion(model: &str, content: &str) -> Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 4, "total_tokens": 9}
    })
}

fn chunk(model: &str, text: &str) -> Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": model,
        "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
    })
}
