//! Axum routes for the chat endpoint and the WebLLM browser bridge

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, WEBLLM_REQUEST_EVENT, WebLlmResponse};
use crate::dispatcher::{CallOptions, Dispatcher};
use crate::error::LlmError;
use crate::resolver::ProviderKind;
use crate::sse::error_frame;
use crate::types::CompletionRequest;

/// Provider and model that served a chat request, attached to the response
/// extensions for middleware such as request metrics
#[derive(Debug, Clone)]
pub struct Served {
    pub provider: ProviderKind,
    pub model: String,
}

/// Build the router with all endpoints
pub fn llm_router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/v1/chat/completions", routing::post(chat_completions))
        .route("/v1/bridge/events", routing::get(bridge_events))
        .route("/v1/bridge/responses", routing::post(bridge_responses))
        .route("/health", routing::get(health))
        .with_state(dispatcher)
}

/// Handle `POST /v1/chat/completions`
///
/// A client disconnect drops the handler future or the response body, which
/// cancels the call.
async fn chat_completions(
    State(dispatcher): State<Dispatcher>,
    Json(request): Json<CompletionRequest>,
) -> Response {
    let context = dispatcher.resolve(Some(&request.model));
    let served = Served {
        provider: context.provider,
        model: context.model,
    };

    let mut response = complete(&dispatcher, &request).await;
    response.extensions_mut().insert(served);
    response
}

async fn complete(dispatcher: &Dispatcher, request: &CompletionRequest) -> Response {
    let signal = CancellationToken::new();
    let guard = signal.clone().drop_guard();
    let options = CallOptions::default().with_signal(signal);

    if !request.stream {
        return match dispatcher.call_provider(request, &options).await {
            Ok(response) => Json(response).into_response(),
            Err(e) => error_response(&e),
        };
    }

    match dispatcher.call_provider_stream(request, &options).await {
        Ok(stream) => {
            let body = stream.map(move |chunk| {
                let _cancel_on_drop = &guard;
                Ok::<_, Infallible>(chunk.unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "stream failed after it started");
                    error_frame(&e)
                }))
            });

            (
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(body),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Handle `GET /v1/bridge/events`, the feed a browser tab listens on
async fn bridge_events(
    State(dispatcher): State<Dispatcher>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let receiver = dispatcher.bus().subscribe();

    tracing::info!(subscribers = dispatcher.bus().subscriber_count(), "webllm bridge connected");

    let events = futures_util::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(BusEvent::WebLlmRequest(request)) => {
                    let event = Event::default().event(WEBLLM_REQUEST_EVENT).json_data(&request);
                    return Some((event, receiver));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "bridge feed lagged behind the bus");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Handle `POST /v1/bridge/responses`
async fn bridge_responses(
    State(dispatcher): State<Dispatcher>,
    Json(response): Json<WebLlmResponse>,
) -> Response {
    if !dispatcher.webllm().is_pending(&response.request_id) {
        return error_response(&LlmError::InvalidRequest(format!(
            "no pending webllm request with id '{}'",
            response.request_id
        )));
    }

    dispatcher.bus().publish(BusEvent::WebLlmResponse(response));

    StatusCode::ACCEPTED.into_response()
}

/// Handle `GET /health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Convert an error to an `OpenAI`-style JSON error response
fn error_response(error: &LlmError) -> Response {
    let status = error.status_code();
    let body = json!({
        "error": {
            "message": error.to_string(),
            "type": error.error_type(),
            "code": status.as_u16(),
        }
    });

    (status, Json(body)).into_response()
}
