//! Bridge to a model running in a connected browser tab
//!
//! Nothing is sent over the network from here. Each call publishes a
//! `webllm:request` event on the bus and parks until the tab answers with a
//! `webllm:response` carrying the same request id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Provider;
use crate::bus::{BusEvent, EventBus, WebLlmRequest, WebLlmResponse};
use crate::error::LlmError;
use crate::resilience::cancellable;
use crate::resolver::{ProviderContext, ProviderKind};
use crate::sse::{SseStream, encode_chunks};
use crate::types::{CompletionRequest, CompletionResponse, StreamChunk};

const PROVIDER: &str = "webllm";

type PendingMap = DashMap<String, oneshot::Sender<WebLlmResponse>>;

/// Correlates bus responses with parked calls
///
/// Must be created inside a Tokio runtime; the response listener runs until
/// the bridge is dropped.
pub struct WebLlmBridge {
    bus: EventBus,
    pending: Arc<PendingMap>,
    timeout: Duration,
    listener: JoinHandle<()>,
}

impl WebLlmBridge {
    pub fn new(bus: EventBus, timeout: Duration) -> Self {
        let pending = Arc::new(PendingMap::new());
        let listener = tokio::spawn(listen(bus.subscribe(), Arc::clone(&pending)));

        Self {
            bus,
            pending,
            timeout,
            listener,
        }
    }

    /// Calls currently waiting on a browser answer
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a call is still waiting on `request_id`
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Fail every parked call, e.g. when the browser tab went away
    pub fn reset(&self) {
        let dropped = self.pending.len();
        self.pending.clear();

        if dropped > 0 {
            tracing::info!(dropped, "webllm bridge reset");
        }
    }

    /// Hand a completion to the browser and wait for its answer
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Timeout`] when no answer arrives in time,
    /// [`LlmError::Cancelled`] when the signal fires, or a provider error
    /// carrying the browser's own error message.
    pub async fn request(
        &self,
        model: &str,
        request: &CompletionRequest,
        signal: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        if signal.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        if request.has_tools() {
            tracing::warn!(
                provider = PROVIDER,
                model = %model,
                "tool calling is not supported by WebLLM, ignoring tools"
            );
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();

        self.pending.insert(request_id.clone(), sender);
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: &request_id,
        };

        let delivered = self.bus.publish(BusEvent::WebLlmRequest(WebLlmRequest {
            request_id: request_id.clone(),
            model: model.to_owned(),
            messages: request.messages.clone(),
            temperature: request.params.temperature,
            max_tokens: request.params.max_tokens,
        }));

        tracing::debug!(
            provider = PROVIDER,
            request_id = %request_id,
            model = %model,
            delivered,
            "published webllm request"
        );

        let timeout = self.timeout;
        let answer = cancellable(signal, async move {
            match tokio::time::timeout(timeout, receiver).await {
                Ok(Ok(answer)) => Ok(answer),
                Ok(Err(_)) => Err(LlmError::Provider {
                    provider: PROVIDER.to_owned(),
                    message: "bridge was reset before the browser answered".to_owned(),
                }),
                Err(_) => Err(LlmError::Timeout {
                    provider: PROVIDER.to_owned(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        })
        .await;

        if let Err(ref error) = answer {
            tracing::warn!(
                provider = PROVIDER,
                request_id = %request_id,
                error = %error,
                "webllm request failed"
            );
        }

        into_completion(answer?)
    }
}

impl Drop for WebLlmBridge {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Provider for WebLlmBridge {
    fn kind(&self) -> ProviderKind {
        ProviderKind::WebLlm
    }

    async fn complete(
        &self,
        context: &ProviderContext,
        request: &CompletionRequest,
        signal: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        self.request(&context.model, request, signal).await
    }

    /// The browser answers in one piece, so the stream is a single delta
    async fn complete_stream(
        &self,
        context: &ProviderContext,
        request: &CompletionRequest,
        signal: &CancellationToken,
    ) -> Result<SseStream, LlmError> {
        let response = self.request(&context.model, request, signal).await?;

        let chunks = response
            .text()
            .filter(|text| !text.is_empty())
            .map(StreamChunk::delta)
            .into_iter()
            .chain(std::iter::once(StreamChunk::done()))
            .map(Ok);

        Ok(encode_chunks(context.model.clone(), stream::iter(chunks.collect::<Vec<_>>())))
    }
}

/// Removes the pending entry however the call ends
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.request_id);
    }
}

async fn listen(mut events: broadcast::Receiver<BusEvent>, pending: Arc<PendingMap>) {
    loop {
        match events.recv().await {
            Ok(BusEvent::WebLlmResponse(response)) => {
                let Some((_, sender)) = pending.remove(&response.request_id) else {
                    tracing::debug!(
                        request_id = %response.request_id,
                        "webllm response for unknown or expired request"
                    );
                    continue;
                };
                // Receiver already gone means the caller gave up first
                let _ = sender.send(response);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "webllm listener lagged behind the bus");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn into_completion(answer: WebLlmResponse) -> Result<CompletionResponse, LlmError> {
    if let Some(error) = answer.error {
        return Err(LlmError::Provider {
            provider: PROVIDER.to_owned(),
            message: error,
        });
    }

    answer.result.ok_or_else(|| LlmError::Provider {
        provider: PROVIDER.to_owned(),
        message: "browser answered without a result".to_owned(),
    })
}
