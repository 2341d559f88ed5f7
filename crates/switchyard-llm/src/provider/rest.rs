//! OpenAI-compatible REST adapter (`OpenAI` and local servers)

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Provider, ensure_success};
use crate::error::LlmError;
use crate::resilience::{
    RetryBudget, cancellable, cancellable_stream, retry_with_budget, with_hard_timeout,
};
use crate::resolver::{ProviderContext, ProviderKind};
use crate::sse::SseStream;
use crate::types::{CompletionRequest, CompletionResponse};

/// Adapter for every endpoint that already speaks the canonical shape
pub struct RestProvider {
    kind: ProviderKind,
    client: Client,
    budget: RetryBudget,
    hard_timeout: Duration,
}

impl RestProvider {
    pub const fn new(
        kind: ProviderKind,
        client: Client,
        budget: RetryBudget,
        hard_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            client,
            budget,
            hard_timeout,
        }
    }

    pub(crate) const fn budget(&self) -> RetryBudget {
        self.budget
    }

    /// POST `body` with retry and a per-attempt ceiling, returning the raw success response
    pub(crate) async fn post_with_retry(
        &self,
        provider: &str,
        endpoint: &Url,
        headers: &http::HeaderMap,
        body: &Value,
        budget: &RetryBudget,
        signal: &CancellationToken,
    ) -> Result<reqwest::Response, LlmError> {
        let response = retry_with_budget(provider, budget, signal, move |attempt| {
            tracing::debug!(provider = %provider, attempt, "sending completion request");

            let send = self
                .client
                .post(endpoint.clone())
                .headers(headers.clone())
                .json(body)
                .send();

            with_hard_timeout(provider, self.hard_timeout, async move {
                send.await.map_err(|e| LlmError::from_transport(provider, &e))
            })
        })
        .await?;

        ensure_success(provider, response).await
    }

    /// POST `body` once for a stream, returning the raw success response
    pub(crate) async fn post_stream(
        &self,
        provider: &str,
        endpoint: &Url,
        headers: &http::HeaderMap,
        body: &Value,
        signal: &CancellationToken,
    ) -> Result<reqwest::Response, LlmError> {
        let send = self.client.post(endpoint.clone()).headers(headers.clone()).json(body).send();

        let response = cancellable(signal, async move {
            send.await.map_err(|e| LlmError::from_transport(provider, &e))
        })
        .await?;

        ensure_success(provider, response).await
    }

    /// Read a completion body, bounded by the hard timeout and the signal
    pub(crate) async fn read_json(
        &self,
        provider: &str,
        response: reqwest::Response,
        signal: &CancellationToken,
    ) -> Result<Value, LlmError> {
        let read = async {
            response.json::<Value>().await.map_err(|e| LlmError::Provider {
                provider: provider.to_owned(),
                message: format!("failed to parse response: {e}"),
            })
        };

        cancellable(signal, with_hard_timeout(provider, self.hard_timeout, read)).await
    }

    /// Non-streaming completion drawing on `budget` instead of the adapter's own
    pub(crate) async fn complete_within(
        &self,
        context: &ProviderContext,
        request: &CompletionRequest,
        budget: &RetryBudget,
        signal: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        let provider = context.provider.as_str();
        let endpoint = require_endpoint(context)?;
        let body = request_body(context, request, false)?;

        let response = self
            .post_with_retry(provider, endpoint, &context.headers, &body, budget, signal)
            .await?;
        let value = self.read_json(provider, response, signal).await?;

        serde_json::from_value(value).map_err(|e| LlmError::Provider {
            provider: provider.to_owned(),
            message: format!("unexpected response shape: {e}"),
        })
    }
}

#[async_trait]
impl Provider for RestProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(
        &self,
        context: &ProviderContext,
        request: &CompletionRequest,
        signal: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        self.complete_within(context, request, &self.budget, signal).await
    }

    async fn complete_stream(
        &self,
        context: &ProviderContext,
        request: &CompletionRequest,
        signal: &CancellationToken,
    ) -> Result<SseStream, LlmError> {
        let provider = context.provider.as_str();
        let endpoint = require_endpoint(context)?;
        let body = request_body(context, request, true)?;

        let response = self
            .post_stream(provider, endpoint, &context.headers, &body, signal)
            .await?;

        // Upstream already emits OpenAI-style SSE, so bytes pass through untouched
        let bytes = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| LlmError::Streaming {
                provider: provider.to_owned(),
                message: e.to_string(),
            })
        });

        Ok(Box::pin(cancellable_stream(bytes, signal.clone())))
    }
}

fn require_endpoint(context: &ProviderContext) -> Result<&Url, LlmError> {
    context.endpoint.as_ref().ok_or_else(|| {
        LlmError::Configuration(format!(
            "no endpoint resolved for provider '{}'; set llm.endpoint or llm.default_endpoint",
            context.provider
        ))
    })
}

/// Serialize the canonical request as the wire body
///
/// The model comes from the resolved context and provider extensions are
/// removed, since no REST backend understands them.
pub(crate) fn request_body(
    context: &ProviderContext,
    request: &CompletionRequest,
    stream: bool,
) -> Result<Value, LlmError> {
    let mut body = serde_json::to_value(request)
        .map_err(|e| LlmError::InvalidRequest(format!("request is not serializable: {e}")))?;

    if let Some(object) = body.as_object_mut() {
        object.insert("model".to_owned(), Value::String(context.model.clone()));

        if stream {
            object.insert("stream".to_owned(), Value::Bool(true));
        } else {
            object.remove("stream");
        }
    }

    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        for message in messages.iter_mut().filter_map(Value::as_object_mut) {
            message.remove("provider_extensions");

            if let Some(calls) = message.get_mut("tool_calls").and_then(Value::as_array_mut) {
                for call in calls.iter_mut().filter_map(Value::as_object_mut) {
                    call.remove("provider_extensions");
                }
            }
        }
    }

    Ok(transform_body(context.provider, body))
}

/// Provider-specific body adjustments; every REST backend currently takes the canonical body
const fn transform_body(_provider: ProviderKind, body: Value) -> Value {
    body
}
