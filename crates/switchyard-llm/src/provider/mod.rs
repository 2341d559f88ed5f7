//! Backend adapters, one per provider family

pub mod cloud;
pub mod gemini;
pub mod rest;
pub mod webllm;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;
use crate::resolver::{ProviderContext, ProviderKind};
use crate::sse::SseStream;
use crate::types::{CompletionRequest, CompletionResponse};

pub use cloud::{CloudProvider, SessionProvider, StaticSession};
pub use gemini::{GeminiClient, GeminiProvider};
pub use rest::RestProvider;
pub use webllm::WebLlmBridge;

/// Trait implemented by each backend family
///
/// Adapters read the model, endpoint and headers from the resolved context,
/// never from the request.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider family this adapter serves
    fn kind(&self) -> ProviderKind;

    /// Send a non-streaming completion request
    async fn complete(
        &self,
        context: &ProviderContext,
        request: &CompletionRequest,
        signal: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError>;

    /// Open a streaming completion normalized to SSE frames
    ///
    /// Streams are never retried and carry no hard timeout; only `signal`
    /// ends them early.
    async fn complete_stream(
        &self,
        context: &ProviderContext,
        request: &CompletionRequest,
        signal: &CancellationToken,
    ) -> Result<SseStream, LlmError>;
}

/// Turn a non-2xx response into a provider-labeled status error
pub(crate) async fn ensure_success(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, LlmError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();

    tracing::warn!(provider = %provider, status = %status, "upstream returned error");

    Err(LlmError::Status {
        provider: provider.to_owned(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_owned(),
        body,
    })
}
