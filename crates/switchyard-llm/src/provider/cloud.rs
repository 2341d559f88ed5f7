//! Login-gated cloud proxy with fallback to locally configured providers

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use switchyard_config::LlmConfig;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{GeminiProvider, Provider, RestProvider};
use crate::bus::{BusEvent, EventBus, UsageEvent};
use crate::error::LlmError;
use crate::resilience::{RetryBudget, cancellable_stream};
use crate::resolver::{
    DEFAULT_GEMINI_MODEL, DEFAULT_OPENAI_MODEL, ProviderContext, ProviderKind, context_for,
};
use crate::sse::{DONE_FRAME, SseStream, frame};
use crate::types::{CompletionRequest, CompletionResponse, Usage};

const PROVIDER: &str = "cloud";

/// Model used when falling back to Gemini
pub const GEMINI_FALLBACK_MODEL: &str = DEFAULT_GEMINI_MODEL;

/// Model used when falling back to `OpenAI`
pub const OPENAI_FALLBACK_MODEL: &str = DEFAULT_OPENAI_MODEL;

/// Field of a proxy response carrying billing data for telemetry
const USAGE_FIELD: &str = "cloud_usage";

/// Longest proxied stream line accepted before the stream is failed
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Source of the cloud session token
pub trait SessionProvider: Send + Sync {
    /// Token of the active login, `None` when logged out
    fn access_token(&self) -> Option<SecretString>;
}

/// Session backed by a token known up front
#[derive(Debug, Clone, Default)]
pub struct StaticSession(Option<SecretString>);

impl StaticSession {
    pub const fn new(token: Option<SecretString>) -> Self {
        Self(token)
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self(config.cloud.access_token.clone())
    }
}

impl SessionProvider for StaticSession {
    fn access_token(&self) -> Option<SecretString> {
        self.0.clone()
    }
}

/// Adapter for the cloud proxy
///
/// Non-streaming calls fall back to the first provider with a configured key
/// when there is no login or the proxy fails. Streams never fall back.
pub struct CloudProvider {
    rest: Arc<RestProvider>,
    gemini: Arc<GeminiProvider>,
    session: Arc<dyn SessionProvider>,
    bus: EventBus,
    config: Arc<LlmConfig>,
}

impl CloudProvider {
    pub fn new(
        rest: Arc<RestProvider>,
        gemini: Arc<GeminiProvider>,
        session: Arc<dyn SessionProvider>,
        bus: EventBus,
        config: Arc<LlmConfig>,
    ) -> Self {
        Self {
            rest,
            gemini,
            session,
            bus,
            config,
        }
    }

    async fn proxy(
        &self,
        endpoint: &Url,
        token: &SecretString,
        context: &ProviderContext,
        request: &CompletionRequest,
        budget: &RetryBudget,
        signal: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        let headers = session_headers(token)?;
        let body = super::rest::request_body(context, request, false)?;

        let response = self
            .rest
            .post_with_retry(PROVIDER, endpoint, &headers, &body, budget, signal)
            .await?;
        let value = self.rest.read_json(PROVIDER, response, signal).await?;

        if let Some(payload) = value.get(USAGE_FIELD) {
            self.report_usage(&context.model, &value, payload);
        }

        CompletionResponse::deserialize(&value).map_err(|e| LlmError::Provider {
            provider: PROVIDER.to_owned(),
            message: format!("unexpected response shape: {e}"),
        })
    }

    fn report_usage(&self, model: &str, response: &Value, payload: &Value) {
        let usage = response
            .get("usage")
            .and_then(|usage| Usage::deserialize(usage).ok());

        let delivered = self.bus.publish(BusEvent::Usage(UsageEvent {
            provider: PROVIDER.to_owned(),
            model: model.to_owned(),
            usage,
            payload: payload.clone(),
        }));

        tracing::debug!(provider = PROVIDER, model = %model, delivered, "forwarded cloud usage");
    }

    /// First provider usable without a login: Gemini, then `OpenAI`, then local
    pub fn fallback_context(&self, context: &ProviderContext) -> Option<ProviderContext> {
        let config = self.config.as_ref();
        let keys = &config.api_keys;

        if keys.gemini.is_some() {
            return Some(context_for(ProviderKind::Gemini, GEMINI_FALLBACK_MODEL, config));
        }

        if keys.openai.is_some() {
            return Some(context_for(ProviderKind::OpenAi, OPENAI_FALLBACK_MODEL, config));
        }

        if keys.local.is_some() || config.has_custom_local_endpoint() {
            let model = config.default_model.clone().unwrap_or_else(|| context.model.clone());
            return Some(context_for(ProviderKind::Local, model, config));
        }

        None
    }

    /// Complete through the fallback provider within what is left of `budget`
    async fn fall_back(
        &self,
        reason: &str,
        context: &ProviderContext,
        request: &CompletionRequest,
        budget: &RetryBudget,
        signal: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        let Some(fallback) = self.fallback_context(context) else {
            return Err(LlmError::Configuration(format!(
                "cloud: {reason} and no fallback provider is configured; log in to the cloud \
                 service or set llm.api_keys.gemini, llm.api_keys.openai or a local endpoint"
            )));
        };

        tracing::warn!(
            reason = %reason,
            fallback = %fallback.provider,
            model = %fallback.model,
            remaining_ms = u64::try_from(budget.total_timeout.as_millis()).unwrap_or(u64::MAX),
            "cloud unavailable, falling back"
        );

        match fallback.provider {
            ProviderKind::Gemini => {
                self.gemini.complete_within(&fallback, request, budget, signal).await
            }
            _ => self.rest.complete_within(&fallback, request, budget, signal).await,
        }
    }
}

#[async_trait]
impl Provider for CloudProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    async fn complete(
        &self,
        context: &ProviderContext,
        request: &CompletionRequest,
        signal: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        let started = Instant::now();
        let budget = self.rest.budget();
        let token = self.session.access_token();

        let reason = match (token, self.config.cloud.endpoint.as_ref()) {
            (Some(token), Some(endpoint)) => {
                match self.proxy(endpoint, &token, context, request, &budget, signal).await {
                    Ok(response) => return Ok(response),
                    Err(error) if error.is_cancellation() => return Err(error),
                    Err(error) => {
                        tracing::warn!(provider = PROVIDER, error = %error, "cloud call failed");
                        format!("proxy call failed ({error})")
                    }
                }
            }
            (None, _) => "not logged in".to_owned(),
            (Some(_), None) => "no cloud endpoint configured".to_owned(),
        };

        // One logical call, one budget: the fallback gets only what the proxy left
        let remaining = budget.remaining_after(started.elapsed());
        self.fall_back(&reason, context, request, &remaining, signal).await
    }

    async fn complete_stream(
        &self,
        context: &ProviderContext,
        request: &CompletionRequest,
        signal: &CancellationToken,
    ) -> Result<SseStream, LlmError> {
        let Some(token) = self.session.access_token() else {
            return Err(LlmError::Configuration(
                "cloud: not logged in; log in to stream from the cloud service \
                 or pick a locally configured model"
                    .to_owned(),
            ));
        };
        let Some(endpoint) = self.config.cloud.endpoint.as_ref() else {
            return Err(LlmError::Configuration(
                "cloud: llm.cloud.endpoint is not configured".to_owned(),
            ));
        };

        let headers = session_headers(&token)?;
        let body = super::rest::request_body(context, request, true)?;

        let response = self
            .rest
            .post_stream(PROVIDER, endpoint, &headers, &body, signal)
            .await?;

        let bytes = response.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));
        let codec = LinesCodec::new_with_max_length(MAX_LINE_BYTES);
        let lines = FramedRead::new(StreamReader::new(bytes), codec);

        let frames = lines
            .filter_map(|line| async move {
                match line {
                    Ok(line) => chunk_payload(&line).map(|payload| Ok(frame(payload))),
                    Err(e) => Some(Err(LlmError::Streaming {
                        provider: PROVIDER.to_owned(),
                        message: e.to_string(),
                    })),
                }
            })
            .chain(stream::once(async { Ok(Bytes::from_static(DONE_FRAME.as_bytes())) }));

        Ok(Box::pin(cancellable_stream(frames, signal.clone())))
    }
}

/// JSON payload of one proxied line, tolerating an SSE `data:` prefix
///
/// Blank lines, SSE comments (`: keepalive`) and the `[DONE]` marker carry no payload.
fn chunk_payload(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.starts_with(':') {
        return None;
    }

    let payload = line.strip_prefix("data:").map_or(line, str::trim_start);

    (!payload.is_empty() && payload != "[DONE]").then_some(payload)
}

fn session_headers(token: &SecretString) -> Result<HeaderMap, LlmError> {
    let mut value = http::HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
        .map_err(|_| {
            LlmError::Configuration(
                "cloud: session token contains invalid header characters".to_owned(),
            )
        })?;
    value.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(http::header::AUTHORIZATION, value);
    Ok(headers)
}
