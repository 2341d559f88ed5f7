//! Google Gemini adapter over the Generative Language API

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{StreamExt, stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::Provider;
use crate::convert::gemini::{build_request, from_gemini, visible_text};
use crate::error::LlmError;
use crate::protocol::gemini::{GenerateContentRequest, GenerateContentResponse, GeminiErrorResponse};
use crate::resilience::{
    RetryBudget, cancellable, cancellable_stream, retry_with_budget, with_hard_timeout,
};
use crate::resolver::{ProviderContext, ProviderKind};
use crate::sse::{SseStream, encode_chunks};
use crate::types::{CompletionRequest, CompletionResponse, StreamChunk};

const PROVIDER: &str = "gemini";

/// Thin client for the `generateContent` family of endpoints
#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: Url,
    api_key: SecretString,
}

impl GeminiClient {
    pub const fn new(http: Client, base_url: Url, api_key: SecretString) -> Self {
        Self { http, base_url, api_key }
    }

    /// Endpoint for `method` on `model`, accepting both `gemini-x` and `models/gemini-x`
    fn method_url(&self, model: &str, method: &str) -> Result<Url, LlmError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let model = model.strip_prefix("models/").unwrap_or(model);

        Url::parse(&format!("{base}/models/{model}:{method}"))
            .map_err(|e| {
                LlmError::Configuration(format!("invalid Gemini URL for model '{model}': {e}"))
            })
    }

    async fn post(
        &self,
        url: Url,
        body: &GenerateContentRequest,
    ) -> Result<reqwest::Response, LlmError> {
        let mut key = http::HeaderValue::from_str(self.api_key.expose_secret()).map_err(|_| {
            LlmError::Configuration("Gemini API key contains invalid header characters".to_owned())
        })?;
        key.set_sensitive(true);

        self.http
            .post(url)
            .header("x-goog-api-key", key)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::from_transport(PROVIDER, &e))
    }

    /// Single-shot `generateContent` call returning the raw response
    pub async fn generate_content(
        &self,
        model: &str,
        body: &GenerateContentRequest,
    ) -> Result<reqwest::Response, LlmError> {
        let url = self.method_url(model, "generateContent")?;
        self.post(url, body).await
    }

    /// `streamGenerateContent` in SSE mode, returning the raw response
    pub async fn stream_generate_content(
        &self,
        model: &str,
        body: &GenerateContentRequest,
    ) -> Result<reqwest::Response, LlmError> {
        let mut url = self.method_url(model, "streamGenerateContent")?;
        url.query_pairs_mut().append_pair("alt", "sse");
        self.post(url, body).await
    }
}

/// Adapter translating canonical requests to Gemini and back
///
/// The client is built on first use from the configured key and shared by
/// every call afterwards.
pub struct GeminiProvider {
    http: Client,
    base_url: Url,
    api_key: Option<SecretString>,
    client: OnceLock<GeminiClient>,
    budget: RetryBudget,
    hard_timeout: Duration,
}

impl GeminiProvider {
    pub const fn new(
        http: Client,
        base_url: Url,
        api_key: Option<SecretString>,
        budget: RetryBudget,
        hard_timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url,
            api_key,
            client: OnceLock::new(),
            budget,
            hard_timeout,
        }
    }

    /// Shared client, constructed on first use
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no Gemini API key is configured
    pub fn client(&self) -> Result<&GeminiClient, LlmError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }

        let key = self.api_key.as_ref().ok_or_else(|| {
            LlmError::Configuration(
                "gemini: no API key configured; set llm.api_keys.gemini or pick a different model"
                    .to_owned(),
            )
        })?;

        Ok(self.client.get_or_init(|| {
            tracing::debug!(base_url = %self.base_url, "initializing Gemini client");
            GeminiClient::new(self.http.clone(), self.base_url.clone(), key.clone())
        }))
    }

    /// Drop the shared client so the next call builds a fresh one
    pub fn reset(&mut self) {
        self.client.take();
    }

    pub fn is_initialized(&self) -> bool {
        self.client.get().is_some()
    }

    /// Non-streaming completion drawing on `budget` instead of the adapter's own
    pub(crate) async fn complete_within(
        &self,
        context: &ProviderContext,
        request: &CompletionRequest,
        budget: &RetryBudget,
        signal: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        let client = self.client()?;
        let body = &build_request(request);
        let model = context.model.as_str();
        let hard_timeout = self.hard_timeout;

        let response = retry_with_budget(PROVIDER, budget, signal, move |attempt| {
            tracing::debug!(
                provider = PROVIDER,
                model = %model,
                attempt,
                "sending generateContent"
            );
            with_hard_timeout(PROVIDER, hard_timeout, client.generate_content(model, body))
        })
        .await?;

        let response = ensure_success(response).await?;

        let read = async {
            response
                .json::<GenerateContentResponse>()
                .await
                .map_err(|e| LlmError::Provider {
                    provider: PROVIDER.to_owned(),
                    message: format!("failed to parse response: {e}"),
                })
        };
        let native = cancellable(signal, with_hard_timeout(PROVIDER, hard_timeout, read)).await?;

        from_gemini(&native, model)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
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
        let client = self.client()?;
        let body = build_request(request);

        let request_stream = client.stream_generate_content(&context.model, &body);
        let response = cancellable(signal, request_stream).await?;
        let response = ensure_success(response).await?;

        let chunks = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        return Some(Err(LlmError::Streaming {
                            provider: PROVIDER.to_owned(),
                            message: e.to_string(),
                        }));
                    }
                };

                match serde_json::from_str::<GenerateContentResponse>(event.data.trim()) {
                    Ok(chunk) => visible_text(&chunk).map(|text| Ok(StreamChunk::delta(text))),
                    Err(e) => {
                        tracing::debug!(
                            error = %e,
                            data = %event.data,
                            "skipping unparseable Gemini SSE chunk"
                        );
                        None
                    }
                }
            })
            .chain(stream::once(async { Ok(StreamChunk::done()) }));

        Ok(encode_chunks(context.model.clone(), cancellable_stream(chunks, signal.clone())))
    }
}

/// Like [`super::ensure_success`], but reads Gemini's error envelope
///
/// An error whose canonical status is `CANCELLED` is a cancellation.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();

    if let Ok(envelope) = serde_json::from_str::<GeminiErrorResponse>(&body) {
        if envelope.error.status == "CANCELLED" {
            return Err(LlmError::Cancelled);
        }

        tracing::warn!(
            provider = PROVIDER,
            status = %status,
            code = %envelope.error.status,
            "upstream returned error"
        );

        return Err(LlmError::Status {
            provider: PROVIDER.to_owned(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            body: envelope.error.message,
        });
    }

    tracing::warn!(provider = PROVIDER, status = %status, "upstream returned error");

    Err(LlmError::Status {
        provider: PROVIDER.to_owned(),
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_owned(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::sse::text_deltas;
    use crate::types::{FinishReason, Message};

    fn provider(server: &MockServer, key: Option<&str>) -> GeminiProvider {
        let budget = RetryBudget {
            total_timeout: Duration::from_secs(5),
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
        };

        GeminiProvider::new(
            Client::new(),
            Url::parse(&format!("{}/v1beta", server.uri())).unwrap(),
            key.map(|k| SecretString::from(k.to_owned())),
            budget,
            Duration::from_secs(5),
        )
    }

    fn context(model: &str) -> ProviderContext {
        ProviderContext {
            provider: ProviderKind::Gemini,
            endpoint: None,
            headers: http::HeaderMap::new(),
            model: model.to_owned(),
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(
            "gemini-2.0-flash",
            vec![Message::system("A"), Message::system("B"), Message::user("hi")],
        )
    }

    #[tokio::test]
    async fn completes_and_preserves_native_parts() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .and(header("x-goog-api-key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [
                        {"text": "pondering", "thought": true},
                        {"text": "Hello"}
                    ]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {
                    "promptTokenCount": 3,
                    "candidatesTokenCount": 1,
                    "totalTokenCount": 4
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gemini = provider(&server, Some("g-key"));
        let response = gemini
            .complete(&context("models/gemini-2.0-flash"), &request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.text(), Some("Hello"));
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(response.usage.unwrap().total_tokens, 4);

        let extensions = response.choices[0].message.provider_extensions.as_ref().unwrap();
        assert_eq!(extensions.gemini().unwrap().parts.len(), 2);
    }

    #[tokio::test]
    async fn system_messages_are_joined_on_the_wire() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(wiremock::matchers::body_partial_json(json!({
                "systemInstruction": {"parts": [{"text": "A\n\n---\n\nB"}]},
                "contents": [{"role": "user", "parts": [{"text": "hi"}]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "ok"}]}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = provider(&server, Some("k"))
            .complete(&context("gemini-2.0-flash"), &request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.text(), Some("ok"));
    }

    #[tokio::test]
    async fn missing_key_is_a_configuration_error_and_client_stays_unbuilt() {
        let server = MockServer::start().await;
        let gemini = provider(&server, None);

        let err = gemini
            .complete(&context("gemini-2.0-flash"), &request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LlmError::Configuration(ref message) if message.contains("llm.api_keys.gemini")
        ));
        assert!(!gemini.is_initialized());
    }

    #[tokio::test]
    async fn client_is_built_once_and_reset_clears_it() {
        let server = MockServer::start().await;
        let mut gemini = provider(&server, Some("k"));

        let first: *const GeminiClient = gemini.client().unwrap();
        let second: *const GeminiClient = gemini.client().unwrap();
        assert_eq!(first, second);

        gemini.reset();
        assert!(!gemini.is_initialized());
    }

    #[tokio::test]
    async fn cancelled_status_maps_to_cancellation() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(499).set_body_json(json!({
                "error": {
                    "code": 499,
                    "message": "The operation was cancelled.",
                    "status": "CANCELLED"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server, Some("k"))
            .complete(&context("gemini-2.0-flash"), &request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn fatal_error_names_provider_and_status() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": 400, "message": "API key not valid", "status": "INVALID_ARGUMENT"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server, Some("k"))
            .complete(&context("gemini-2.0-flash"), &request(), &CancellationToken::new())
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.starts_with("gemini"));
        assert!(message.contains("400"));
        assert!(message.contains("API key not valid"));
    }

    #[tokio::test]
    async fn stream_forwards_visible_text_and_terminates() {
        let server = MockServer::start().await;
        let chunk = |part: Value, finish: Option<&str>| {
            let mut candidate = json!({"content": {"role": "model", "parts": [part]}});
            if let Some(reason) = finish {
                candidate["finishReason"] = json!(reason);
            }
            format!("data: {}\n\n", json!({"candidates": [candidate]}))
        };
        let upstream = [
            chunk(json!({"text": "hmm", "thought": true}), None),
            chunk(json!({"text": "Hel"}), None),
            chunk(json!({"text": "lo"}), Some("STOP")),
        ]
        .concat();

        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(upstream, "text/event-stream"))
            .mount(&server)
            .await;

        let stream = provider(&server, Some("k"))
            .complete_stream(&context("gemini-2.0-flash"), &request(), &CancellationToken::new())
            .await
            .unwrap();

        let chunks: Vec<StreamChunk> = text_deltas(stream).map(Result::unwrap).collect().await;

        assert_eq!(
            chunks,
            vec![StreamChunk::delta("Hel"), StreamChunk::delta("lo"), StreamChunk::done()]
        );
    }

    #[tokio::test]
    async fn cancelling_a_stream_ends_it_with_cancellation() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("data: {\"candidates\":[]}\n\n", "text/event-stream")
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let signal = CancellationToken::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = provider(&server, Some("k"))
            .complete_stream(&context("gemini-2.0-flash"), &request(), &signal)
            .await
            .err()
            .unwrap();

        assert!(err.is_cancellation());
    }
}
