//! Routing of canonical requests to provider adapters
//!
//! The dispatcher resolves a context and hands the call to the adapter for
//! that provider. It performs no translation and never catches errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use switchyard_config::LlmConfig;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::error::LlmError;
use crate::provider::{
    CloudProvider, GeminiProvider, Provider, RestProvider, SessionProvider, StaticSession,
    WebLlmBridge,
};
use crate::resilience::RetryBudget;
use crate::resolver::{ModelRegistry, ProviderContext, ProviderKind, StaticModelRegistry, resolve};
use crate::sse::SseStream;
use crate::types::{CompletionRequest, CompletionResponse};

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Takes precedence over the request's own model
    pub model: Option<String>,
    /// Aborts the call, including a stream already being read
    pub signal: CancellationToken,
}

impl CallOptions {
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }
}

/// Cheaply cloneable entry point shared by the CLI and HTTP handlers
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: Arc<LlmConfig>,
    registry: Arc<dyn ModelRegistry>,
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
    bus: EventBus,
    webllm: Arc<WebLlmBridge>,
}

impl Dispatcher {
    /// Build with the configured registry and session
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        Self::builder(config).build()
    }

    pub fn builder(config: LlmConfig) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            registry: None,
            session: None,
            bus: None,
            http: None,
        }
    }

    /// Context a call for `model` would use
    pub fn resolve(&self, model: Option<&str>) -> ProviderContext {
        resolve(model, &self.inner.config, self.inner.registry.as_ref())
    }

    /// Send a non-streaming completion to the resolved provider
    pub async fn call_provider(
        &self,
        request: &CompletionRequest,
        options: &CallOptions,
    ) -> Result<CompletionResponse, LlmError> {
        let (context, provider) = self.route(request, options)?;

        tracing::debug!(
            provider = %context.provider,
            model = %context.model,
            "dispatching completion"
        );

        provider.complete(&context, request, &options.signal).await
    }

    /// Open a normalized SSE stream from the resolved provider
    pub async fn call_provider_stream(
        &self,
        request: &CompletionRequest,
        options: &CallOptions,
    ) -> Result<SseStream, LlmError> {
        let (context, provider) = self.route(request, options)?;

        tracing::debug!(provider = %context.provider, model = %context.model, "dispatching stream");

        provider.complete_stream(&context, request, &options.signal).await
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn webllm(&self) -> &WebLlmBridge {
        &self.inner.webllm
    }

    pub fn config(&self) -> &LlmConfig {
        &self.inner.config
    }

    fn route(
        &self,
        request: &CompletionRequest,
        options: &CallOptions,
    ) -> Result<(ProviderContext, Arc<dyn Provider>), LlmError> {
        let model = options
            .model
            .as_deref()
            .filter(|model| !model.is_empty())
            .unwrap_or(&request.model);

        let context = self.resolve(Some(model));

        let provider = self.inner.providers.get(&context.provider).cloned().ok_or_else(|| {
            LlmError::Configuration(format!(
                "no adapter registered for provider '{}'",
                context.provider
            ))
        })?;

        Ok((context, provider))
    }
}

/// Builder overriding the registry, session, bus or HTTP client
pub struct DispatcherBuilder {
    config: LlmConfig,
    registry: Option<Arc<dyn ModelRegistry>>,
    session: Option<Arc<dyn SessionProvider>>,
    bus: Option<EventBus>,
    http: Option<Client>,
}

impl DispatcherBuilder {
    #[must_use]
    pub fn registry(mut self, registry: Arc<dyn ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.session = Some(session);
        self
    }

    #[must_use]
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    #[must_use]
    pub fn http_client(mut self, client: Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Construct every adapter
    ///
    /// Must be called inside a Tokio runtime, since the WebLLM bridge starts
    /// its response listener here.
    pub fn build(self) -> Result<Dispatcher, LlmError> {
        let config = Arc::new(self.config);
        let http = match self.http {
            Some(client) => client,
            None => Client::builder()
                .build()
                .map_err(|e| LlmError::Configuration(format!("failed to build HTTP client: {e}")))?,
        };

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(StaticModelRegistry::from_config(&config)));
        let session = self
            .session
            .unwrap_or_else(|| Arc::new(StaticSession::from_config(&config)));
        let bus = self.bus.unwrap_or_default();

        let budget = RetryBudget::from(&config.retry);
        let hard_timeout = Duration::from_millis(config.retry.request_timeout_ms);

        let rest = |kind| Arc::new(RestProvider::new(kind, http.clone(), budget, hard_timeout));
        let local = rest(ProviderKind::Local);
        let openai = rest(ProviderKind::OpenAi);
        let gemini = Arc::new(GeminiProvider::new(
            http,
            config.gemini_base_url.clone(),
            config.api_keys.gemini.clone(),
            budget,
            hard_timeout,
        ));
        let webllm = Arc::new(WebLlmBridge::new(
            bus.clone(),
            Duration::from_secs(config.webllm.timeout_secs),
        ));
        let cloud = Arc::new(CloudProvider::new(
            Arc::clone(&local),
            Arc::clone(&gemini),
            session,
            bus.clone(),
            Arc::clone(&config),
        ));

        let adapters: [Arc<dyn Provider>; 5] = [
            local as Arc<dyn Provider>,
            openai as Arc<dyn Provider>,
            gemini as Arc<dyn Provider>,
            Arc::clone(&webllm) as Arc<dyn Provider>,
            cloud as Arc<dyn Provider>,
        ];
        let providers = adapters
            .into_iter()
            .map(|provider| (provider.kind(), provider))
            .collect();

        tracing::debug!(
            gemini_key = config.api_keys.gemini.is_some(),
            openai_key = config.api_keys.openai.is_some(),
            cloud = config.cloud.endpoint.is_some(),
            "dispatcher ready"
        );

        Ok(Dispatcher {
            inner: Arc::new(DispatcherInner {
                config,
                registry,
                providers,
                bus,
                webllm,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::bus::{BusEvent, WebLlmResponse};
    use crate::types::{ChoiceMessage, FinishReason, Message};

    fn local_config(server: &MockServer) -> LlmConfig {
        let mut config = LlmConfig::default();
        config.default_endpoint =
            Url::parse(&format!("{}/v1/chat/completions", server.uri())).unwrap();
        config
    }

    fn completion(model: &str, text: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }]
        })
    }

    #[tokio::test]
    async fn every_provider_has_an_adapter() {
        let dispatcher = Dispatcher::new(LlmConfig::default()).unwrap();

        for kind in ProviderKind::ALL {
            assert!(dispatcher.inner.providers.contains_key(&kind), "{kind}");
        }
    }

    #[tokio::test]
    async fn unknown_model_goes_to_local_server() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "qwen2.5-7b"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion("qwen2.5-7b", "local says hi")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(local_config(&server)).unwrap();
        let request = CompletionRequest::new("qwen2.5-7b", vec![Message::user("hi")]);

        let response = dispatcher.call_provider(&request, &CallOptions::default()).await.unwrap();

        assert_eq!(response.text(), Some("local says hi"));
    }

    #[tokio::test]
    async fn option_model_takes_precedence() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"model": "override"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("override", "ok")))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(local_config(&server)).unwrap();
        let request = CompletionRequest::new("from-request", vec![Message::user("hi")]);
        let options = CallOptions::default().with_model("override");

        assert!(dispatcher.call_provider(&request, &options).await.is_ok());
    }

    #[tokio::test]
    async fn webllm_prefix_goes_over_the_bus() {
        let dispatcher = Dispatcher::new(LlmConfig::default()).unwrap();
        let mut events = dispatcher.bus().subscribe();
        let bus = dispatcher.bus().clone();

        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let BusEvent::WebLlmRequest(request) = event {
                    bus.publish(BusEvent::WebLlmResponse(WebLlmResponse {
                        request_id: request.request_id,
                        result: Some(CompletionResponse::single(
                            request.model,
                            ChoiceMessage::text("browser"),
                            FinishReason::Stop,
                        )),
                        error: None,
                    }));
                }
            }
        });

        let request = CompletionRequest::new("webllm/Phi-3-mini", vec![Message::user("hi")]);
        let response = dispatcher.call_provider(&request, &CallOptions::default()).await.unwrap();

        assert_eq!(response.text(), Some("browser"));
        assert_eq!(response.model, "Phi-3-mini");
        assert_eq!(dispatcher.webllm().pending_count(), 0);
    }

    #[tokio::test]
    async fn gemini_model_without_key_surfaces_configuration_error() {
        let dispatcher = Dispatcher::new(LlmConfig::default()).unwrap();
        let request = CompletionRequest::new("gemini-2.0-flash", vec![Message::user("hi")]);

        let err = dispatcher
            .call_provider(&request, &CallOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::Configuration(_)));
    }
}
