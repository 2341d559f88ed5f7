//! Model identifier to provider context resolution
//!
//! Resolution is pure and total: any string maps to some provider, and an
//! unrecognized model falls through to the local OpenAI-compatible server.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Once;

use http::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use switchyard_config::{DEFAULT_LOCAL_ENDPOINT, LlmConfig};
use url::Url;

/// Chat completions URL of the `OpenAI` API
pub const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Gemini model used when none is named or configured
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// `OpenAI` model used when none is named or configured
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Prefix that routes a model to the browser-resident WebLLM engine
pub const WEBLLM_PREFIX: &str = "webllm/";

const OPENAI_PREFIXES: &[&str] = &["gpt-", "o1", "o3", "o4", "chatgpt-"];

static CLAUDE_WARNING: Once = Once::new();

/// Backend family a request is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Local OpenAI-compatible server
    Local,
    /// `OpenAI` API
    OpenAi,
    /// Gemini API through its client
    Gemini,
    /// Browser-resident engine reached over the event bus
    WebLlm,
    /// Login-gated proxy with local fallback
    Cloud,
}

impl ProviderKind {
    pub const ALL: [Self; 5] = [Self::Local, Self::OpenAi, Self::Gemini, Self::WebLlm, Self::Cloud];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::WebLlm => "webllm",
            Self::Cloud => "cloud",
        }
    }

    /// Model to request when the caller and the configuration name none
    ///
    /// Local servers and the cloud proxy pick their own; WebLLM has no default.
    pub const fn default_model(self) -> Option<&'static str> {
        match self {
            Self::Gemini => Some(DEFAULT_GEMINI_MODEL),
            Self::OpenAi => Some(DEFAULT_OPENAI_MODEL),
            Self::Local | Self::WebLlm | Self::Cloud => None,
        }
    }

    /// Whether requests go out as an OpenAI-compatible REST call
    pub const fn is_rest(self) -> bool {
        matches!(self, Self::Local | Self::OpenAi)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a provider name outside the known set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider: {0}")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();

        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownProvider(s.to_owned()))
    }
}

/// Everything an adapter needs to reach a backend for one call
///
/// Built fresh per call and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub provider: ProviderKind,
    /// `None` for providers driven through a client or bridge
    pub endpoint: Option<Url>,
    pub headers: HeaderMap,
    pub model: String,
}

/// Lookup of model names served by the cloud proxy
pub trait ModelRegistry: Send + Sync {
    fn is_cloud_model(&self, model: &str) -> bool;
}

/// Registry backed by the configured list of cloud model names
#[derive(Debug, Clone, Default)]
pub struct StaticModelRegistry {
    cloud: HashSet<String>,
}

impl StaticModelRegistry {
    pub fn new<I, S>(cloud_models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cloud: cloud_models.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.cloud.models.iter().cloned())
    }
}

impl ModelRegistry for StaticModelRegistry {
    fn is_cloud_model(&self, model: &str) -> bool {
        self.cloud.contains(model)
    }
}

/// Map an optional model identifier to a provider context
pub fn resolve(
    model: Option<&str>,
    config: &LlmConfig,
    registry: &dyn ModelRegistry,
) -> ProviderContext {
    let requested = model.map(str::trim).filter(|m| !m.is_empty());

    let (provider, model) = match requested {
        Some(model) => classify(model, config, registry),
        None => {
            let provider = config
                .default_provider
                .as_deref()
                .and_then(|name| name.parse().ok())
                .unwrap_or(ProviderKind::Local);
            let model = config
                .default_model
                .clone()
                .or_else(|| provider.default_model().map(str::to_owned))
                .unwrap_or_default();
            (provider, model)
        }
    };

    context_for(provider, model, config)
}

/// Build the context for a known provider and model
///
/// Used by `resolve` and to synthesize fallback contexts.
pub fn context_for(
    provider: ProviderKind,
    model: impl Into<String>,
    config: &LlmConfig,
) -> ProviderContext {
    let model = model.into();

    let key = match provider {
        ProviderKind::Local => {
            config.api_keys.local.as_ref().or_else(|| claude_key(&model, config))
        }
        ProviderKind::OpenAi => config.api_keys.openai.as_ref(),
        ProviderKind::Gemini | ProviderKind::WebLlm | ProviderKind::Cloud => None,
    };

    ProviderContext {
        provider,
        endpoint: endpoint_for(provider, config),
        headers: bearer_headers(provider, key),
        model,
    }
}

fn classify(
    model: &str,
    config: &LlmConfig,
    registry: &dyn ModelRegistry,
) -> (ProviderKind, String) {
    if model.starts_with("gemini-") || model.starts_with("models/gemini-") {
        return (ProviderKind::Gemini, model.to_owned());
    }

    if model.starts_with("claude-") {
        CLAUDE_WARNING.call_once(|| {
            tracing::warn!(
                model = %model,
                "no native Claude client; routing claude-* models to the OpenAI-compatible endpoint"
            );
        });
        return (ProviderKind::Local, model.to_owned());
    }

    if OPENAI_PREFIXES.iter().any(|prefix| model.starts_with(prefix)) {
        return (ProviderKind::OpenAi, model.to_owned());
    }

    if let Some(stripped) = model.strip_prefix(WEBLLM_PREFIX) {
        return (ProviderKind::WebLlm, stripped.to_owned());
    }

    if registry.is_cloud_model(model) {
        return (ProviderKind::Cloud, model.to_owned());
    }

    let pinned_to_cloud = config
        .default_provider
        .as_deref()
        .and_then(|name| name.parse::<ProviderKind>().ok())
        .is_some_and(|kind| kind == ProviderKind::Cloud);

    if pinned_to_cloud {
        return (ProviderKind::Cloud, model.to_owned());
    }

    (ProviderKind::Local, model.to_owned())
}

fn claude_key<'a>(model: &str, config: &'a LlmConfig) -> Option<&'a SecretString> {
    if model.starts_with("claude-") {
        config.api_keys.anthropic.as_ref()
    } else {
        None
    }
}

fn endpoint_for(provider: ProviderKind, config: &LlmConfig) -> Option<Url> {
    let builtin = match provider {
        ProviderKind::Local => config.default_endpoint.clone(),
        ProviderKind::OpenAi => Url::parse(OPENAI_ENDPOINT).ok()?,
        ProviderKind::Cloud => return config.cloud.endpoint.clone(),
        ProviderKind::Gemini | ProviderKind::WebLlm => return None,
    };

    // An explicit override equal to a built-in default carries no intent
    let explicit = config
        .endpoint
        .as_ref()
        .filter(|url| url.as_str() != DEFAULT_LOCAL_ENDPOINT && url.as_str() != OPENAI_ENDPOINT);

    Some(explicit.cloned().unwrap_or(builtin))
}

fn bearer_headers(provider: ProviderKind, key: Option<&SecretString>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let Some(key) = key.filter(|k| !k.expose_secret().is_empty()) else {
        return headers;
    };

    match HeaderValue::from_str(&format!("Bearer {}", key.expose_secret())) {
        Ok(mut value) => {
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Err(_) => {
            tracing::warn!(
                provider = %provider,
                "API key contains characters not valid in a header; sending without auth"
            );
        }
    }

    headers
}
