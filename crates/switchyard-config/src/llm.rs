use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// Chat completions URL of a local OpenAI-compatible server (LM Studio default port)
pub const DEFAULT_LOCAL_ENDPOINT: &str = "http://localhost:1234/v1/chat/completions";

/// Gemini Generative Language API base URL
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Provider selection, credentials and resilience policy
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// Model used when a request names none
    #[serde(default)]
    pub default_model: Option<String>,
    /// Provider used when a request names no model (`local`, `openai`, `gemini`, `webllm`, `cloud`)
    ///
    /// Kept as a string so an unknown value degrades to the local provider
    /// instead of failing the whole configuration.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Chat completions URL of the local OpenAI-compatible server
    #[serde(default = "default_local_endpoint")]
    pub default_endpoint: Url,
    /// Explicit endpoint override for the REST family
    #[serde(default)]
    pub endpoint: Option<Url>,
    /// Base URL of the Gemini API
    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: Url,
    /// Per-provider API keys
    #[serde(default)]
    pub api_keys: ApiKeys,
    /// Retry and timeout policy for non-streaming calls
    #[serde(default)]
    pub retry: RetryConfig,
    /// Browser-resident WebLLM bridge
    #[serde(default)]
    pub webllm: WebLlmConfig,
    /// Login-gated cloud proxy
    #[serde(default)]
    pub cloud: CloudConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            default_provider: None,
            default_endpoint: default_local_endpoint(),
            endpoint: None,
            gemini_base_url: default_gemini_base_url(),
            api_keys: ApiKeys::default(),
            retry: RetryConfig::default(),
            webllm: WebLlmConfig::default(),
            cloud: CloudConfig::default(),
        }
    }
}

impl LlmConfig {
    /// Whether `default_endpoint` was changed from the built-in local URL
    pub fn has_custom_local_endpoint(&self) -> bool {
        self.default_endpoint.as_str() != DEFAULT_LOCAL_ENDPOINT
    }
}

/// API keys keyed by provider
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeys {
    /// `OpenAI` API key
    #[serde(default)]
    pub openai: Option<SecretString>,
    /// Gemini API key
    #[serde(default)]
    pub gemini: Option<SecretString>,
    /// Key for the local OpenAI-compatible server, if it requires one
    #[serde(default)]
    pub local: Option<SecretString>,
    /// Anthropic key, sent as bearer token when Claude models go through the REST family
    #[serde(default)]
    pub anthropic: Option<SecretString>,
}

/// Retry budget and per-call ceiling for non-streaming calls
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per logical call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base of the exponential backoff
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Wall-clock budget across all attempts
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
    /// Hard ceiling for a single non-streaming attempt
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            total_timeout_ms: default_total_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// WebLLM bridge settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebLlmConfig {
    /// How long to wait for a browser tab to answer
    #[serde(default = "default_webllm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebLlmConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webllm_timeout_secs(),
        }
    }
}

/// Cloud proxy settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudConfig {
    /// Chat completions URL of the cloud proxy
    #[serde(default)]
    pub endpoint: Option<Url>,
    /// Session token issued by the login flow
    #[serde(default)]
    pub access_token: Option<SecretString>,
    /// Model names served through the cloud proxy
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_local_endpoint() -> Url {
    Url::parse(DEFAULT_LOCAL_ENDPOINT).expect("valid default local endpoint")
}

fn default_gemini_base_url() -> Url {
    Url::parse(DEFAULT_GEMINI_BASE_URL).expect("valid default Gemini base URL")
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    2_000
}

const fn default_total_timeout_ms() -> u64 {
    90_000
}

const fn default_request_timeout_ms() -> u64 {
    60_000
}

const fn default_webllm_timeout_secs() -> u64 {
    300
}
