//! Programmatic configuration builder for integration tests

use secrecy::SecretString;
use switchyard_config::Config;
use url::Url;

/// Builder for constructing test configurations
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Minimal defaults with a fast retry policy
    pub fn new() -> Self {
        let mut config = Config::default();
        config.llm.retry.base_delay_ms = 10;
        config.llm.retry.total_timeout_ms = 5_000;
        config.llm.retry.request_timeout_ms = 5_000;

        Self { config }
    }

    /// Point the local provider at a mock backend
    pub fn with_local_endpoint(mut self, url: &str) -> Self {
        self.config.llm.default_endpoint = parse(url);
        self
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.config.llm.default_model = Some(model.to_owned());
        self
    }

    /// Gemini with a key, served from `base_url`
    pub fn with_gemini(mut self, base_url: &str) -> Self {
        self.config.llm.gemini_base_url = parse(base_url);
        self.config.llm.api_keys.gemini = Some(SecretString::from("gemini-test-key"));
        self
    }

    /// Cloud proxy at `endpoint` serving `models`, logged in when `token` is set
    pub fn with_cloud(mut self, endpoint: &str, token: Option<&str>, models: &[&str]) -> Self {
        self.config.llm.cloud.endpoint = Some(parse(endpoint));
        self.config.llm.cloud.access_token = token.map(|t| SecretString::from(t.to_owned()));
        self.config.llm.cloud.models = models.iter().map(|m| (*m).to_owned()).collect();
        self
    }

    pub fn with_webllm_timeout(mut self, secs: u64) -> Self {
        self.config.llm.webllm.timeout_secs = secs;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> Config {
        self.config.validate().expect("test config is valid");
        self.config
    }
}

fn parse(url: &str) -> Url {
    url.parse().expect("valid URL")
}
