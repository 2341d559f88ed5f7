use std::path::Path;

use crate::Config;

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Expands `{{ env.VAR }}` placeholders before parsing, then validates.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a placeholder cannot be
    /// expanded, the TOML is malformed, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        Self::parse(&raw)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Same as [`Config::load`] minus the file read
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let expanded = crate::env::expand_env(raw)
            .map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self =
            toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistency found
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_retry()?;
        self.validate_provider_pin()?;
        self.validate_endpoints()?;
        Ok(())
    }

    fn validate_retry(&self) -> anyhow::Result<()> {
        let retry = &self.llm.retry;

        if retry.max_attempts == 0 {
            anyhow::bail!("llm.retry.max_attempts must be at least 1");
        }

        if retry.total_timeout_ms == 0 {
            anyhow::bail!("llm.retry.total_timeout_ms must be greater than 0");
        }

        if retry.request_timeout_ms == 0 {
            anyhow::bail!("llm.retry.request_timeout_ms must be greater than 0");
        }

        Ok(())
    }

    fn validate_provider_pin(&self) -> anyhow::Result<()> {
        let Some(ref provider) = self.llm.default_provider else {
            return Ok(());
        };

        if provider.eq_ignore_ascii_case("cloud") && self.llm.cloud.endpoint.is_none() {
            anyhow::bail!("llm.default_provider is 'cloud' but llm.cloud.endpoint is not set");
        }

        Ok(())
    }

    fn validate_endpoints(&self) -> anyhow::Result<()> {
        let named = [
            ("llm.default_endpoint", Some(&self.llm.default_endpoint)),
            ("llm.endpoint", self.llm.endpoint.as_ref()),
            ("llm.gemini_base_url", Some(&self.llm.gemini_base_url)),
            ("llm.cloud.endpoint", self.llm.cloud.endpoint.as_ref()),
        ];

        for (key, url) in named {
            let Some(url) = url else { continue };

            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("{key} must be an http or https URL, got '{url}'");
            }

            if url.host_str().is_none() {
                anyhow::bail!("{key} has no host: '{url}'");
            }
        }

        Ok(())
    }
}
