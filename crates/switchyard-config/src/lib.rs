#![allow(clippy::must_use_candidate)]

mod env;
pub mod llm;
mod loader;
pub mod server;
pub mod telemetry;

use serde::Deserialize;

pub use llm::*;
pub use server::*;
pub use telemetry::{ExportProtocol, ExporterConfig, LogFormat, TelemetryConfig};

/// Top-level switchyard configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP surface configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Provider selection, credentials and resilience policy
    #[serde(default)]
    pub llm: LlmConfig,
    /// Logging and metrics export
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}
