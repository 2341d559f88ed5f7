use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque provider-owned state carried on a message or tool call
///
/// Only the translator of the owning provider reads or writes these. Every
/// other component passes them through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderExtensions {
    Gemini(GeminiExtensions),
}

impl ProviderExtensions {
    /// Gemini state, if this extension belongs to Gemini
    pub const fn gemini(&self) -> Option<&GeminiExtensions> {
        match self {
            Self::Gemini(ext) => Some(ext),
        }
    }
}

/// Native Gemini state preserved across turns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeminiExtensions {
    /// Original `parts` array of a model turn, replayed verbatim on the next request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Value>,
    /// Thought signature attached to a single function call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

impl GeminiExtensions {
    pub fn with_parts(parts: Vec<Value>) -> ProviderExtensions {
        ProviderExtensions::Gemini(Self {
            parts,
            thought_signature: None,
        })
    }

    pub fn with_signature(signature: String) -> ProviderExtensions {
        ProviderExtensions::Gemini(Self {
            parts: Vec::new(),
            thought_signature: Some(signature),
        })
    }
}
