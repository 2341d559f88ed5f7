use serde::{Deserialize, Serialize};

/// Unit emitted on a normalized stream regardless of backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_text: Option<String>,
    #[serde(default)]
    pub done: bool,
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta_text: Some(text.into()),
            done: false,
        }
    }

    pub const fn done() -> Self {
        Self {
            delta_text: None,
            done: true,
        }
    }
}
