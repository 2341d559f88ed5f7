use serde::{Deserialize, Serialize};

use super::extensions::ProviderExtensions;
use super::message::{Content, Message, Role, ToolCall};

/// Reason the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// Anything a local server invents
    #[serde(other)]
    Other,
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// A single completion choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// Message content within a response choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default = "assistant_role")]
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// State the caller must store with this message in its history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_extensions: Option<ProviderExtensions>,
}

impl ChoiceMessage {
    /// Create a simple text message from the assistant
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            role: assistant_role(),
            content: Some(content.into()),
            tool_calls: None,
            provider_extensions: None,
        }
    }

    /// Convert into a history message for the next turn
    pub fn into_message(self) -> Message {
        Message {
            role: Role::Assistant,
            content: self.content.map(Content::Text),
            name: None,
            tool_calls: self.tool_calls,
            tool_call_id: None,
            provider_extensions: self.provider_extensions,
        }
    }
}

/// Canonical completion response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    /// Single-choice response stamped with a fresh id and the current time
    pub fn single(
        model: impl Into<String>,
        message: ChoiceMessage,
        finish_reason: FinishReason,
    ) -> Self {
        let created = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());

        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            object: completion_object(),
            created,
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: Some(finish_reason),
            }],
            usage: None,
        }
    }

    /// Text of the first choice
    pub fn text(&self) -> Option<&str> {
        self.choices.first().and_then(|choice| choice.message.content.as_deref())
    }
}

fn assistant_role() -> String {
    "assistant".to_owned()
}

fn completion_object() -> String {
    "chat.completion".to_owned()
}
