//! Broadcast bus shared by the WebLLM bridge and usage reporting

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::types::{CompletionResponse, Message, Usage};

/// Name of the event asking a browser tab to run a completion
pub const WEBLLM_REQUEST_EVENT: &str = "webllm:request";

/// Name of the event carrying the browser's answer
pub const WEBLLM_RESPONSE_EVENT: &str = "webllm:response";

const DEFAULT_CAPACITY: usize = 256;

/// Events carried on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusEvent {
    #[serde(rename = "webllm:request")]
    WebLlmRequest(WebLlmRequest),
    #[serde(rename = "webllm:response")]
    WebLlmResponse(WebLlmResponse),
    #[serde(rename = "usage")]
    Usage(UsageEvent),
}

impl BusEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WebLlmRequest(_) => WEBLLM_REQUEST_EVENT,
            Self::WebLlmResponse(_) => WEBLLM_RESPONSE_EVENT,
            Self::Usage(_) => "usage",
        }
    }
}

/// Completion for a browser tab to execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebLlmRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A browser tab's answer, carrying either a result or an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebLlmResponse {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CompletionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Usage reported out of band by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Raw provider payload
    #[serde(default)]
    pub payload: Value,
}

/// Cloneable handle to the broadcast channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers, returning how many received it
    pub fn publish(&self, event: BusEvent) -> usize {
        let name = event.name();

        self.sender.send(event).unwrap_or_else(|_| {
            tracing::debug!(event = name, "no bus subscribers");
            0
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
