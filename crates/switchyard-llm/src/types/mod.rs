//! Canonical chat types shared by every backend
//!
//! The shape is the OpenAI chat completions format. Provider-specific state
//! that must survive a round trip rides in [`ProviderExtensions`].

pub mod extensions;
pub mod message;
pub mod request;
pub mod response;
pub mod stream;
pub mod tool;

pub use extensions::{GeminiExtensions, ProviderExtensions};
pub use message::{Content, ContentPart, FunctionCall, ImageUrl, Message, Role, ToolCall};
pub use request::{CompletionParams, CompletionRequest, ResponseFormat};
pub use response::{Choice, ChoiceMessage, CompletionResponse, FinishReason, Usage};
pub use stream::StreamChunk;
pub use tool::{
    FunctionDefinition, ToolChoice, ToolChoiceFunction, ToolChoiceFunctionName, ToolChoiceMode,
    ToolDefinition,
};
