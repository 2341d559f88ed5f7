//! Provider abstraction and resilience layer for chat completions
//!
//! Requests arrive in one canonical, OpenAI-shaped format and are dispatched
//! to a local or `OpenAI` REST endpoint, Gemini, a browser-resident WebLLM
//! engine, or a login-gated cloud proxy. Every streaming path is normalized
//! to the same SSE framing.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod bus;
pub mod convert;
pub mod dispatcher;
pub mod error;
#[cfg(feature = "http")]
pub mod handler;
pub mod protocol;
pub mod provider;
pub mod resilience;
pub mod resolver;
pub mod sse;
pub mod types;

pub use bus::{BusEvent, EventBus, UsageEvent};
pub use dispatcher::{CallOptions, Dispatcher, DispatcherBuilder};
pub use error::{ErrorKind, LlmError};
#[cfg(feature = "http")]
pub use handler::{Served, llm_router};
pub use provider::Provider;
pub use resolver::{ModelRegistry, ProviderContext, ProviderKind, StaticModelRegistry, resolve};
pub use sse::SseStream;
pub use types::{CompletionRequest, CompletionResponse, Message, StreamChunk};
