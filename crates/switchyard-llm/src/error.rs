use std::error::Error as StdError;

use http::StatusCode;
use thiserror::Error;

/// Substrings that identify an abort reported inside a provider error body
const CANCELLATION_MARKERS: &[&str] = &["cancelled", "canceled", "aborted"];

/// Non-standard status some upstreams use for a client-closed request
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// How the resilience layer treats an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User- or system-initiated abort; never retried
    Cancelled,
    /// Connection-level failure or throttling status; retried within budget
    Transient,
    /// Any other provider failure; surfaced immediately
    Fatal,
    /// Missing credentials or login with no usable fallback
    Configuration,
}

/// Errors that can occur while calling an LLM backend
#[derive(Debug, Error)]
pub enum LlmError {
    /// The caller's cancellation signal fired
    #[error("request cancelled")]
    Cancelled,

    /// Connection-level failure before a response arrived
    #[error("{provider}: network error: {message}")]
    Network { provider: String, message: String },

    /// A single attempt exceeded its hard ceiling
    #[error("{provider}: request timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    /// Transient failures outlasted the retry budget or the attempt limit
    #[error(
        "{provider}: retry budget of {timeout_ms}ms exhausted after {attempts} attempt(s) \
         in {elapsed_ms}ms: {last_error}"
    )]
    BudgetExhausted {
        provider: String,
        timeout_ms: u64,
        elapsed_ms: u64,
        attempts: u32,
        /// What the final attempt saw
        last_error: String,
    },

    /// Upstream answered with a non-2xx status
    #[error("{provider}: upstream returned {status} {status_text}: {body}")]
    Status {
        provider: String,
        status: u16,
        status_text: String,
        body: String,
    },

    /// Upstream failure that is not an HTTP status (malformed payload, SDK error)
    #[error("{provider}: {message}")]
    Provider { provider: String, message: String },

    /// A backend cannot be reached with the current configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Failure while reading a streaming response
    #[error("{provider}: streaming error: {message}")]
    Streaming { provider: String, message: String },

    /// Caller sent a request this layer cannot dispatch
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    /// Classify this error for retry and propagation decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Network { .. } | Self::Timeout { .. } | Self::BudgetExhausted { .. } => {
                ErrorKind::Transient
            }
            Self::Status { status, body, .. } => {
                if *status == CLIENT_CLOSED_REQUEST || body.contains("\"CANCELLED\"") {
                    ErrorKind::Cancelled
                } else if is_throttling_status(*status) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Fatal
                }
            }
            Self::Provider { message, .. } if has_marker(message, CANCELLATION_MARKERS) => {
                ErrorKind::Cancelled
            }
            Self::Provider { .. } | Self::Streaming { .. } | Self::InvalidRequest(_) => {
                ErrorKind::Fatal
            }
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether this is a cancellation, by variant or by provider-reported status
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Whether a thrown error of this shape is worth another attempt
    ///
    /// Throttling statuses are retried from the response, not from here.
    pub const fn is_network_class(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// Classify a transport error from `reqwest`
    ///
    /// Everything past request construction is a network failure. Aborts on
    /// the caller's behalf arrive through the cancellation token instead, so a
    /// pooled connection reporting "operation was canceled" stays retryable.
    pub fn from_transport(provider: &str, error: &reqwest::Error) -> Self {
        let message = error_chain(error);

        if error.is_builder() {
            return Self::Provider {
                provider: provider.to_owned(),
                message,
            };
        }

        Self::Network {
            provider: provider.to_owned(),
            message,
        }
    }

    /// HTTP status for this error when surfaced through the gateway
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Cancelled => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::Network { .. } | Self::Provider { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } | Self::BudgetExhausted { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Status { status: 429, .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Status { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Streaming { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Machine-readable error type (e.g. `invalid_request_error`)
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Network { .. } | Self::Status { .. } | Self::Provider { .. } => {
                "upstream_error"
            }
            Self::Timeout { .. } | Self::BudgetExhausted { .. } => "timeout_error",
            Self::Configuration(_) => "configuration_error",
            Self::Streaming { .. } => "streaming_error",
            Self::InvalidRequest(_) => "invalid_request_error",
        }
    }
}

/// Statuses that signal throttling or temporary unavailability
pub const fn is_throttling_status(status: u16) -> bool {
    matches!(status, 429 | 503 | 504)
}

fn has_marker(text: &str, markers: &[&str]) -> bool {
    let lowered = text.to_lowercase();
    markers.iter().any(|marker| lowered.contains(marker))
}

fn error_chain(error: &dyn StdError) -> String {
    let mut text = error.to_string();
    let mut source = error.source();

    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }

    text
}
