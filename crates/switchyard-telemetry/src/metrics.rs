//! Metric names and the usage recorder

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub const LLM_REQUEST_COUNT: &str = "llm.request.count";
pub const LLM_REQUEST_DURATION: &str = "llm.request.duration";
pub const LLM_TOKEN_USAGE: &str = "llm.token.usage";

/// Instruments for completion traffic
///
/// Built from the global meter, so it records into whatever provider
/// [`crate::init`] installed, or nowhere when metrics are off.
#[derive(Clone)]
pub struct UsageMetrics {
    requests: Counter<u64>,
    duration: Histogram<f64>,
    tokens: Histogram<u64>,
}

impl Default for UsageMetrics {
    fn default() -> Self {
        Self::new(&global::meter("switchyard"))
    }
}

impl UsageMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            requests: meter
                .u64_counter(LLM_REQUEST_COUNT)
                .with_description("Completion calls by provider and outcome")
                .build(),
            duration: meter
                .f64_histogram(LLM_REQUEST_DURATION)
                .with_description("Completion call duration")
                .with_unit("s")
                .build(),
            tokens: meter
                .u64_histogram(LLM_TOKEN_USAGE)
                .with_description("Tokens per completion by direction")
                .with_unit("{token}")
                .build(),
        }
    }

    /// Count one call and record how long it took
    pub fn record_request(&self, provider: &str, model: &str, outcome: &str, elapsed: Duration) {
        let attributes = [
            KeyValue::new("llm.provider", provider.to_owned()),
            KeyValue::new("llm.model", model.to_owned()),
            KeyValue::new("outcome", outcome.to_owned()),
        ];

        self.requests.add(1, &attributes);
        self.duration.record(elapsed.as_secs_f64(), &attributes);
    }

    /// Record prompt and completion token counts
    pub fn record_tokens(&self, provider: &str, model: &str, prompt: u64, completion: u64) {
        for (direction, count) in [("input", prompt), ("output", completion)] {
            self.tokens.record(
                count,
                &[
                    KeyValue::new("llm.provider", provider.to_owned()),
                    KeyValue::new("llm.model", model.to_owned()),
                    KeyValue::new("llm.token.type", direction),
                ],
            );
        }
    }
}
