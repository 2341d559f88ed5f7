use std::future::Future;
use std::time::Duration;

use jiff::Timestamp;
use switchyard_config::RetryConfig;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::cancel::{cancellable, sleep_cancellable};
use crate::error::{LlmError, is_throttling_status};

/// Wall-clock and attempt limits for one logical call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub total_timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_secs(90),
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl From<&RetryConfig> for RetryBudget {
    fn from(config: &RetryConfig) -> Self {
        Self {
            total_timeout: Duration::from_millis(config.total_timeout_ms),
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl RetryBudget {
    /// `base_delay * 2^attempt`, saturating
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// The part of this budget left once `elapsed` has been spent
    #[must_use]
    pub fn remaining_after(&self, elapsed: Duration) -> Self {
        Self {
            total_timeout: self.total_timeout.saturating_sub(elapsed),
            ..*self
        }
    }

    fn exhausted(
        &self,
        provider: &str,
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    ) -> LlmError {
        tracing::warn!(provider = %provider, attempts, "retry budget exhausted");

        LlmError::BudgetExhausted {
            provider: provider.to_owned(),
            timeout_ms: millis(self.total_timeout),
            elapsed_ms: millis(elapsed),
            attempts,
            last_error,
        }
    }
}

/// A throttling signal read from an HTTP-style result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    pub status: u16,
    /// Server-requested delay, only honored for 429
    pub retry_after: Option<Duration>,
}

/// Results that can ask the caller to back off without failing
pub trait Throttled {
    /// `Some` when the result carries a 429, 503 or 504 status
    fn throttle(&self) -> Option<Throttle>;
}

impl Throttled for reqwest::Response {
    fn throttle(&self) -> Option<Throttle> {
        let status = self.status().as_u16();

        if !is_throttling_status(status) {
            return None;
        }

        let retry_after = if status == 429 {
            self.headers()
                .get(http::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after)
        } else {
            None
        };

        Some(Throttle { status, retry_after })
    }
}

/// Parse a `Retry-After` value given as delta-seconds or an HTTP date
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    parse_retry_after_at(value, Timestamp::now())
}

fn parse_retry_after_at(value: &str, now: Timestamp) -> Option<Duration> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = jiff::fmt::rfc2822::parse(value).ok()?.timestamp();
    let millis = at.as_millisecond().saturating_sub(now.as_millisecond());

    Some(Duration::from_millis(u64::try_from(millis).unwrap_or(0)))
}

/// Run `operation` until it succeeds, the budget runs out, or the signal fires
///
/// `operation` receives the zero-based attempt number. Thrown network-class
/// errors and throttled results are retried with exponential backoff clamped
/// to the remaining budget, and each attempt is bounded by what is left of
/// it. Any other result or error is returned unchanged. Cancellation is never
/// retried.
///
/// # Errors
///
/// Returns [`LlmError::BudgetExhausted`] when the attempts or the wall-clock
/// budget run out while the upstream is still failing transiently,
/// [`LlmError::Cancelled`] when the signal fires, or the first non-transient
/// error.
pub async fn retry_with_budget<R, F, Fut>(
    provider: &str,
    budget: &RetryBudget,
    signal: &CancellationToken,
    mut operation: F,
) -> Result<R, LlmError>
where
    R: Throttled,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<R, LlmError>>,
{
    let started = Instant::now();
    let mut attempt = 0;
    let mut last_error = String::from("no attempt started");

    loop {
        let remaining = budget.total_timeout.saturating_sub(started.elapsed());

        if remaining.is_zero() || attempt >= budget.max_attempts {
            return Err(budget.exhausted(provider, attempt, started.elapsed(), last_error));
        }

        let attempt_future = within_budget(provider, remaining, operation(attempt));
        let outcome = cancellable(signal, attempt_future).await;

        let delay = match outcome {
            Ok(result) => match result.throttle() {
                Some(throttle) => {
                    tracing::warn!(
                        provider = %provider,
                        status = throttle.status,
                        attempt,
                        "upstream throttled"
                    );
                    last_error = format!("upstream returned {}", throttle.status);
                    throttle.retry_after.unwrap_or_else(|| budget.backoff(attempt))
                }
                None => return Ok(result),
            },
            Err(error) if error.is_network_class() => {
                tracing::warn!(provider = %provider, attempt, error = %error, "network error");
                last_error = error.to_string();
                budget.backoff(attempt)
            }
            Err(error) => return Err(error),
        };

        attempt += 1;
        if attempt >= budget.max_attempts {
            return Err(budget.exhausted(provider, attempt, started.elapsed(), last_error));
        }

        let delay = delay.min(budget.total_timeout.saturating_sub(started.elapsed()));

        tracing::debug!(provider = %provider, attempt, delay_ms = millis(delay), "backing off");

        sleep_cancellable(signal, delay).await?;
    }
}

/// Bound one attempt by the budget left for the call
async fn within_budget<T, F>(
    provider: &str,
    remaining: Duration,
    operation: F,
) -> Result<T, LlmError>
where
    F: Future<Output = Result<T, LlmError>>,
{
    tokio::time::timeout(remaining, operation).await.unwrap_or_else(|_| {
        Err(LlmError::Timeout {
            provider: provider.to_owned(),
            timeout_ms: millis(remaining),
        })
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Reply {
        status: u16,
        retry_after: Option<Duration>,
    }

    impl Reply {
        const fn status(status: u16) -> Self {
            Self {
                status,
                retry_after: None,
            }
        }
    }

    impl Throttled for Reply {
        fn throttle(&self) -> Option<Throttle> {
            is_throttling_status(self.status).then_some(Throttle {
                status: self.status,
                retry_after: self.retry_after,
            })
        }
    }

    fn network_error() -> LlmError {
        LlmError::Network {
            provider: "local".to_owned(),
            message: "connection reset by peer".to_owned(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_unavailable_server_stops_at_budget() {
        let budget = RetryBudget {
            total_timeout: Duration::from_millis(90_000),
            max_attempts: 10,
            base_delay: Duration::from_secs(20),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = Arc::clone(&calls);
        let result = retry_with_budget("openai", &budget, &CancellationToken::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Reply::status(503)) }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, LlmError::BudgetExhausted { attempts: 3, .. }));
        assert!(err.to_string().contains("90000"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(90));
        assert!(started.elapsed() < Duration::from_secs(91));
    }

    #[tokio::test(start_paused = true)]
    async fn default_budget_reports_exhaustion_after_last_throttled_attempt() {
        let (budget, signal) = (RetryBudget::default(), CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = Arc::clone(&calls);
        let result = retry_with_budget("openai", &budget, &signal, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Reply::status(503)) }
        })
        .await;

        let err = result.unwrap_err();
        let message = err.to_string();
        let LlmError::BudgetExhausted { attempts, elapsed_ms, .. } = err else {
            panic!("expected budget exhaustion, got {err:?}");
        };
        assert_eq!(attempts, 3);
        assert!((6_000..7_000).contains(&elapsed_ms), "{elapsed_ms}");
        assert!(message.contains("openai"), "{message}");
        assert!(message.contains("90000ms"), "{message}");
        assert!(message.contains("503"), "{message}");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s then 4s of backoff, no wait after the last attempt
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert!(started.elapsed() < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_attempt_is_cut_off_at_the_budget() {
        let budget = RetryBudget {
            total_timeout: Duration::from_secs(10),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        };
        let started = Instant::now();

        let signal = CancellationToken::new();

        let result: Result<Reply, _> = retry_with_budget("local", &budget, &signal, |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Reply::status(200))
        })
        .await;

        assert!(matches!(result, Err(LlmError::BudgetExhausted { attempts: 1, .. })));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn spent_budget_fails_without_an_attempt() {
        let spent = RetryBudget::default().remaining_after(Duration::from_secs(120));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = retry_with_budget("gemini", &spent, &CancellationToken::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Reply::status(200)) }
        })
        .await;

        assert!(matches!(
            result,
            Err(LlmError::BudgetExhausted { attempts: 0, timeout_ms: 0, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_is_honored_for_429() {
        let (budget, signal) = (RetryBudget::default(), CancellationToken::new());
        let started = Instant::now();

        let reply = retry_with_budget("openai", &budget, &signal, |attempt| async move {
            if attempt == 0 {
                Ok(Reply {
                    status: 429,
                    retry_after: Some(Duration::from_secs(7)),
                })
            } else {
                Ok(Reply::status(200))
            }
        })
        .await
        .unwrap();

        assert_eq!(reply.status, 200);
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn non_throttling_status_is_not_retried() {
        let (budget, signal) = (RetryBudget::default(), CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let reply = retry_with_budget("openai", &budget, &signal, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Reply::status(500)) }
        })
        .await
        .unwrap();

        assert_eq!(reply.status, 500);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_back_off_exponentially() {
        let (budget, signal) = (RetryBudget::default(), CancellationToken::new());
        let started = Instant::now();

        let reply = retry_with_budget("local", &budget, &signal, |attempt| async move {
            if attempt < 2 { Err(network_error()) } else { Ok(Reply::status(200)) }
        })
        .await
        .unwrap();

        assert_eq!(reply.status, 200);
        // 2s then 4s
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert!(started.elapsed() < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn network_error_on_last_attempt_becomes_exhaustion() {
        let (budget, signal) = (RetryBudget::default(), CancellationToken::new());

        let result: Result<Reply, _> =
            retry_with_budget("local", &budget, &signal, |_| async { Err(network_error()) }).await;

        match result {
            Err(LlmError::BudgetExhausted { provider, attempts, last_error, .. }) => {
                assert_eq!(provider, "local");
                assert_eq!(attempts, 3);
                assert!(last_error.contains("connection reset"), "{last_error}");
            }
            other => panic!("expected budget exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_and_cancelled_errors_are_not_retried() {
        let (budget, signal) = (RetryBudget::default(), CancellationToken::new());

        for error in [
            LlmError::Cancelled,
            LlmError::Configuration("missing key".to_owned()),
        ] {
            let calls = Arc::new(AtomicU32::new(0));
            let counter = Arc::clone(&calls);
            let mut error = Some(error);

            let result: Result<Reply, _> =
                retry_with_budget("gemini", &budget, &signal, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let error = error.take().unwrap_or(LlmError::Cancelled);
                    async move { Err(error) }
                })
                .await;

            assert!(result.is_err());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let signal = CancellationToken::new();
        let trigger = signal.clone();
        let calls = Arc::new(AtomicU32::new(0));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let counter = Arc::clone(&calls);
        let result = retry_with_budget("openai", &RetryBudget::default(), &signal, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Reply::status(503)) }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn budget_from_config() {
        let budget = RetryBudget::from(&RetryConfig::default());
        assert_eq!(budget, RetryBudget::default());
        assert_eq!(budget.backoff(0), Duration::from_secs(2));
        assert_eq!(budget.backoff(2), Duration::from_secs(8));
    }

    #[test]
    fn retry_after_seconds_and_dates() {
        assert_eq!(parse_retry_after("12"), Some(Duration::from_secs(12)));

        let now: Timestamp = "2015-10-21T07:27:30Z".parse().unwrap();
        assert_eq!(
            parse_retry_after_at("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after_at("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }
}
