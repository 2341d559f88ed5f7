//! Retry, timeout and cancellation policy shared by every adapter

mod cancel;
mod retry;

pub use cancel::{cancellable, cancellable_stream, sleep_cancellable, with_hard_timeout};
pub use retry::{RetryBudget, Throttle, Throttled, parse_retry_after, retry_with_budget};
