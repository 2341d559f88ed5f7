use std::future::Future;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;

/// Race `operation` against the caller's cancellation signal
///
/// Fails with [`LlmError::Cancelled`] without polling `operation` when the
/// signal has already fired. The signal listener is dropped as soon as either
/// side settles.
pub async fn cancellable<T, F>(signal: &CancellationToken, operation: F) -> Result<T, LlmError>
where
    F: Future<Output = Result<T, LlmError>>,
{
    if signal.is_cancelled() {
        return Err(LlmError::Cancelled);
    }

    tokio::select! {
        biased;
        () = signal.cancelled() => Err(LlmError::Cancelled),
        result = operation => result,
    }
}

/// Sleep unless the signal fires first
pub async fn sleep_cancellable(
    signal: &CancellationToken,
    duration: Duration,
) -> Result<(), LlmError> {
    cancellable(signal, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}

/// Bound a single non-streaming attempt by a fixed ceiling
pub async fn with_hard_timeout<T, F>(
    provider: &str,
    limit: Duration,
    operation: F,
) -> Result<T, LlmError>
where
    F: Future<Output = Result<T, LlmError>>,
{
    tokio::time::timeout(limit, operation).await.unwrap_or_else(|_| {
        Err(LlmError::Timeout {
            provider: provider.to_owned(),
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        })
    })
}

/// End a stream with a single [`LlmError::Cancelled`] item once the signal fires
///
/// The wrapped stream is dropped at that point, which closes the underlying
/// connection.
pub fn cancellable_stream<T, S>(
    stream: S,
    signal: CancellationToken,
) -> impl Stream<Item = Result<T, LlmError>> + Send
where
    T: Send + 'static,
    S: Stream<Item = Result<T, LlmError>> + Send + 'static,
{
    futures_util::stream::unfold(Some((Box::pin(stream), signal)), |state| async move {
        let (mut inner, signal) = state?;

        tokio::select! {
            biased;
            () = signal.cancelled() => Some((Err(LlmError::Cancelled), None)),
            item = inner.next() => item.map(|item| (item, Some((inner, signal)))),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures_util::stream;

    use super::*;

    #[tokio::test]
    async fn already_cancelled_signal_fails_without_polling() {
        let signal = CancellationToken::new();
        signal.cancel();
        let polled = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&polled);
        let result = cancellable(&signal, async move {
            flag.store(true, Ordering::SeqCst);
            Ok(1)
        })
        .await;

        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert!(!polled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn completed_operation_wins() {
        let signal = CancellationToken::new();
        let result = cancellable(&signal, async { Ok::<_, LlmError>("done") }).await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_pending_operation() {
        let signal = CancellationToken::new();
        let trigger = signal.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = cancellable(&signal, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(LlmError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_names_provider_and_limit() {
        let result = with_hard_timeout("local", Duration::from_secs(60), async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(())
        })
        .await;

        match result {
            Err(LlmError::Timeout { provider, timeout_ms }) => {
                assert_eq!(provider, "local");
                assert_eq!(timeout_ms, 60_000);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_stops_after_cancellation() {
        let signal = CancellationToken::new();
        let items = stream::iter(vec![Ok::<_, LlmError>(1), Ok(2)]).chain(stream::pending());
        let mut wrapped = Box::pin(cancellable_stream(items, signal.clone()));

        assert_eq!(wrapped.next().await.unwrap().unwrap(), 1);
        assert_eq!(wrapped.next().await.unwrap().unwrap(), 2);

        signal.cancel();
        assert!(matches!(wrapped.next().await, Some(Err(LlmError::Cancelled))));
        assert!(wrapped.next().await.is_none());
    }
}
