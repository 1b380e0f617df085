use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{StreamError, StreamResult};

/// Runs `operation` against a fresh `timeout` timer.
///
/// If the timer wins, `cancel` is triggered and the operation is dropped, so
/// an issuer watching the token tears down its connection. If `cancel` fires
/// first the result is [`StreamError::Cancelled`]. When the operation settles
/// first, the timer is dropped with the select.
pub async fn race<T, F>(operation: F, timeout: Duration, cancel: &CancellationToken) -> StreamResult<T>
where
    F: Future<Output = StreamResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StreamError::Cancelled),
        result = operation => result,
        _ = tokio::time::sleep(timeout) => {
            debug!(target = "agent_stream.race", timeout_ms = timeout.as_millis() as u64, "attempt timed out");
            cancel.cancel();
            Err(StreamError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::time::{sleep, Instant};

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out_and_is_cancelled() {
        let token = CancellationToken::new();
        let dropped = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicBool::new(false));

        let operation = {
            let guard = DropFlag(dropped.clone());
            let completed = completed.clone();
            async move {
                let _guard = guard;
                sleep(Duration::from_millis(1_001)).await;
                completed.store(true, Ordering::SeqCst);
                Ok::<_, StreamError>("late")
            }
        };

        let started = Instant::now();
        let result = race(operation, Duration::from_millis(1_000), &token).await;

        assert_eq!(result, Err(StreamError::Timeout(Duration::from_millis(1_000))));
        assert!(token.is_cancelled());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!completed.load(Ordering::SeqCst));
        assert_eq!(started.elapsed(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_operation_wins_without_cancelling() {
        let token = CancellationToken::new();
        let result = race(
            async {
                sleep(Duration::from_millis(10)).await;
                Ok::<_, StreamError>(7)
            },
            Duration::from_millis(1_000),
            &token,
        )
        .await;
        assert_eq!(result, Ok(7));
        assert!(!token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn operation_error_is_returned_as_is() {
        let token = CancellationToken::new();
        let result: StreamResult<()> = race(
            async { Err(StreamError::Network("connection refused".into())) },
            Duration::from_millis(1_000),
            &token,
        )
        .await;
        assert_eq!(result, Err(StreamError::Network("connection refused".into())));
        assert!(!token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn each_call_gets_a_fresh_budget() {
        let token = CancellationToken::new();
        for _ in 0..3 {
            let result = race(
                async {
                    sleep(Duration::from_millis(900)).await;
                    Ok::<_, StreamError>(())
                },
                Duration::from_millis(1_000),
                &token,
            )
            .await;
            assert!(result.is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancellation_wins() {
        let token = CancellationToken::new();
        token.cancel();
        let result = race(
            futures::future::pending::<StreamResult<()>>(),
            Duration::from_millis(1_000),
            &token,
        )
        .await;
        assert_eq!(result, Err(StreamError::Cancelled));
    }
}
