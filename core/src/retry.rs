//! Small wrapper for running an operation with a bounded retry budget.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    /// Number of *re*-tries after the first attempt.
    pub count: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            count: 0,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Run `op`, retrying transport-level failures up to `options.count` times.
/// Protocol-level errors are final and returned immediately.
pub async fn run_with_retry<T, F, Fut>(
    ctx: &str,
    options: RetryOptions,
    mut op: F,
) -> Result<T, ProxyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProxyError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < options.count && err.is_retryable() => {
                attempt += 1;
                warn!(
                    "{ctx}: attempt {attempt}/{total} failed, retrying in {delay:?}: {err}",
                    total = options.count + 1,
                    delay = options.delay,
                );
                tokio::time::sleep(options.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;

    use super::*;

    fn transport_err() -> ProxyError {
        ProxyError::Transport {
            name: "a".to_string(),
            message: "reset".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transport_errors_until_budget_is_spent() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();
        let result: Result<(), ProxyError> = run_with_retry(
            "test",
            RetryOptions {
                count: 2,
                delay: Duration::from_millis(10),
            },
            move || {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transport_err())
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn protocol_errors_short_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();
        let result: Result<(), ProxyError> = run_with_retry(
            "test",
            RetryOptions {
                count: 5,
                delay: Duration::from_millis(1),
            },
            move || {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProxyError::Protocol(mcp_types::JSONRPCErrorError {
                        code: -32601,
                        message: "nope".to_string(),
                        data: None,
                    }))
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_success_wins() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();
        let result = run_with_retry("test", RetryOptions::default(), move || {
            let calls = calls_in_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
