//! Condition polling with exponential backoff and cancellation support.
//!
//! Provides a generic abstraction for waiting on a guest (or any async
//! condition) to become ready, bounded by a hard deadline.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for resource waiting with exponential backoff.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Initial delay between checks
    pub initial_delay: Duration,
    /// Maximum delay between checks (cap for exponential growth)
    pub max_delay: Duration,
    /// Maximum total time to wait before timeout
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Why a wait ended without the condition holding
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timeout waiting for {resource} after {timeout:?} ({attempts} attempts)")]
    Timeout {
        resource: String,
        timeout: Duration,
        attempts: u32,
    },

    #[error("wait for {resource} cancelled")]
    Cancelled { resource: String },
}

/// Wait for a condition to produce a value, with exponential backoff.
///
/// The whole wait, including an in-flight check, is bounded by
/// `config.timeout`; a check still running at the deadline is dropped.
///
/// # Arguments
/// * `config` - Wait configuration
/// * `cancel` - Optional cancellation token
/// * `check` - Async function returning `Some(value)` when ready, `None` to retry
/// * `resource_name` - Name for logging
///
/// # Example
/// ```ignore
/// let address = wait_for_resource(
///     WaitConfig::default(),
///     Some(&cancel_token),
///     || async { probe_guest().await.ok() },
///     "small",
/// )
/// .await?;
/// ```
pub async fn wait_for_resource<T, F, Fut>(
    config: WaitConfig,
    cancel: Option<&CancellationToken>,
    mut check: F,
    resource_name: &str,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let attempts = AtomicU32::new(0);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_factor(2.0)
        .without_max_times()
        .build();
    let mut delays = backoff.into_iter();

    let cancelled = || async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };

    let poll = async {
        loop {
            attempts.fetch_add(1, Ordering::Relaxed);

            if let Some(value) = check().await {
                debug!(
                    resource = %resource_name,
                    attempts = attempts.load(Ordering::Relaxed),
                    elapsed_ms = start.elapsed().as_millis(),
                    "Resource ready"
                );
                return value;
            }

            let delay = delays.next().unwrap_or(config.max_delay);
            debug!(
                resource = %resource_name,
                attempt = attempts.load(Ordering::Relaxed),
                delay_ms = delay.as_millis(),
                "Resource not ready, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    };

    tokio::select! {
        biased;
        _ = cancelled() => Err(WaitError::Cancelled {
            resource: resource_name.to_string(),
        }),
        result = tokio::time::timeout(config.timeout, poll) => result.map_err(|_| WaitError::Timeout {
            resource: resource_name.to_string(),
            timeout: config.timeout,
            attempts: attempts.load(Ordering::Relaxed),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(timeout_secs: u64) -> WaitConfig {
        WaitConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_value_once_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = wait_for_resource(
            config(60),
            None,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { (n >= 3).then_some(n) }
            },
            "guest",
        )
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_hard_bound() {
        let start = Instant::now();
        let err = wait_for_resource(config(10), None, || async { None::<()> }, "guest")
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Timeout { .. }));
        assert!(start.elapsed() <= Duration::from_secs(10) + Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_check_still_times_out() {
        let err = wait_for_resource(
            config(5),
            None,
            || std::future::pending::<Option<()>>(),
            "guest",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WaitError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            canceller.cancel();
        });

        let err = wait_for_resource(config(60), Some(&token), || async { None::<()> }, "guest")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WaitError::Cancelled {
                resource: "guest".into()
            }
        );
    }
}
