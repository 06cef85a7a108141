//! Operation error types.
//!
//! An operation can fail in two ways. A transient error is expected to go
//! away on retry (a scratch file was locked, a numeric solver hit an unlucky
//! seed). A fatal error will not (malformed input, a degenerate mesh). Workers
//! retry transient errors according to their [`RetryStrategy`] and then treat
//! them as fatal. A fatal error becomes an
//! [`Outcome::Err`](crate::task::Outcome::Err) for the submitter.
use std::{num::NonZeroU32, time::Duration};

use futures::Future;
use thiserror::Error;

/// A retry strategy for handling transient errors.
///
/// The following strategies are supported:
/// - `Immediate`: Retry the operation immediately (default).
/// - `After`: Retry the operation after a specified duration.
/// - `Exponential`: Retry the operation with exponential backoff until the
///   maximum elapsed time is reached.
#[derive(Debug, Clone, Copy)]
pub enum RetryStrategy {
    /// Retry the operation immediately.
    Immediate { max_retries: NonZeroU32 },
    /// Retry the operation after a specified duration.
    After {
        max_retries: NonZeroU32,
        duration: Duration,
    },
    /// Retry the operation with the provided exponential backoff.
    Exponential {
        min_duration: Duration,
        max_duration: Duration,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Immediate {
            max_retries: NonZeroU32::MIN.saturating_add(2),
        }
    }
}

impl RetryStrategy {
    fn into_backoff(self) -> Option<backoff::ExponentialBackoff> {
        match self {
            Self::Exponential {
                min_duration,
                max_duration,
            } => Some(
                backoff::ExponentialBackoffBuilder::new()
                    .with_initial_interval(min_duration)
                    .with_max_elapsed_time(Some(max_duration))
                    .build(),
            ),
            _ => None,
        }
    }
}

/// Operation error types.
///
/// ```
/// use spindle::operation::{OperationError, Result};
///
/// fn slope(dx: f64, dy: f64) -> Result<f64> {
///     if dx == 0.0 {
///         return Err(OperationError::fatal_str("vertical segment"));
///     }
///     Ok(dy / dx)
/// }
///
/// assert_eq!(slope(2.0, 1.0).unwrap(), 0.5);
/// assert_eq!(
///     slope(0.0, 1.0).unwrap_err().to_string(),
///     "Fatal operation error: vertical segment"
/// );
/// ```
#[derive(Error, Debug)]
pub enum OperationError {
    /// An error that is expected to be resolved by retrying the operation.
    #[error("Transient operation error: {err}")]
    Transient {
        /// The underlying error.
        err: anyhow::Error,
        /// The retry strategy.
        retry_strategy: RetryStrategy,
    },
    /// An error that is not expected to be resolved by retrying the operation.
    #[error("Fatal operation error: {err}")]
    Fatal {
        /// The underlying error.
        err: anyhow::Error,
    },
}

impl OperationError {
    pub fn transient(err: impl Into<anyhow::Error>, retry_strategy: RetryStrategy) -> Self {
        Self::Transient {
            err: err.into(),
            retry_strategy,
        }
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal { err: err.into() }
    }

    pub fn fatal_str(msg: &str) -> Self {
        Self::fatal(anyhow::Error::msg(msg.to_string()))
    }

    /// Retry the operation according to the strategy, reporting each failed
    /// attempt to `tracer`.
    ///
    /// A fatal error is returned unchanged. A transient error that outlives
    /// its retry policy is converted into a fatal error.
    pub async fn retry_trace<O, Fut, F, T>(self, f: F, tracer: T) -> Result<O>
    where
        Fut: Future<Output = Result<O>>,
        F: Fn() -> Fut,
        T: Fn(&OperationError),
    {
        let strategy = match self {
            Self::Transient { retry_strategy, .. } => retry_strategy,
            fatal => return Err(fatal),
        };

        let outcome = match strategy.into_backoff() {
            Some(backoff) => {
                backoff::future::retry_notify(
                    backoff,
                    || async {
                        f().await.map_err(|err| match err {
                            transient @ Self::Transient { .. } => {
                                backoff::Error::transient(transient)
                            }
                            fatal => backoff::Error::permanent(fatal),
                        })
                    },
                    |err: OperationError, _| tracer(&err),
                )
                .await
            }
            None => retry_simple(f, strategy, &tracer).await,
        };

        outcome.map_err(Self::into_fatal)
    }

    /// Extract the underlying error.
    pub fn into_err(self) -> anyhow::Error {
        match self {
            Self::Transient { err, .. } => err,
            Self::Fatal { err } => err,
        }
    }

    /// Convert an error into a fatal error.
    pub fn into_fatal(self) -> Self {
        match self {
            Self::Transient { err, .. } => Self::Fatal { err },
            fatal => fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, OperationError>;

/// Retries a future with the strategy's maximum number of retries and delay.
async fn retry_simple<O, Fut, F, T>(f: F, strategy: RetryStrategy, tracer: &T) -> Result<O>
where
    Fut: Future<Output = Result<O>>,
    F: Fn() -> Fut,
    T: Fn(&OperationError),
{
    let (max_retries, delay) = match strategy {
        RetryStrategy::Immediate { max_retries } => (max_retries, None),
        RetryStrategy::After {
            max_retries,
            duration,
        } => (max_retries, Some(duration)),
        RetryStrategy::Exponential { .. } => unreachable!("handled by backoff"),
    };

    let mut num_retries = 0;
    loop {
        match f().await {
            Ok(output) => return Ok(output),
            Err(err @ OperationError::Fatal { .. }) => return Err(err),
            Err(err) if num_retries >= max_retries.get() => return Err(err),
            Err(err) => {
                tracer(&err);
                num_retries += 1;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    fn flaky(attempts: Arc<AtomicU32>, succeed_on: u32) -> impl Fn() -> futures::future::Ready<Result<u32>> {
        move || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            futures::future::ready(if attempt >= succeed_on {
                Ok(attempt)
            } else {
                Err(OperationError::transient(
                    anyhow::anyhow!("attempt {attempt}"),
                    RetryStrategy::default(),
                ))
            })
        }
    }

    #[tokio::test]
    async fn transient_error_recovers_within_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let traced = AtomicU32::new(0);
        let initial = OperationError::transient(anyhow::anyhow!("first"), RetryStrategy::default());

        let result = initial
            .retry_trace(flaky(attempts.clone(), 2), |_| {
                traced.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(traced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_become_fatal() {
        let attempts = Arc::new(AtomicU32::new(0));
        let initial = OperationError::transient(
            anyhow::anyhow!("first"),
            RetryStrategy::Immediate {
                max_retries: NonZeroU32::MIN.saturating_add(1),
            },
        );

        let result = initial
            .retry_trace(flaky(attempts.clone(), 100), |_| {})
            .await;

        assert!(matches!(result, Err(OperationError::Fatal { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = OperationError::fatal_str("degenerate triangle")
            .retry_trace(flaky(attempts.clone(), 1), |_| {})
            .await;

        assert_eq!(
            result.unwrap_err().to_string(),
            "Fatal operation error: degenerate triangle"
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
