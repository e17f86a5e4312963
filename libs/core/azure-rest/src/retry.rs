use crate::error::{RestError, RestResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration applied to every Azure REST call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries; an operation runs at most `max_retries + 1` times.
    pub max_retries: u32,

    /// Backoff ceiling in seconds.
    pub max_backoff_secs: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            max_backoff_secs: 256,
        }
    }
}

/// Backoff before the retry that follows failed attempt `attempt` (0-indexed):
/// `min(2^(attempt-1), ceiling) + U(0,1)` seconds.
fn backoff(attempt: u32, max_backoff_secs: u64) -> Duration {
    let base = 2f64
        .powi(attempt as i32 - 1)
        .min(max_backoff_secs as f64);
    let jitter: f64 = rand::rng().random();
    Duration::from_secs_f64(base + jitter)
}

/// `retry-after` overrides the exponential backoff, keeping the jitter.
fn throttle_backoff(retry_after_secs: u64) -> Duration {
    let jitter: f64 = rand::rng().random();
    Duration::from_secs_f64(retry_after_secs as f64 + jitter)
}

/// Run `operation` up to `policy.max_retries + 1` times.
///
/// Transient failures (see [`RestError::is_retryable`]) sleep then retry; on a
/// throttling response carrying `retry-after` that value is honored instead of
/// the computed backoff. Non-retryable errors and the final failure propagate.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> RestResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RestResult<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} retries", attempt);
                }
                return Ok(result);
            }
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                if attempt >= policy.max_retries {
                    warn!(
                        "Operation failed after {} attempts: {}",
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = match e.throttle_retry_after() {
                    Some(secs) => throttle_backoff(secs),
                    None => backoff(attempt, policy.max_backoff_secs),
                };

                debug!(
                    "Transient failure (attempt {}/{}): {}. Retrying in {:.1}s...",
                    attempt + 1,
                    policy.max_retries + 1,
                    e,
                    delay.as_secs_f64()
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transient() -> RestError {
        RestError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".to_string(),
            retry_after: None,
        }
    }

    fn fatal() -> RestError {
        RestError::Status {
            status: StatusCode::FORBIDDEN,
            body: "denied".to_string(),
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&RetryPolicy::new(3), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RestError>("ok")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&RetryPolicy::new(5), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_propagates_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: RestResult<()> = with_retry(&RetryPolicy::new(2), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        // 1 initial + 2 retries
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: RestResult<()> = with_retry(&RetryPolicy::new(5), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(fatal())
            }
        })
        .await;

        assert_eq!(
            result.unwrap_err().status_code(),
            Some(StatusCode::FORBIDDEN)
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let start = tokio::time::Instant::now();

        let result = with_retry(&RetryPolicy::new(5), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RestError::Status {
                        status: StatusCode::TOO_MANY_REQUESTS,
                        body: String::new(),
                        retry_after: Some(3),
                    })
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        // two sleeps of retry-after(3) + jitter(<1) each
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(6));
        assert!(elapsed < Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_growth_and_ceiling() {
        // min(2^(i-1), 256) + U(0,1)
        for (attempt, base) in [(0u32, 0.5f64), (1, 1.0), (4, 8.0), (20, 256.0)] {
            for _ in 0..10 {
                let d = backoff(attempt, 256).as_secs_f64();
                assert!(d >= base, "attempt {attempt}: {d} < {base}");
                assert!(d < base + 1.0, "attempt {attempt}: {d} >= {}", base + 1.0);
            }
        }
    }
}
