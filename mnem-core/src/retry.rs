//! Retry logic with exponential backoff.
//!
//! One policy type and one retry loop, shared by the session manager (for
//! verification backoff) and the connection manager (for per-endpoint
//! retries). Retry decisions come from [`Error::is_retryable`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for zero prior failures
    pub base: Duration,
    /// Upper bound for any delay, jitter included
    pub max: Duration,
    /// Growth factor per failure
    pub multiplier: f64,
    /// Symmetric random spread applied around the nominal delay
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// `base * multiplier^failures`, capped at `max`. Non-decreasing in `failures`.
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        let exp = failures.min(63) as i32;
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Nominal delay with uniform jitter in `[-jitter, +jitter]`, clamped to `[0, max]`.
    pub fn delay(&self, failures: u32) -> Duration {
        let nominal = self.nominal_delay(failures).as_millis() as i64;
        let spread = self.jitter.as_millis() as i64;
        let offset = if spread > 0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0
        };
        let max = self.max.as_millis() as i64;
        Duration::from_millis((nominal + offset).clamp(0, max) as u64)
    }
}

/// Run `fut` with an explicit deadline, mapping expiry to [`Error::Timeout`].
pub async fn with_timeout<T, Fut>(after: Duration, operation: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, after)),
    }
}

/// Execute an async operation, retrying network-class failures.
///
/// Attempt `n` (1-based) that fails retryably is followed by a sleep of
/// `policy.delay(n - 1)`. Non-retryable errors are returned immediately.
/// The cancellation token aborts both in-flight attempts and pending sleeps.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    max_attempts: u32,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = operation(attempt) => outcome,
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay(attempt - 1);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => {
                debug!(attempt, error = %e, "Operation failed, no more retries");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(Duration::ZERO)
    }

    #[test]
    fn test_nominal_delay_grows_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(1000))
            .with_jitter(Duration::ZERO);

        assert_eq!(policy.nominal_delay(0), Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(200));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(800));
        assert_eq!(policy.nominal_delay(4), Duration::from_millis(1000));
        assert_eq!(policy.nominal_delay(40), Duration::from_millis(1000));

        let mut previous = Duration::ZERO;
        for n in 0..70 {
            let d = policy.nominal_delay(n);
            assert!(d >= previous);
            previous = d;
        }
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10))
            .with_jitter(Duration::from_millis(50));

        for _ in 0..200 {
            let d = policy.delay(3).as_millis();
            assert!((750..=850).contains(&d), "delay {} out of range", d);
        }

        let capped = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(300))
            .with_jitter(Duration::from_millis(50));
        for _ in 0..200 {
            assert!(capped.delay(10) <= Duration::from_millis(300));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_network_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = calls.clone();
        let result = retry_with_backoff(&fast_policy(), 3, &cancel, |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Network("connection refused".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_at_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = calls.clone();
        let result: Result<()> = retry_with_backoff(&fast_policy(), 4, &cancel, |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::timeout("connect", Duration::from_millis(1)))
            }
        })
        .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_never_retries_auth() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = calls.clone();
        let result: Result<()> = retry_with_backoff(&fast_policy(), 5, &cancel, |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::Auth("forbidden".into()))
            }
        })
        .await;

        assert!(result.unwrap_err().is_auth());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_cancelled_during_sleep() {
        let policy = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(60))
            .with_jitter(Duration::ZERO);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<()> = retry_with_backoff(&policy, 3, &cancel, |_| async {
            Err(Error::Network("unreachable".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_with_timeout_maps_to_timeout_error() {
        let result: Result<()> = with_timeout(Duration::from_millis(10), "verify", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().starts_with("verify"));
    }
}
