//! Bounded retry with exponential backoff and jitter.
//!
//! Only rate-limit and transport failures are retried; the attempt cap and
//! delays come from configuration. Sleeping goes through the [`Sleeper`]
//! trait so tests can record delays instead of waiting them out. A whole
//! fleet of FPGA hosts can restart at once, so every delay carries random
//! jitter to spread the retry storm.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::{Error, Result};

/// Retry schedule for a network stage.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Backoff before attempt `next_attempt` (2, 3, ...), without jitter.
    fn backoff(&self, next_attempt: u32) -> Duration {
        let exp = next_attempt.saturating_sub(2).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&HttpConfig> for RetryPolicy {
    fn from(http: &HttpConfig) -> Self {
        Self {
            max_attempts: http.max_attempts.max(1),
            base_delay: Duration::from_millis(http.base_delay_ms),
            max_delay: Duration::from_millis(http.max_delay_ms),
        }
    }
}

/// Async sleep, injectable for deterministic tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real clock.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Run `op` with bounded retries under `policy`.
///
/// Non-retryable errors surface immediately. Retryable ones are retried
/// until the attempt cap, sleeping `max(backoff, Retry-After) + jitter`
/// between attempts. Cancellation interrupts both the in-flight operation
/// and any backoff sleep and yields [`Error::Cancelled`].
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    stage: &'static str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut prev_delay = Duration::ZERO;

    for attempt in 1..=max_attempts {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = op() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt == max_attempts {
            return Err(err);
        }

        let mut delay = policy.backoff(attempt + 1);
        if let Some(server_delay) = err.retry_after() {
            delay = delay.max(server_delay.min(policy.max_delay));
        }
        // Floor at the previous slept delay: a constant Retry-After can
        // dominate the doubling backoff, and independent jitter alone
        // would let consecutive delays shrink.
        delay = delay.max(prev_delay) + jitter(delay);
        prev_delay = delay;

        warn!(
            "{stage}: attempt {attempt}/{max_attempts} failed ({err}), retrying in {:?}",
            delay
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleeper.sleep(delay) => {}
        }
    }

    // Loop always returns from within; attempts are >= 1.
    unreachable!("retry loop exited without a result")
}

/// Random jitter up to a quarter of the delay. The caller floors each
/// delay at the previous one, so jitter only ever stretches the schedule.
fn jitter(delay: Duration) -> Duration {
    let quarter = (delay.as_millis() / 4) as u64;
    if quarter == 0 {
        return Duration::ZERO;
    }
    debug!("adding up to {quarter}ms jitter");
    Duration::from_millis(rand::thread_rng().gen_range(0..=quarter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Records requested sleeps instead of waiting.
    pub struct RecordingSleeper {
        pub delays: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub fn new() -> Self {
            Self {
                delays: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_success_needs_no_sleep() {
        let sleeper = RecordingSleeper::new();
        let cancel = CancellationToken::new();
        let result: Result<u32> =
            with_retries(&policy(3), &sleeper, &cancel, "test", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_retries_then_surfaces() {
        let sleeper = RecordingSleeper::new();
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<u32> = with_retries(&policy(3), &sleeper, &cancel, "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::RateLimited {
                    retry_after: Some(Duration::from_millis(250)),
                    detail: "slow down".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(Error::RateLimited { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // Two sleeps between three attempts, non-decreasing, each at least
        // the server-requested backoff.
        let delays = sleeper.delays.lock().unwrap();
        assert_eq!(delays.len(), 2);
        assert!(delays[0] >= Duration::from_millis(250));
        assert!(delays[1] >= delays[0]);
    }

    #[tokio::test]
    async fn test_delays_never_shrink_under_constant_retry_after() {
        // A constant Retry-After larger than every backoff step puts all
        // attempts on the same floor; only the previous-delay floor keeps
        // the jittered schedule from shrinking. Repeat to give the random
        // jitter plenty of chances to misbehave.
        for _ in 0..200 {
            let sleeper = RecordingSleeper::new();
            let cancel = CancellationToken::new();

            let result: Result<u32> =
                with_retries(&policy(4), &sleeper, &cancel, "test", || async {
                    Err(Error::RateLimited {
                        retry_after: Some(Duration::from_secs(1)),
                        detail: "secondary rate limit".into(),
                    })
                })
                .await;
            assert!(matches!(result, Err(Error::RateLimited { .. })));

            let delays = sleeper.delays.lock().unwrap();
            assert_eq!(delays.len(), 3);
            assert!(delays.iter().all(|d| *d >= Duration::from_secs(1)));
            assert!(delays.windows(2).all(|w| w[1] >= w[0]));
        }
    }

    #[tokio::test]
    async fn test_transport_failure_recovers() {
        let sleeper = RecordingSleeper::new();
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<&str> = with_retries(&policy(3), &sleeper, &cancel, "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::transport("connection refused"))
                } else {
                    Ok("token")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "token");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.delays.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_surfaces_immediately() {
        let sleeper = RecordingSleeper::new();
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<u32> = with_retries(&policy(5), &sleeper, &cancel, "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::AuthenticationRejected {
                    status: Some(401),
                    detail: "bad credentials".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(Error::AuthenticationRejected { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_backoff() {
        let sleeper = RecordingSleeper::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<u32> =
            with_retries(&policy(3), &sleeper, &cancel, "test", || async { Ok(1) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        };
        assert_eq!(p.backoff(2), Duration::from_millis(500));
        assert_eq!(p.backoff(3), Duration::from_millis(1000));
        assert_eq!(p.backoff(4), Duration::from_millis(2000));
        assert_eq!(p.backoff(5), Duration::from_secs(2)); // capped
    }
}
