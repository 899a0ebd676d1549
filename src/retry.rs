//! Bounded retry for KV requests
//!
//! The Consul adapter retries transient transport failures (agent restarts,
//! leader elections) inside a single record operation. A record that still
//! fails afterwards becomes a record failure and is picked up again by the
//! next sync cycle, so the budget here stays small.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::sleep;

/// How often and how patiently a KV request is retried
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,

    /// Delay before the first retry; doubles with every further retry
    pub base_delay: Duration,

    /// Upper bound for a single delay, before spread
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Default delays with a specific retry budget
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (0-based) of the request on `key`.
    ///
    /// Up to 25% is added on top of the capped delay, derived from the key so
    /// that records of one cycle failing together do not retry in lockstep.
    pub fn delay(&self, key: &str, retry: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);

        let mut hasher = DefaultHasher::new();
        (key, retry).hash(&mut hasher);
        let spread = (hasher.finish() % 256) as f64 / 1024.0;

        doubled.mul_f64(1.0 + spread)
    }
}

/// Errors that know whether the same request could succeed later
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Run `request` on `key` until it succeeds, fails permanently or the retry
/// budget of `policy` is spent. Returns the last error in the latter cases.
pub async fn retry_request<F, Fut, T, E>(
    policy: &RetryPolicy,
    op: &'static str,
    key: &str,
    mut request: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut retry = 0;
    loop {
        let err = match request().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_transient() {
            tracing::debug!(op, key, error = %err, "KV request failed permanently");
            return Err(err);
        }
        if retry >= policy.retries {
            tracing::warn!(op, key, attempts = retry + 1, error = %err, "KV request failed, giving up");
            return Err(err);
        }

        let delay = policy.delay(key, retry);
        tracing::debug!(
            op,
            key,
            retry = retry + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying KV request"
        );
        sleep(delay).await;
        retry += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    fn fast(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        let within = |d: Duration, base: u64| {
            let base = Duration::from_millis(base);
            d >= base && d <= base.mul_f64(1.25)
        };
        assert!(within(policy.delay("repo/a", 0), 100));
        assert!(within(policy.delay("repo/a", 1), 200));
        assert!(within(policy.delay("repo/a", 2), 350));
        assert!(within(policy.delay("repo/a", 30), 350));
    }

    #[test]
    fn test_delay_is_stable_per_key() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay("repo/a", 1), policy.delay("repo/a", 1));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let result: Result<&str, Flaky> = retry_request(&fast(3), "get", "k", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err(Flaky(true))
                } else {
                    Ok("value")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "value");
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_budget_is_bounded() {
        let calls = Cell::new(0);
        let result: Result<(), Flaky> = retry_request(&fast(2), "set", "k", || {
            calls.set(calls.get() + 1);
            async { Err(Flaky(true)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 3);

        calls.set(0);
        let _ = retry_request(&fast(0), "set", "k", || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(Flaky(true)) }
        })
        .await;
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_at_once() {
        let calls = Cell::new(0);
        let result: Result<(), Flaky> = retry_request(&fast(3), "delete", "k", || {
            calls.set(calls.get() + 1);
            async { Err(Flaky(false)) }
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "flaky(transient=false)");
        assert_eq!(calls.get(), 1);
    }
}
