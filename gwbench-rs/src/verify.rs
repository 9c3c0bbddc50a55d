//! Bounded-retry verification of eventually-consistent remote operations.
//!
//! Every long-running remote operation in the lifecycle flows (gateway
//! upgrade, tunnel establishment, diagnostics) is confirmed by polling a
//! boolean predicate under a caller-supplied [`RetryPolicy`]. The policy
//! constants live at the call sites: they encode expected operation
//! durations, not universal truths.

use std::future::Future;
use std::time::Duration;

use log::{error, info};

/// Retry policy for one verification call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of predicate invocations.
    pub attempts: u32,
    /// Sleep between two consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> RetryPolicy {
        RetryPolicy { attempts, delay }
    }

    /// Worst-case wall-clock budget of this policy.
    pub fn budget(&self) -> Duration {
        self.delay * self.attempts
    }
}

/// Runs `check` until it reports success or the attempt budget is exhausted.
///
/// The first `Ok(true)` wins immediately. `Ok(false)` is logged, followed by
/// a `policy.delay` sleep and a retry. Exhaustion returns `Ok(false)` rather
/// than an error so the caller decides whether it is fatal. An `Err` from the
/// predicate aborts right away: predicates translate transient transport
/// failures into `Ok(false)` themselves and reserve errors for conditions a
/// retry cannot fix, such as the polled target vanishing.
pub async fn verify<F, Fut, E>(name: &str, policy: &RetryPolicy, mut check: F) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    info!("{name} is running");
    for attempt in 1..=policy.attempts {
        if check().await? {
            info!("{name} pass (attempt {attempt}/{})", policy.attempts);
            return Ok(true);
        }
        error!("{name} fail (attempt {attempt}/{}), wait to retry", policy.attempts);
        if attempt < policy.attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }
    error!(
        "{name} still failing after {} attempts over {:?}",
        policy.attempts,
        policy.budget()
    );
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::convert::Infallible;

    #[tokio::test]
    async fn exhaustion_returns_false_after_exactly_max_attempts() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let outcome: Result<bool, Infallible> = verify("always_false", &policy, || {
            calls.set(calls.get() + 1);
            async { Ok(false) }
        })
        .await;
        assert_eq!(outcome, Ok(false));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn first_success_stops_polling() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let outcome: Result<bool, Infallible> = verify("third_time_lucky", &policy, || {
            calls.set(calls.get() + 1);
            let pass = calls.get() == 3;
            async move { Ok(pass) }
        })
        .await;
        assert_eq!(outcome, Ok(true));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn predicate_error_is_fatal_immediately() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::new(10, Duration::ZERO);
        let outcome: Result<bool, &str> = verify("vanished_target", &policy, || {
            calls.set(calls.get() + 1);
            async { Err("target does not exist") }
        })
        .await;
        assert_eq!(outcome, Err("target does not exist"));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn budget_is_attempts_times_delay() {
        let policy = RetryPolicy::new(20, Duration::from_secs(15));
        assert_eq!(policy.budget(), Duration::from_secs(300));
    }
}
