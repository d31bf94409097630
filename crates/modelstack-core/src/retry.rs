//! Shared retry policy with exponential backoff
//!
//! One policy value drives both download retries and liveness polling so
//! the backoff schedule is defined in a single place.

use std::future::Future;
use std::time::Duration;

/// Bounded retry schedule: a maximum attempt count and an exponentially
/// growing delay between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Delay to sleep before attempt `attempt` (attempt 0 runs immediately).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 1).min(16);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted,
    /// sleeping the scheduled backoff between attempts. Returns the last
    /// error when every attempt fails.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            let delay = self.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= self.max_attempts => return Err(err),
                Err(_) => attempt += 1,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(policy.delay_before(0), Duration::ZERO);
        assert_eq!(policy.delay_before(1), Duration::from_secs(1));
        assert_eq!(policy.delay_before(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before(3), Duration::from_secs(4));
        assert_eq!(policy.delay_before(4), Duration::from_secs(8));
        assert_eq!(policy.delay_before(7), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40));
        let calls = Cell::new(0u32);
        let result: Result<u32, &str> = policy
            .run(|_| {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { if n < 3 { Err("not yet") } else { Ok(n) } }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_budget_exhausted() {
        let policy = RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(5));
        let result: Result<(), String> = policy
            .run(|attempt| async move { Err(format!("attempt {attempt}")) })
            .await;
        assert_eq!(result.unwrap_err(), "attempt 1");
    }
}
