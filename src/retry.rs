//! Bounded exponential backoff
//!
//! Transient failures (write contention, backpressure, expired leases,
//! blown time budgets) are retried locally a fixed number of times before
//! being surfaced to the caller.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Errors that know whether retrying could help
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Retry schedule: `base * 2^attempt`, capped, plus up to 50% jitter
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based), without jitter
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff with random jitter added
    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff_duration(attempt);
        let spread = (base.as_millis() as u64) / 2;
        if spread == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Transient + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.jittered(attempt);
                    debug!("{} failed transiently ({}), retrying in {:?}", what, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Like [`RetryPolicy::run`], but every attempt must finish within `budget`
    pub async fn run_with_budget<T, E, F, Fut>(
        &self,
        what: &str,
        budget: Duration,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Transient + std::fmt::Display + From<Elapsed>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(what, || {
            let fut = op();
            async move {
                match tokio::time::timeout(budget, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(E::from(Elapsed { budget })),
                }
            }
        })
        .await
    }
}

/// An operation exceeded its time budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed {
    pub budget: Duration,
}

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation exceeded its {}ms budget", self.budget.as_millis())
    }
}
