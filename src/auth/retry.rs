//! Exponential-backoff retry for fallible async operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::StdRng};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Backoff shape for one retried operation. `max_attempts = 1` disables
/// retry entirely.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    #[must_use]
    pub fn with_backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier.max(1.0);
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    #[must_use]
    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Host-injectable check run immediately before each retry attempt.
///
/// Checks run in registration order, after the backoff sleep of the retry
/// they precede. The first attempt runs without them. Typical
/// implementations wait for connectivity or add jitter; they are
/// best-effort and cannot fail the flow.
#[async_trait]
pub trait PreflightCheck: Send + Sync {
    async fn run(&self);

    fn name(&self) -> &str {
        "preflight"
    }
}

/// Preflight that sleeps a random duration up to a bound, spreading
/// simultaneous retries from backgrounded tabs apart.
#[derive(Clone, Copy, Debug)]
pub struct JitterDelay {
    max: Duration,
}

impl JitterDelay {
    #[must_use]
    pub fn new(max: Duration) -> Self {
        Self { max }
    }
}

#[async_trait]
impl PreflightCheck for JitterDelay {
    async fn run(&self) {
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return;
        }
        let jitter_ms = StdRng::from_entropy().gen_range(0..=max_ms);
        sleep(Duration::from_millis(jitter_ms)).await;
    }

    fn name(&self) -> &str {
        "jitter-delay"
    }
}

/// Why a retried operation settled without a value.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error> {
    /// The attempt was superseded; callers must not treat this as a
    /// retryable failure.
    #[error("operation cancelled before completion")]
    Cancelled,
    /// The last error from the operation, after the predicate or the
    /// attempt budget stopped the retries.
    #[error("{0}")]
    Inner(E),
}

/// Runs an operation under a [`RetryPolicy`] with cooperative cancellation.
pub struct RetryExecutor {
    policy: RetryPolicy,
    preflights: Vec<Arc<dyn PreflightCheck>>,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            preflights: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_preflight(mut self, check: Arc<dyn PreflightCheck>) -> Self {
        self.preflights.push(check);
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invokes `op`; on failure, while attempts remain and
    /// `should_retry(&err)` holds, sleeps the current backoff delay (scaled
    /// by the multiplier after each use) and tries again. A success on any
    /// attempt returns immediately. The backoff sleep races the
    /// cancellation token, and cancellation is re-checked after every
    /// resume, including after `op` itself settles.
    pub async fn run<T, E, Op, Fut>(
        &self,
        cancel: &CancellationToken,
        should_retry: impl Fn(&E) -> bool,
        mut op: Op,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error,
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut delay = self.policy.initial_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;

            if attempt > 1 {
                warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "backing off before retry"
                );
                tokio::select! {
                    () = sleep(delay) => {}
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                }
                if cancel.is_cancelled() {
                    return Err(RetryError::Cancelled);
                }
                delay = delay.mul_f64(self.policy.backoff_multiplier);

                for check in &self.preflights {
                    debug!(name = check.name(), "running preflight check");
                    check.run().await;
                    if cancel.is_cancelled() {
                        return Err(RetryError::Cancelled);
                    }
                }
            }

            match op(attempt).await {
                Ok(value) => {
                    if cancel.is_cancelled() {
                        return Err(RetryError::Cancelled);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Err(RetryError::Cancelled);
                    }
                    if attempt >= max_attempts || !should_retry(&err) {
                        return Err(RetryError::Inner(err));
                    }
                    debug!(attempt, error = %err, "attempt failed, will retry");
                }
            }
        }
    }
}
