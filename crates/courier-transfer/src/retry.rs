use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Each retry waits twice as long as the one before it.
pub const BACKOFF_MULTIPLIER: u32 = 2;

/// Attempt budget for one call site. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    per_attempt_timeout: Duration,
}

/// What a single attempt produced.
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    Success(T),
    Failure(E),
    TimedOut,
}

#[derive(Debug)]
pub enum AttemptError<E> {
    Failed(E),
    TimedOut(Duration),
}

/// Raised once every attempt has been spent, or a failure was not worth retrying.
#[derive(Debug)]
pub struct RetryError<E> {
    pub label: String,
    pub attempts: u32,
    pub last: AttemptError<E>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, per_attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            per_attempt_timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        self.per_attempt_timeout
    }

    /// Same budget with a different per-attempt timeout.
    pub fn with_timeout(self, per_attempt_timeout: Duration) -> Self {
        Self {
            per_attempt_timeout,
            ..self
        }
    }

    /// Delay slept after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = BACKOFF_MULTIPLIER.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }

    /// Runs `operation` until it succeeds or the attempt budget is spent.
    pub async fn execute<T, E, F, Fut>(
        &self,
        label: &str,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_if(label, operation, |_| true).await
    }

    /// Like [`RetryPolicy::execute`], but a failure for which `retry_if` returns
    /// false is raised immediately. Timeouts are always retried.
    ///
    /// A timed-out attempt's future is dropped before the next attempt starts, so a
    /// response that arrives late is never observed.
    pub async fn execute_if<T, E, F, Fut, P>(
        &self,
        label: &str,
        mut operation: F,
        retry_if: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: Fn(&E) -> bool,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let attempt_started = Instant::now();
            debug!(
                label,
                attempt,
                max_attempts = self.max_attempts,
                "starting attempt"
            );

            let outcome = match timeout(self.per_attempt_timeout, operation()).await {
                Ok(Ok(value)) => AttemptOutcome::Success(value),
                Ok(Err(err)) => AttemptOutcome::Failure(err),
                Err(_) => AttemptOutcome::TimedOut,
            };

            let failure = match outcome {
                AttemptOutcome::Success(value) => {
                    if attempt > 1 {
                        info!(
                            label,
                            attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                AttemptOutcome::Failure(err) => AttemptError::Failed(err),
                AttemptOutcome::TimedOut => AttemptError::TimedOut(self.per_attempt_timeout),
            };

            let retryable = match &failure {
                AttemptError::Failed(err) => retry_if(err),
                AttemptError::TimedOut(_) => true,
            };
            warn!(
                label,
                attempt,
                max_attempts = self.max_attempts,
                elapsed_ms = attempt_started.elapsed().as_millis() as u64,
                timed_out = failure.is_timeout(),
                error = %failure,
                "attempt failed"
            );

            if !retryable || attempt >= self.max_attempts {
                error!(
                    label,
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    retryable,
                    "giving up"
                );
                return Err(RetryError {
                    label: label.to_string(),
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = self.delay_after(attempt);
            info!(label, attempt, delay_ms = delay.as_millis() as u64, "retrying");
            sleep(delay).await;
        }
    }
}

impl<E> AttemptError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AttemptError::TimedOut(_))
    }
}

impl<E> RetryError<E> {
    pub fn timed_out(&self) -> bool {
        self.last.is_timeout()
    }

    pub fn last_error(&self) -> Option<&E> {
        match &self.last {
            AttemptError::Failed(err) => Some(err),
            AttemptError::TimedOut(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Failed(err) => err.fmt(f),
            AttemptError::TimedOut(after) => write!(f, "attempt timed out after {after:?}"),
        }
    }
}

impl<E: StdError + 'static> StdError for AttemptError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            AttemptError::Failed(err) => Some(err),
            AttemptError::TimedOut(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} attempt(s): {}",
            self.label, self.attempts, self.last
        )
    }
}

impl<E: StdError + 'static> StdError for RetryError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.last)
    }
}
