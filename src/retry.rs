//! Bounded exponential-backoff retry for network-flaky step actions.
//!
//! Waits grow as `initial × multiplier^(attempt-1)` and are capped at
//! `max_backoff`. The wait is the only place the retry loop blocks, and it
//! goes through a [`Sleeper`] so an operator interrupt ends it early.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

/// Granularity at which [`ThreadSleeper`] polls for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    /// Ceiling for a single wait; backoff stays here once reached.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(30),
            multiplier: 2,
            max_backoff: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let wait = self
            .multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.initial_backoff.checked_mul(factor))
            .unwrap_or(self.max_backoff);
        wait.min(self.max_backoff)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Returned by a [`Sleeper`] whose wait was cut short by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// Blocking wait between attempts.
pub trait Sleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<(), Interrupted>;
}

/// Real sleeper: sleeps in short slices, checking the token between them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<(), Interrupted> {
        let deadline = Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return Err(Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

/// Errors a retried thunk can produce.
pub trait AttemptError {
    /// A cancelled attempt ends the loop immediately instead of retrying.
    fn is_cancellation(&self) -> bool {
        false
    }
}

/// Successful value plus the attempt that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; `last` is the final attempt's error.
    Exhausted { attempts: u32, last: E },
    /// Cancellation observed before or between attempts.
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            RetryError::Cancelled { attempts } => {
                write!(f, "cancelled after {attempts} attempts")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Run `thunk` under `policy`. See [`with_retry_observed`].
pub fn with_retry<T, E: AttemptError>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancelToken,
    thunk: impl FnMut(u32) -> Result<T, E>,
) -> Result<Retried<T>, RetryError<E>> {
    with_retry_observed(policy, sleeper, cancel, thunk, |_, _, _| {})
}

/// Run `thunk` until it succeeds, attempts run out, or the run is cancelled.
///
/// `thunk` receives the 1-based attempt number. `on_failure` sees every
/// failed attempt together with the wait that follows it (`None` on the last).
pub fn with_retry_observed<T, E: AttemptError>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancelToken,
    mut thunk: impl FnMut(u32) -> Result<T, E>,
    mut on_failure: impl FnMut(u32, &E, Option<Duration>),
) -> Result<Retried<T>, RetryError<E>> {
    let max_attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt - 1,
            });
        }

        let err = match thunk(attempt) {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Err(err) => err,
        };

        // An interrupt also kills the running child, so its failure is not the
        // attempt's own.
        if err.is_cancellation() || cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        if attempt >= max_attempts {
            on_failure(attempt, &err, None);
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let wait = policy.backoff(attempt);
        on_failure(attempt, &err, Some(wait));
        if sleeper.sleep(wait, cancel).is_err() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;
    }
}

/// Sleeper that records requested waits without blocking.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    pub(crate) waits: std::cell::RefCell<Vec<Duration>>,
    /// Cancel the token once this many waits have been requested.
    pub(crate) cancel_after: Option<usize>,
}

#[cfg(test)]
impl RecordingSleeper {
    pub(crate) fn cancelling_after(waits: usize) -> Self {
        Self {
            cancel_after: Some(waits),
            ..Default::default()
        }
    }

    pub(crate) fn total(&self) -> Duration {
        self.waits.borrow().iter().sum()
    }
}

#[cfg(test)]
impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<(), Interrupted> {
        self.waits.borrow_mut().push(duration);
        if self.cancel_after == Some(self.waits.borrow().len()) {
            cancel.cancel();
        }
        if cancel.is_cancelled() {
            return Err(Interrupted);
        }
        Ok(())
    }
}
