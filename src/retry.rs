//! Bounded exponential backoff.
//!
//! One policy drives both connection attempts and publish retries: an
//! initial attempt, then up to `retries` further attempts, waiting
//! `base * 2^n` before retry `n`. A [`Cancellation`] ends the loop
//! early, including in the middle of a backoff wait.

use std::fmt::Display;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every allowed attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// An attempt failed with an error the policy does not retry.
    Aborted { attempts: u32, error: E },
    /// The owner cancelled before the next attempt.
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Aborted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

/// One-way stop flag shared between a retry loop and its owner.
///
/// Cancelling wakes any backoff wait immediately. Clones share the flag.
#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, wake) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `delay` unless cancelled first. Returns `false` when
    /// cancelled.
    pub fn sleep(&self, delay: Duration) -> bool {
        let (flag, wake) = &*self.inner;
        let deadline = Instant::now() + delay;
        let mut cancelled = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            cancelled = wake
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Total attempts the policy allows, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails with an error `should_retry`
    /// rejects, the attempts run out or `cancel` fires. `op` receives the
    /// 1-based attempt.
    pub fn run<T, E, F, P>(
        &self,
        cancel: &Cancellation,
        mut op: F,
        should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(error) if !should_retry(&error) => {
                    return Err(RetryError::Aborted {
                        attempts: attempt,
                        error,
                    })
                }
                Err(last) if attempt >= self.max_attempts() => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    })
                }
                Err(error) => {
                    let delay = self.delay_for(attempt);
                    warn!(attempt, ?delay, error = %error, "transient failure, backing off");
                    if !cancel.sleep(delay) {
                        return Err(RetryError::Cancelled { attempts: attempt });
                    }
                }
            }
        }
    }
}
