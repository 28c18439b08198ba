//! Bounded exponential backoff.
//!
//! `Backoff` is a pure policy (attempt counter in, delay out). Waiting goes
//! through the [`Sleeper`] trait so the schedule can be exercised without
//! real time.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff policy: `base * 2^retry`, capped at `max`, at most `max_retries` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max,
            max_retries,
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// All delays this policy will wait, in order
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|retry| self.delay_for(retry))
    }
}

impl Default for Backoff {
    /// 1s, 2s, 4s (3 retries), capped at 30s
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 3)
    }
}

/// Something that can wait.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays and returns immediately.
///
/// Handy for asserting a retry schedule in tests.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

/// Final error of [`retry_with_backoff`]
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// Retry an async operation following `backoff`.
///
/// The operation runs once, then up to `backoff.max_retries` more times with
/// `delay_for(0)`, `delay_for(1)`, ... in between.
pub async fn retry_with_backoff<F, Fut, T, E>(
    backoff: &Backoff,
    sleeper: &dyn Sleeper,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retry = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(retries = retry, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) if retry >= backoff.max_retries => {
                warn!(attempts = retry + 1, error = %e, "Operation failed, retry budget exhausted");
                return Err(RetryExhausted {
                    attempts: retry + 1,
                    last: e,
                });
            }
            Err(e) => {
                let delay = backoff.delay_for(retry);
                warn!(
                    attempt = retry + 1,
                    max_retries = backoff.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, backing off"
                );
                sleeper.sleep(delay).await;
                retry += 1;
            }
        }
    }
}
