//! Bounded retry with fixed or exponential delay.
//!
//! One policy type serves every call site: remote GETs (fixed delay, retry on
//! anything), outbound sends, and store writes (exponential delay, retry only
//! on transient database errors).

use std::{future::Future, time::Duration};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
  Fixed,
  Exponential { factor: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
  /// Total attempts including the first; never less than one.
  pub max_attempts: u32,
  pub delay:        Duration,
  pub backoff:      Backoff,
}

/// Why [`RetryPolicy::run`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
  #[error("gave up after {attempts} attempts: {source}")]
  Exhausted { attempts: u32, source: E },

  /// The predicate classified the error as not worth retrying.
  #[error("{0}")]
  Aborted(E),
}

impl<E> RetryError<E> {
  pub fn into_inner(self) -> E {
    match self {
      RetryError::Exhausted { source, .. } => source,
      RetryError::Aborted(e) => e,
    }
  }
}

impl Default for RetryPolicy {
  fn default() -> Self { Self::fixed(3, Duration::from_secs(3)) }
}

impl RetryPolicy {
  pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
    Self { max_attempts: max_attempts.max(1), delay, backoff: Backoff::Fixed }
  }

  pub fn exponential(max_attempts: u32, delay: Duration, factor: f64) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      delay,
      backoff: Backoff::Exponential { factor: factor.max(1.0) },
    }
  }

  /// A policy that tries exactly once.
  pub fn none() -> Self { Self::fixed(1, Duration::ZERO) }

  /// Sleep before attempt `attempt + 1`, where `attempt` is 1-based.
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    match self.backoff {
      Backoff::Fixed => self.delay,
      Backoff::Exponential { factor } => {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        self.delay.mul_f64(factor.powi(exp))
      }
    }
  }

  /// Run `op` until it succeeds, the predicate refuses a retry, or the
  /// attempt budget is spent.
  pub async fn run<T, E, F, Fut, P>(
    &self,
    label: &str,
    mut op: F,
    is_retryable: P,
  ) -> Result<T, RetryError<E>>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
  {
    let max = self.max_attempts.max(1);
    let mut attempt = 1;
    loop {
      match op().await {
        Ok(value) => {
          if attempt > 1 {
            debug!(label, attempt, "succeeded after retry");
          }
          return Ok(value);
        }
        Err(e) if !is_retryable(&e) => return Err(RetryError::Aborted(e)),
        Err(e) if attempt >= max => {
          return Err(RetryError::Exhausted { attempts: attempt, source: e });
        }
        Err(e) => {
          let delay = self.delay_for_attempt(attempt);
          warn!(label, attempt, max, ?delay, error = %e, "attempt failed, retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
      }
    }
  }
}
