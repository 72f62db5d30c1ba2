use crate::shutdown::sleep_or_cancel;
use crate::types::{ErrorKind, MirrorError, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Bounded retry schedule.
///
/// Transient failures wait on an exponential schedule capped at `max_delay`.
/// Rate-limit failures wait `rate_limit_step * attempt`, capped at
/// `rate_limit_max`. Every other error kind fails on the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub rate_limit_step: Duration,
    pub rate_limit_max: Duration,
}

impl RetryPolicy {
    fn exponential(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    fn rate_limit_delay(&self, attempt: u32) -> Duration {
        self.rate_limit_step
            .saturating_mul(attempt)
            .min(self.rate_limit_max)
    }

    /// Delays that would separate the attempts of an operation failing
    /// every time with `kind`. Empty for non-retryable kinds.
    pub fn schedule(&self, kind: ErrorKind) -> Vec<Duration> {
        let mut exponential = self.exponential();
        (1..self.max_attempts)
            .map_while(|attempt| match kind {
                ErrorKind::Transient => exponential.next_backoff(),
                ErrorKind::RateLimited => Some(self.rate_limit_delay(attempt)),
                _ => None,
            })
            .collect()
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is reached. The final error is returned exactly once.
    pub async fn run<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut exponential = self.exponential();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let delay = match err.kind() {
                ErrorKind::Transient => exponential.next_backoff(),
                ErrorKind::RateLimited => {
                    let scaled = self.rate_limit_delay(attempt);
                    // Honour a server-provided hint when it asks for longer
                    match &err {
                        MirrorError::RateLimited { retry_after: Some(hint) } => {
                            Some(scaled.max(*hint).min(self.rate_limit_max))
                        }
                        _ => Some(scaled),
                    }
                }
                _ => return Err(err),
            };

            if attempt >= self.max_attempts {
                error!("{} failed after {} attempts: {}", label, attempt, err);
                return Err(err);
            }

            let Some(delay) = delay else {
                return Err(err);
            };

            warn!(
                "{} failed (attempt {}/{}): {}; retrying in {:?}",
                label, attempt, self.max_attempts, err, delay
            );

            if !sleep_or_cancel(cancel, delay).await {
                return Err(MirrorError::Cancelled);
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        crate::config::RetrySettings::target().policy()
    }
}
