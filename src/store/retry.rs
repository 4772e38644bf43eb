//! Retry with exponential backoff and jitter.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Retry policy for connecting to the shared store
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries forever
    pub max_retries: Option<usize>,
    /// Fraction of each delay added as random jitter (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Bounded retry used at startup, gives up after a few seconds so a
    /// missing store never holds up the shard.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_retries: Some(5),
            jitter: 0.2,
        }
    }

    /// Unbounded retry used by the reconnect probe once the store dropped.
    #[must_use]
    pub fn reconnect() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            max_retries: None,
            jitter: 0.2,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_retries: Some(3),
            jitter: 0.0,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter.min(1.0));
        delay.mul_f64(1.0 + extra)
    }
}

/// Run `operation` until it succeeds or the policy runs out of attempts.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempts > 0 {
                    info!("Operation '{operation_name}' succeeded after {attempts} retries");
                }
                return Ok(value);
            }
            Err(err) => {
                attempts += 1;
                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                    warn!(
                        "Operation '{operation_name}' failed (attempt {attempts}/{max}): {err}. Retrying in {delay:?}"
                    );
                } else {
                    warn!(
                        "Operation '{operation_name}' failed (attempt {attempts}, retrying until it succeeds): {err}. Next retry in {delay:?}"
                    );
                }

                sleep(config.jittered(delay)).await;
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}
