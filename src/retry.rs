use crate::transport::TransportError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per operation, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// No retries and no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

/// Runs register operations under a [`RetryPolicy`], counting the retries it
/// spends across calls.
#[derive(Debug)]
pub struct Retrier {
    policy: RetryPolicy,
    retries: u32,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Retry `operation` with exponential backoff until it succeeds or the
    /// attempt budget is spent; the last error is returned.
    pub async fn run<T, R, F>(
        &mut self,
        target: &mut T,
        what: &str,
        mut operation: F,
    ) -> Result<R, TransportError>
    where
        T: ?Sized + Send,
        R: Send,
        F: for<'a> FnMut(&'a mut T) -> BoxFuture<'a, Result<R, TransportError>>,
    {
        let mut attempts = 0;
        let mut backoff = self.policy.initial_backoff;

        loop {
            match operation(&mut *target).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.policy.max_attempts.max(1) {
                        tracing::error!(
                            operation = what,
                            attempts = attempts,
                            error = %e,
                            "Retries exhausted"
                        );
                        return Err(e);
                    }

                    tracing::warn!(
                        operation = what,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Register transfer failed, retrying"
                    );

                    self.retries += 1;
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.policy.max_backoff);
                }
            }
        }
    }
}
