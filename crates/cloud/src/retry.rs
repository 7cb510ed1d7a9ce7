use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::sync::Semaphore;

use crate::CloudError;

/// Decides whether a failed call is worth repeating.
pub type RetryPredicate = fn(&CloudError) -> bool;

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            factor: 4,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(multiplier)
    }
}

/// Wraps every remote call of one provider: at most `max_in_flight` calls run
/// at once, and failures the predicate accepts are retried with backoff. A
/// retried call gives up its slot while it waits.
#[derive(Clone)]
pub struct RemoteCaller {
    provider: &'static str,
    policy: RetryPolicy,
    limiter: Arc<Semaphore>,
    is_retriable: RetryPredicate,
}

impl RemoteCaller {
    pub fn new(provider: &'static str, max_in_flight: usize, is_retriable: RetryPredicate) -> Self {
        Self {
            provider,
            policy: RetryPolicy::default(),
            limiter: Arc::new(Semaphore::new(max_in_flight.max(1))),
            is_retriable,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation`, building a fresh request for every attempt.
    pub async fn call<T, F, Fut>(&self, mut operation: F) -> Result<T, CloudError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let mut attempt = 1;
        loop {
            let result = {
                let _permit = self
                    .limiter
                    .acquire()
                    .await
                    .map_err(|_| CloudError::InvalidResponse("rate limiter closed".into()))?;
                operation().await
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.policy.max_attempts && (self.is_retriable)(&e) => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        "{} call failed (attempt {attempt}/{}), retrying in {delay:?}: {e}",
                        self.provider, self.policy.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
