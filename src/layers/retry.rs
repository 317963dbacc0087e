use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Source of backoff sleeps; swapped out in tests.
#[async_trait]
pub trait Delay: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls allowed, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt `attempt + 1`, given `attempt` (1-based) just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    pub attempts: u32,
    pub last_error: String,
}

/// Run `op` until it succeeds or `max_attempts` calls have been made.
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    delay: &dyn Delay,
    label: &str,
    mut op: F,
) -> Result<(T, u32), Exhausted>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(e) if attempt >= max => {
                tracing::warn!("{}: giving up after {} attempts: {}", label, attempt, e);
                return Err(Exhausted {
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                let wait = policy.backoff(attempt);
                tracing::debug!("{}: attempt {} failed ({}), retrying in {:?}", label, attempt, e, wait);
                delay.sleep(wait).await;
                attempt += 1;
            }
        }
    }
}
