use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::agent::AgentError;
use crate::config::env_or;

/// Bounded exponential backoff applied to rate-limited model calls only.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Added to a server-provided retry hint.
    pub hint_padding: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: env_or("CART_PILOT_MODEL_ATTEMPTS", 3),
            initial_backoff: Duration::from_millis(env_or("CART_PILOT_BACKOFF_MS", 5_000)),
            max_backoff: Duration::from_secs(60),
            hint_padding: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            hint_padding: Duration::ZERO,
        }
    }

    /// Backoff after the `attempt`-th failure (1-based): doubles each time, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(h) => (h + self.hint_padding).min(self.max_backoff),
            None => self.backoff_for(attempt),
        }
    }

    /// Runs `op` until it succeeds, fails with a non-rate-limit error, or attempts run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(AgentError::RateLimited { message, retry_after }) => {
                    if attempt >= attempts {
                        return Err(AgentError::RetriesExhausted { attempts, last: message });
                    }
                    let delay = self.delay_for(attempt, retry_after);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "model rate limited, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limited() -> AgentError {
        AgentError::RateLimited { message: "429".into(), retry_after: None }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            hint_padding: Duration::from_secs(1),
        };
        assert_eq!(p.backoff_for(1), Duration::from_secs(5));
        assert_eq!(p.backoff_for(2), Duration::from_secs(10));
        assert_eq!(p.backoff_for(3), Duration::from_secs(20));
        assert_eq!(p.backoff_for(5), Duration::from_secs(60));
        assert_eq!(p.backoff_for(40), Duration::from_secs(60));
        assert_eq!(p.delay_for(1, Some(Duration::from_secs(23))), Duration::from_secs(24));
        assert_eq!(p.delay_for(1, Some(Duration::from_secs(300))), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = RetryPolicy::immediate(3)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(limited())
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(out, Err(AgentError::RetriesExhausted { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = RetryPolicy::immediate(3)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::Model("invalid request".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(out, Err(AgentError::Model(_))));
    }

    #[tokio::test]
    async fn recovers_when_the_limit_lifts() {
        let calls = AtomicU32::new(0);
        let out = RetryPolicy::immediate(3)
            .run(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(limited())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
