//! Fixed-interval retry policy shared by the discovery and config polling loops.

use std::time::Duration;

use crate::error::{EntrypointError, EntrypointResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` polls until success or until the process is killed.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn forever(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
        }
    }

    /// Called after failed attempt number `attempt` (1-based). Sleeps for the
    /// interval, or fails once the attempt budget is spent.
    pub async fn backoff(&self, attempt: u32, what: &str) -> EntrypointResult<()> {
        if let Some(max) = self.max_attempts
            && attempt >= max
        {
            return Err(EntrypointError::RetriesExhausted {
                what: what.to_string(),
                attempts: attempt,
            });
        }
        tokio::time::sleep(self.interval).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn forever_always_sleeps() {
        let policy = RetryPolicy::forever(Duration::from_secs(3));
        let start = tokio::time::Instant::now();
        for attempt in 1..=100 {
            policy.backoff(attempt, "kafka").await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(300), "elapsed: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(301), "elapsed: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_gives_up_on_last_attempt() {
        let policy = RetryPolicy::bounded(Duration::from_secs(1), 3);
        policy.backoff(1, "kafka").await.unwrap();
        policy.backoff(2, "kafka").await.unwrap();
        let err = policy.backoff(3, "kafka").await.unwrap_err();
        assert!(matches!(
            err,
            EntrypointError::RetriesExhausted { attempts: 3, .. }
        ));
    }
}
