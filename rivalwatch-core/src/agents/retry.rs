use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::RetrySection;

use super::{AgentError, Result};

/// Transient-error retry for agent network calls: a fixed delay plus random
/// jitter between attempts, never sleeping past the job deadline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
    jitter_ms: u64,
}

impl RetryPolicy {
    pub fn new(config: &RetrySection) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
            jitter_ms: config.jitter_ms,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            jitter_ms: 0,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn next_delay(&self) -> Duration {
        if self.jitter_ms == 0 {
            return self.delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
        self.delay + Duration::from_millis(jitter)
    }

    pub async fn run<F, Fut, T>(&self, label: &str, deadline: Instant, mut operation: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0usize;
        loop {
            if Instant::now() >= deadline {
                return Err(AgentError::Deadline);
            }
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.next_delay();
                    if Instant::now() + delay >= deadline {
                        debug!(label, attempt, "no time left for another attempt");
                        return Err(err);
                    }
                    debug!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient error"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::new(&RetrySection {
            max_attempts,
            delay_ms: 100,
            jitter_ms: 0,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicUsize::new(0);
        let value = policy(3)
            .run("test", Instant::now() + Duration::from_secs(10), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(AgentError::Transport("reset".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_stop_immediately() {
        let calls = AtomicUsize::new(0);
        let err = policy(5)
            .run("test", Instant::now() + Duration::from_secs(10), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AgentError::Quota("daily".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Quota(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = AtomicUsize::new(0);
        let err = policy(2)
            .run("test", Instant::now() + Duration::from_secs(10), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AgentError::Transport("reset".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cuts_retries_short() {
        let calls = AtomicUsize::new(0);
        let err = policy(10)
            .run("test", Instant::now() + Duration::from_millis(150), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AgentError::Transport("reset".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
