//! Bounded retry with a fixed backoff.

use crate::domain::settings::RetrySettings;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `op` until it succeeds, a non-retryable error occurs, or the
    /// attempts are used up. Only the last error is returned.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, R>(&self, what: &str, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && retryable(&e) => {
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}",
                        what, attempt, attempts, e, self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(400));
        let start = tokio::time::Instant::now();

        let result: Result<u32, String> = policy
            .run(
                "connect",
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err(format!("attempt {attempt}"))
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(800) && elapsed < Duration::from_millis(810));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_last_error_when_exhausted() {
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        let result: Result<(), String> = policy
            .run(
                "discovery",
                |attempt| async move { Err(format!("failure {attempt}")) },
                |_| true,
            )
            .await;
        assert_eq!(result, Err("failure 3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        let result: Result<(), &str> = policy
            .run(
                "connect",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("cancelled") }
                },
                |e| *e != "cancelled",
            )
            .await;
        assert_eq!(result, Err("cancelled"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_runs_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::from_millis(10));
        let _: Result<(), &str> = policy
            .run(
                "connect",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("nope") }
                },
                |_| true,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
