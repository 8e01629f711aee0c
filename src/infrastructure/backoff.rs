//! Exponential backoff for backend reconnects and job re-submission.
//!
//! This is unrelated to the delivery retry schedule, which is a fixed table
//! (see `delivery::retry_policy`).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Delay sequence `initial * multiplier^n`, capped at `max_delay_ms`, with
/// optional jitter.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(63) as i32;
        self.attempt += 1;

        let base = (self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent))
            .min(self.config.max_delay_ms as f64);

        let spread = base * self.config.jitter_factor.clamp(0.0, 1.0);
        let jittered = if spread > 0.0 {
            base + rand::rng().random_range(-spread..=spread)
        } else {
            base
        };

        Duration::from_millis(jittered.max(1.0) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `operation` up to `max_tries` times, sleeping with exponential backoff
/// between failures. Returns the last error if every try fails.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: BackoffConfig,
    max_tries: u32,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = ExponentialBackoff::with_config(config);
    let max_tries = max_tries.max(1);

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if backoff.attempt() + 1 >= max_tries => return Err(e),
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    error = %e,
                    try_number = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 10000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_backoff_increases() {
        let mut backoff = ExponentialBackoff::with_config(no_jitter());

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            multiplier: 10.0,
            jitter_factor: 0.0,
        });

        let delays: Vec<u64> = (0..4).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 5000, 5000, 5000]);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig {
            jitter_factor: 0.5,
            ..no_jitter()
        });
        for _ in 0..20 {
            backoff.reset();
            let ms = backoff.next_delay().as_millis();
            assert!((50..=150).contains(&ms), "{ms}ms outside jitter range");
        }
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::with_config(no_jitter());

        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_retry_with_backoff_succeeds_after_failures() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = retry_with_backoff(no_jitter(), 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("failure {}", n))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_returns_last_error() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = retry_with_backoff(no_jitter(), 2, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("failure {}", n)) }
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
