//! Bounded exponential backoff with jitter.
//!
//! Shared by every component that talks to something flaky: the fetcher's
//! transport, conversion engines, OCR engines, and the orchestrator's
//! stage re-runs. The budget counts *attempts*, so a budget of 3 means one
//! initial try plus two retries.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub budget: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            budget: config.retry_budget.max(1),
            base: config.backoff_base(),
            max: config.backoff_max(),
        }
    }

    /// Delay before attempt `attempt + 1`, for `attempt >= 1`.
    ///
    /// The exponential ceiling is `base * 2^(attempt-1)` capped at `max`;
    /// the actual delay is drawn uniformly from the upper half of it.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling = self.base.saturating_mul(1u32 << exp).min(self.max);
        let half = ceiling / 2;
        let jitter_ms = half.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        half + jitter
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is
    /// spent. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.budget && retryable(&e) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        what,
                        attempt,
                        budget = self.budget,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
