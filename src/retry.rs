//! Startup retries for the resources the service cannot run without.

use anyhow::Result;
use rand::Rng;
use std::future::Future;
use tokio::time::{sleep, Duration};

use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomised in either direction.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: 0.3,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let doubled = self
            .base_delay
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        let capped = doubled.min(self.max_delay);
        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        capped.mul_f64(factor.max(0.0))
    }
}

/// Runs `operation` until it succeeds or the retries are spent, returning
/// the last error.
pub async fn retry_async<F, Fut, T>(config: &RetryConfig, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_retries.saturating_add(1);
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempt += 1;
        if attempt >= attempts {
            return Err(err.context(format!("{} failed after {} attempts", what, attempts)));
        }
        let delay = config.backoff(attempt - 1);
        log(
            Level::Warn,
            Domain::System,
            "startup_retry",
            obj(&[
                ("operation", v_str(what)),
                ("attempt", v_num(attempt as f64)),
                ("of", v_num(attempts as f64)),
                ("delay_ms", v_num(delay.as_millis() as f64)),
                ("error", v_str(&format!("{:#}", err))),
            ]),
        );
        sleep(delay).await;
    }
}
