//! Retry with exponential backoff for control-plane calls.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::error::Result;

/// Parameters for exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffParams {
    /// Delay before the first retry, in milliseconds
    pub initial_ms: u64,
    /// Multiplier applied after each retry
    pub mult: f64,
    /// Upper bound for a single delay, in milliseconds
    pub max_ms: u64,
    /// Total attempts, including the first one
    pub max_tries: u32,
}

impl Default for BackoffParams {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            mult: 2.0,
            max_ms: 8_000,
            max_tries: 4,
        }
    }
}

impl BackoffParams {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.mult.powi(retry.saturating_sub(1) as i32);
        let ms = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Run `f` until it succeeds, fails with a non-retriable error, or runs out of tries.
pub async fn retry_api<F, Fut, T>(mut f: F, params: &BackoffParams) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tries = 0u32;

    loop {
        match f().await {
            Ok(value) => {
                if tries > 0 {
                    debug!("Control plane call succeeded after {} retries", tries);
                }
                return Ok(value);
            }
            Err(e) => {
                tries += 1;
                if tries >= params.max_tries || !e.is_retriable() {
                    return Err(e);
                }

                let delay = params.delay_for(tries);
                debug!(
                    "Control plane call failed ({}), retrying in {:?} (attempt {}/{})",
                    e, delay, tries, params.max_tries
                );
                sleep(delay).await;
            }
        }
    }
}
