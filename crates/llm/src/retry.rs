//! Retries inside model clients.
//!
//! The scheduler and the extraction layers above it never retry, so a
//! client that wants resilience wraps its single call in a [`RetryPolicy`].
//! Each attempt says whether its failure is worth repeating; a rejected
//! request or an unreadable answer is returned at once.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10000,
        }
    }
}

/// Failure of one attempt at a model call.
#[derive(Debug, Error)]
pub enum CallError {
    /// Dropped connections, timeouts, throttling and server errors.
    #[error("{0:#}")]
    Transient(anyhow::Error),

    /// The backend rejected the request or answered with something we cannot read.
    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

impl CallError {
    pub fn into_inner(self) -> anyhow::Error {
        match self {
            Self::Transient(e) | Self::Fatal(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config.initial_backoff_ms,
            config.max_backoff_ms,
        )
    }

    /// Wait before retry number `retry`, counting from zero.
    fn backoff(&self, retry: usize) -> Duration {
        let factor = u32::try_from(retry)
            .ok()
            .and_then(|r| 1u32.checked_shl(r))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `call` until it succeeds, fails fatally, or has used up its
    /// retries. `call_name` labels the log lines and the returned error.
    pub async fn run<T, F, Fut>(&self, call_name: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut retries = 0;
        loop {
            let error = match call().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!(call = call_name, retries, "Model call recovered");
                    }
                    return Ok(value);
                }
                Err(CallError::Transient(e)) => e,
                Err(fatal @ CallError::Fatal(_)) => {
                    return Err(fatal.into_inner().context(format!("{call_name} rejected")));
                }
            };

            if retries >= self.max_retries {
                warn!(call = call_name, retries, error = %format!("{error:#}"), "Giving up on model call");
                return Err(error.context(format!("{call_name} failed after {retries} retries")));
            }

            let wait = self.backoff(retries);
            retries += 1;
            warn!(
                call = call_name,
                retry = retries,
                max_retries = self.max_retries,
                wait_ms = wait.as_millis() as u64,
                error = %format!("{error:#}"),
                "Transient model call failure"
            );
            sleep(wait).await;
        }
    }
}
