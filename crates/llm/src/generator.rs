use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::cache::PromptCache;
use crate::client::SamplingParams;
use crate::scheduler::BatchScheduler;

/// The single path every prompt takes: prompt cache, then the batch
/// scheduler (which passes straight through when batching is off).
pub struct Generator {
    scheduler: Arc<BatchScheduler>,
    cache: Option<Arc<PromptCache>>,
    params: SamplingParams,
    model_calls: AtomicU64,
}

impl Generator {
    pub fn new(
        scheduler: Arc<BatchScheduler>,
        cache: Option<Arc<PromptCache>>,
        params: SamplingParams,
    ) -> Self {
        Self {
            scheduler,
            cache,
            params,
            model_calls: AtomicU64::new(0),
        }
    }

    pub async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_with_history(prompt, &[]).await
    }

    pub async fn generate_with_history(&self, prompt: &str, history: &[String]) -> Result<String> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(prompt, history, &self.params) {
                debug!(prompt_len = prompt.len(), "Prompt cache hit");
                return Ok(hit);
            }
        }

        self.model_calls.fetch_add(1, Ordering::Relaxed);
        let response = self.scheduler.submit(prompt, history, &self.params).await?;

        if let Some(cache) = &self.cache {
            cache.set(prompt, response.clone(), history, &self.params);
        }
        Ok(response)
    }

    /// Wait until nothing submitted through this generator is still queued.
    pub async fn flush(&self) {
        self.scheduler.flush().await;
    }

    pub fn cache(&self) -> Option<&Arc<PromptCache>> {
        self.cache.as_ref()
    }

    pub fn scheduler(&self) -> &Arc<BatchScheduler> {
        &self.scheduler
    }

    /// Calls that missed the prompt cache and went to the scheduler.
    pub fn model_calls(&self) -> u64 {
        self.model_calls.load(Ordering::Relaxed)
    }
}
