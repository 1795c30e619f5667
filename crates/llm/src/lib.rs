//! Model-call plumbing for knowledge-graph extraction: the model client,
//! the prompt cache, the batch scheduler with its adaptive controller, and
//! the generator that chains them.

pub mod adaptive;
pub mod cache;
pub mod client;
pub mod generator;
pub mod retry;
pub mod scheduler;
pub mod tokenizer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use adaptive::{AdaptiveConfig, AdaptiveController, BatchSample};
pub use cache::{CacheConfig, CacheStats, PromptCache, content_key, hash_text};
pub use client::{ModelClient, ModelConfig, OllamaClient, SamplingParams};
pub use generator::Generator;
pub use retry::{CallError, RetryConfig, RetryPolicy};
pub use scheduler::{BatchScheduler, SchedulerConfig, SchedulerError, SchedulerStats};
pub use tokenizer::{TiktokenTokenizer, Tokenizer};
