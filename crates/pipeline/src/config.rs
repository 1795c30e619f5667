use anyhow::{Context, Result};
use graph::MergeConfig;
use llm::{AdaptiveConfig, CacheConfig, ModelConfig, RetryConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub mode: OperationMode,
    pub model: ModelConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub merge: MergeConfig,
    pub concurrency: ConcurrencyConfig,
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Fast,     // Big batches, adaptive sizing, cache everything
    Accurate, // One prompt per chunk, no cache, patient retries
    #[default]
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_extractions: usize,
    pub max_concurrent_merges: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_extractions: 16,
            max_concurrent_merges: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Chunks packed into one extraction prompt. `1` disables packing.
    pub prompt_merge_size: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            prompt_merge_size: 1,
        }
    }
}

impl BuildConfig {
    pub fn for_mode(mode: OperationMode) -> Self {
        match mode {
            OperationMode::Fast => Self::fast_mode(),
            OperationMode::Accurate => Self::accurate_mode(),
            OperationMode::Balanced => Self::default(),
        }
    }

    pub fn fast_mode() -> Self {
        Self {
            mode: OperationMode::Fast,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 500,
                max_backoff_ms: 5000,
            },
            cache: CacheConfig {
                enabled: true,
                max_size: 50000,
                ttl_secs: None,
            },
            scheduler: SchedulerConfig {
                batch_size: 20,
                max_wait_ms: 200,
                adaptive: AdaptiveConfig {
                    enabled: true,
                    ..AdaptiveConfig::default()
                },
                ..SchedulerConfig::default()
            },
            concurrency: ConcurrencyConfig {
                max_concurrent_extractions: 32,
                max_concurrent_merges: 64,
            },
            extraction: ExtractionConfig {
                prompt_merge_size: 4,
            },
            ..Self::default()
        }
    }

    pub fn accurate_mode() -> Self {
        Self {
            mode: OperationMode::Accurate,
            retry: RetryConfig {
                max_retries: 5,
                initial_backoff_ms: 2000,
                max_backoff_ms: 20000,
            },
            cache: CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
            scheduler: SchedulerConfig {
                enabled: false,
                ..SchedulerConfig::default()
            },
            concurrency: ConcurrencyConfig {
                max_concurrent_extractions: 4,
                max_concurrent_merges: 8,
            },
            ..Self::default()
        }
    }

    /// Read a JSON config. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}
