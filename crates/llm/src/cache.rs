use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::client::SamplingParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    /// Entries older than this are treated as misses. `None` never expires.
    pub ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 10000,
            ttl_secs: None,
        }
    }
}

struct CacheEntry {
    value: String,
    inserted_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

impl CacheState {
    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

/// Content-addressed memo of generated text.
///
/// Eviction is FIFO by insertion order once `max_size` is reached.
/// Overwriting an existing key keeps its original position.
pub struct PromptCache {
    state: Mutex<CacheState>,
    max_size: usize,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Canonical key material. Fields are declared in sorted order so the
/// serialized form is stable.
#[derive(Serialize)]
struct KeyMaterial<'a> {
    history: &'a [String],
    max_tokens: u32,
    prompt: &'a str,
    temperature: f64,
    top_k: u32,
    top_p: f64,
}

impl PromptCache {
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_size,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size, config.ttl_secs.map(Duration::from_secs))
    }

    /// Hash of prompt, history and the output-affecting sampling parameters.
    pub fn prompt_key(prompt: &str, history: &[String], params: &SamplingParams) -> String {
        let material = KeyMaterial {
            history,
            max_tokens: params.max_tokens(),
            prompt,
            temperature: params.temperature(),
            top_k: params.top_k(),
            top_p: params.top_p(),
        };
        // Serializing plain strings and numbers cannot fail.
        let canonical = serde_json::to_string(&material).unwrap_or_default();
        hash_text(&canonical)
    }

    pub fn get(&self, prompt: &str, history: &[String], params: &SamplingParams) -> Option<String> {
        self.get_by_key(&Self::prompt_key(prompt, history, params))
    }

    pub fn set(&self, prompt: &str, value: String, history: &[String], params: &SamplingParams) {
        self.set_by_key(Self::prompt_key(prompt, history, params), value);
    }

    /// Look up a precomputed key. Expired entries are removed and reported as misses.
    pub fn get_by_key(&self, key: &str) -> Option<String> {
        let mut state = self.lock();

        let expired = match state.entries.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => self
                .ttl
                .is_some_and(|ttl| entry.inserted_at.elapsed() > ttl),
        };

        if expired {
            state.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn set_by_key(&self, key: String, value: String) {
        if self.max_size == 0 {
            return;
        }

        let mut state = self.lock();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.value = value;
            entry.inserted_at = Instant::now();
            return;
        }

        while state.entries.len() >= self.max_size {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }

        state.order.push_back(key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            max_size: self.max_size,
            ttl_secs: self.ttl.map(|ttl| ttl.as_secs()),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    // A panic while holding the lock leaves the map structurally intact,
    // so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Hex SHA-256 of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Key for content-derived cache entries: the hash of `prefix` followed by
/// `content`, e.g. `content_key("extract-", text)`.
pub fn content_key(prefix: &str, content: &str) -> String {
    hash_text(&format!("{prefix}{content}"))
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_secs: Option<u64>,
    pub hits: u64,
    pub misses: u64,
}
