pub mod language;
pub mod merged;
pub mod parser;
pub mod prompt;
pub mod schema;

pub use language::{Language, detect_language};
pub use parser::{RecordError, parse_record, parse_response};
pub use schema::{
    Chunk, EdgeKey, EntityRecord, ExtractionOutput, ExtractionRecord, RelationRecord, undirected,
};

use anyhow::{Context, Result};
use dashmap::DashMap;
use llm::{Generator, PromptCache, content_key};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::schema::CachedExtraction;

const EXTRACT_PREFIX: &str = "extract-";

/// Turns chunks into grouped entity and relation records.
///
/// With a cache attached, results are memoised by chunk content and
/// concurrent extractions of the same content share one model call.
pub struct Extractor {
    generator: Arc<Generator>,
    cache: Option<Arc<PromptCache>>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl Extractor {
    pub fn new(generator: Arc<Generator>, cache: Option<Arc<PromptCache>>) -> Self {
        Self {
            generator,
            cache,
            in_flight: DashMap::new(),
        }
    }

    pub fn generator(&self) -> &Arc<Generator> {
        &self.generator
    }

    pub fn cache(&self) -> Option<&Arc<PromptCache>> {
        self.cache.as_ref()
    }

    /// Extract entities and relations from one chunk.
    ///
    /// A response that does not parse yields an empty output; only a failed
    /// model call is an error.
    pub async fn extract(&self, chunk: &Chunk) -> Result<ExtractionOutput> {
        let Some(cache) = &self.cache else {
            return self.extract_uncached(chunk).await;
        };

        let key = content_key(EXTRACT_PREFIX, &chunk.content);
        if let Some(hit) = self.lookup(cache, &key, &chunk.id) {
            return Ok(hit);
        }

        let gate = Arc::clone(self.in_flight.entry(key.clone()).or_default().value());
        let result = {
            let _guard = gate.lock().await;
            match self.lookup(cache, &key, &chunk.id) {
                Some(hit) => Ok(hit),
                None => {
                    let output = self.extract_uncached(chunk).await;
                    if let Ok(output) = &output {
                        self.store(cache, key.clone(), &output.to_cached(&chunk.id));
                    }
                    output
                }
            }
        };

        // Only the map and this task hold the gate: nobody is waiting on it.
        self.in_flight
            .remove_if(&key, |_, held| Arc::strong_count(held) <= 2);
        result
    }

    async fn extract_uncached(&self, chunk: &Chunk) -> Result<ExtractionOutput> {
        let language = detect_language(&chunk.content);
        let prompt = prompt::build_extraction_prompt(language, &chunk.content);

        let response = self
            .generator
            .generate(&prompt)
            .await
            .with_context(|| format!("Failed to extract chunk {}", chunk.id))?;

        let output = parse_response(&response, &chunk.id);
        debug!(
            chunk_id = %chunk.id,
            entities = output.entity_count(),
            relations = output.relation_count(),
            "Extracted chunk"
        );
        Ok(output)
    }

    /// A cached result reattributed to `chunk_id`. Unreadable entries count as misses.
    fn lookup(&self, cache: &PromptCache, key: &str, chunk_id: &str) -> Option<ExtractionOutput> {
        let raw = cache.get_by_key(key)?;
        match serde_json::from_str::<CachedExtraction>(&raw) {
            Ok(cached) => {
                debug!(chunk_id, "Extraction cache hit");
                Some(cached.into_output().with_source(chunk_id))
            }
            Err(e) => {
                debug!(chunk_id, error = %e, "Ignoring unreadable extraction cache entry");
                None
            }
        }
    }

    fn store<T: serde::Serialize>(&self, cache: &PromptCache, key: String, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => cache.set_by_key(key, json),
            Err(e) => debug!(error = %e, "Skipping extraction cache write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm::testing::ScriptedClient;
    use llm::{BatchScheduler, SamplingParams, SchedulerConfig};
    use std::time::Duration;

    const PARIS_RESPONSE: &str = concat!(
        r#"("entity"<|>Paris<|>LOCATION<|>Capital of France)##"#,
        r#"("entity"<|>France<|>COUNTRY<|>Country in Europe)##"#,
        r#"("relationship"<|>Paris<|>France<|>Paris is the capital of France<|>9)"#,
        "<|COMPLETE|>"
    );

    fn extractor(client: Arc<ScriptedClient>, cached: bool) -> Extractor {
        let scheduler = Arc::new(BatchScheduler::new(
            client,
            SchedulerConfig {
                enabled: false,
                ..Default::default()
            },
        ));
        let generator = Arc::new(Generator::new(scheduler, None, SamplingParams::default()));
        let cache = cached.then(|| Arc::new(PromptCache::new(100, None)));
        Extractor::new(generator, cache)
    }

    #[tokio::test]
    async fn second_extraction_hits_cache() {
        let client = Arc::new(ScriptedClient::new(|_| Ok(PARIS_RESPONSE.to_string())));
        let extractor = extractor(client.clone(), true);
        let chunk = Chunk::new("c1", "Paris is the capital of France.");

        let first = extractor.extract(&chunk).await.unwrap();
        let second = extractor.extract(&chunk).await.unwrap();

        assert_eq!(client.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(first.nodes.len(), 2);
    }

    #[tokio::test]
    async fn cache_hit_keeps_requesting_chunk_provenance() {
        let client = Arc::new(ScriptedClient::new(|_| Ok(PARIS_RESPONSE.to_string())));
        let extractor = extractor(client.clone(), true);

        extractor
            .extract(&Chunk::new("c1", "Paris is the capital of France."))
            .await
            .unwrap();
        let copy = extractor
            .extract(&Chunk::new("c2", "Paris is the capital of France."))
            .await
            .unwrap();

        assert_eq!(client.calls(), 1);
        assert!(copy.nodes["PARIS"].iter().all(|e| e.source_id == "c2"));
    }

    #[tokio::test]
    async fn concurrent_identical_chunks_share_one_call() {
        let client = Arc::new(
            ScriptedClient::new(|_| Ok(PARIS_RESPONSE.to_string()))
                .with_delay(Duration::from_millis(20)),
        );
        let extractor = Arc::new(extractor(client.clone(), true));

        let handles: Vec<_> = ["c1", "c2", "c3"]
            .into_iter()
            .map(|id| {
                let extractor = Arc::clone(&extractor);
                tokio::spawn(async move {
                    extractor
                        .extract(&Chunk::new(id, "Paris is the capital of France."))
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().nodes.len(), 2);
        }
        assert_eq!(client.calls(), 1);
        assert!(extractor.in_flight.is_empty());
    }

    #[tokio::test]
    async fn without_cache_every_call_goes_to_model() {
        let client = Arc::new(ScriptedClient::new(|_| Ok(PARIS_RESPONSE.to_string())));
        let extractor = extractor(client.clone(), false);
        let chunk = Chunk::new("c1", "Paris is the capital of France.");

        extractor.extract(&chunk).await.unwrap();
        extractor.extract(&chunk).await.unwrap();

        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn unparseable_response_is_empty_not_error() {
        let client = Arc::new(ScriptedClient::new(|_| Ok("no records here".to_string())));
        let extractor = extractor(client, true);

        let output = extractor.extract(&Chunk::new("c1", "text")).await.unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn model_failure_is_error_and_not_cached() {
        let client = Arc::new(ScriptedClient::new(|_| Err(anyhow::anyhow!("connection refused"))));
        let extractor = extractor(client.clone(), true);
        let chunk = Chunk::new("c1", "text");

        assert!(extractor.extract(&chunk).await.is_err());
        assert!(extractor.extract(&chunk).await.is_err());
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn chinese_text_uses_chinese_template() {
        let client = Arc::new(ScriptedClient::new(|_| Ok(String::new())));
        let extractor = extractor(client.clone(), false);

        extractor
            .extract(&Chunk::new("c1", "巴黎是法国的首都。"))
            .await
            .unwrap();

        assert!(client.prompts()[0].contains("从下面的文本中抽取实体和关系"));
    }
}
