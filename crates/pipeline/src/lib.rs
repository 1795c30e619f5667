//! End-to-end knowledge-graph construction: extract every chunk, then fold
//! the grouped records into a graph store.

pub mod config;
pub mod metrics;

pub use config::{BuildConfig, ConcurrencyConfig, ExtractionConfig, OperationMode};
pub use metrics::{BuildMetrics, MetricsSnapshot, TimedOperation};

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use extract::{Chunk, EdgeKey, EntityRecord, ExtractionOutput, Extractor, RelationRecord};
use graph::{GraphStore, MergeEngine};
use llm::{
    BatchScheduler, CacheStats, Generator, ModelClient, OllamaClient, PromptCache, SchedulerStats,
    TiktokenTokenizer, Tokenizer,
};

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub chunks: usize,
    pub nodes: usize,
    pub edges: usize,
    pub model_calls: u64,
    pub elapsed_ms: f64,
    pub metrics: MetricsSnapshot,
    pub cache: Option<CacheStats>,
    pub scheduler: SchedulerStats,
}

enum ExtractOutcome {
    Done {
        chunks: usize,
        outputs: Vec<ExtractionOutput>,
    },
    Failed {
        chunks: usize,
    },
}

/// Records of a whole run, grouped by node name and by undirected edge.
#[derive(Default)]
struct Grouped {
    nodes: BTreeMap<String, Vec<EntityRecord>>,
    edges: BTreeMap<EdgeKey, Vec<RelationRecord>>,
}

impl Grouped {
    fn absorb(&mut self, output: ExtractionOutput) {
        for (name, records) in output.nodes {
            self.nodes.entry(name).or_default().extend(records);
        }
        for records in output.edges.into_values() {
            for record in records {
                self.edges
                    .entry(record.undirected_key())
                    .or_default()
                    .push(record);
            }
        }
    }
}

pub struct KgBuilder {
    generator: Arc<Generator>,
    extractor: Arc<Extractor>,
    merger: Arc<MergeEngine>,
    config: BuildConfig,
}

impl KgBuilder {
    /// Wire the cache, scheduler, extractor and merge engine around
    /// `client`. Spawns the scheduler task, so call it inside a runtime.
    pub fn new(client: Arc<dyn ModelClient>, tokenizer: Arc<dyn Tokenizer>, config: BuildConfig) -> Self {
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(PromptCache::from_config(&config.cache)));
        let scheduler = Arc::new(BatchScheduler::new(client, config.scheduler.clone()));
        let generator = Arc::new(Generator::new(
            scheduler,
            cache.clone(),
            config.model.sampling.clone(),
        ));
        let extractor = Arc::new(Extractor::new(Arc::clone(&generator), cache));
        let merger = Arc::new(MergeEngine::new(
            Arc::clone(&generator),
            tokenizer,
            config.merge.clone(),
        ));

        Self {
            generator,
            extractor,
            merger,
            config,
        }
    }

    /// Builder backed by Ollama and the cl100k tokenizer.
    pub fn from_config(config: BuildConfig) -> Result<Self> {
        let client = Arc::new(OllamaClient::new(&config.model, &config.retry)?);
        let tokenizer = Arc::new(TiktokenTokenizer::cl100k()?);
        Ok(Self::new(client, tokenizer, config))
    }

    pub fn generator(&self) -> &Arc<Generator> {
        &self.generator
    }

    pub async fn build(&self, chunks: Vec<Chunk>, store: Arc<dyn GraphStore>) -> Result<BuildReport> {
        let run = TimedOperation::start();
        let metrics = Arc::new(BuildMetrics::new());
        let total = chunks.len();
        let calls_before = self.generator.model_calls();

        info!(chunks = total, mode = ?self.config.mode, "Starting knowledge graph build");

        let stage = TimedOperation::start();
        let grouped = self.extract_all(chunks, &metrics).await;
        self.generator.flush().await;
        metrics.record_extract_time(stage.elapsed());
        info!(
            nodes = grouped.nodes.len(),
            edges = grouped.edges.len(),
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "Extraction finished"
        );

        let stage = TimedOperation::start();
        let (nodes, edges) = self.merge_all(grouped, &store, &metrics).await;
        self.generator.flush().await;
        metrics.record_merge_time(stage.elapsed());
        info!(
            nodes,
            edges,
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "Merge finished"
        );

        Ok(BuildReport {
            chunks: total,
            nodes,
            edges,
            model_calls: self.generator.model_calls() - calls_before,
            elapsed_ms: run.elapsed().as_secs_f64() * 1000.0,
            metrics: metrics.snapshot(),
            cache: self.generator.cache().map(|c| c.stats()),
            scheduler: self.generator.scheduler().stats(),
        })
    }

    async fn extract_all(&self, chunks: Vec<Chunk>, metrics: &Arc<BuildMetrics>) -> Grouped {
        let group_size = self.config.extraction.prompt_merge_size.max(1);
        let permits = Arc::new(Semaphore::new(
            self.config.concurrency.max_concurrent_extractions.max(1),
        ));
        let mut tasks = JoinSet::new();

        for group in chunks.chunks(group_size) {
            let group = group.to_vec();
            let extractor = Arc::clone(&self.extractor);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let chunks = group.len();
                let Ok(_permit) = permits.acquire_owned().await else {
                    return ExtractOutcome::Failed { chunks };
                };
                let result = match group.as_slice() {
                    [chunk] => extractor.extract(chunk).await.map(|o| vec![o]),
                    _ => extractor.extract_merged(&group).await,
                };
                match result {
                    Ok(outputs) => ExtractOutcome::Done { chunks, outputs },
                    Err(e) => {
                        let ids: Vec<&str> = group.iter().map(|c| c.id.as_str()).collect();
                        warn!(chunk_ids = ?ids, error = %format!("{e:#}"), "Skipping chunks that failed extraction");
                        ExtractOutcome::Failed { chunks }
                    }
                }
            });
        }

        let mut grouped = Grouped::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ExtractOutcome::Done { chunks, outputs }) => {
                    let entities = outputs.iter().map(ExtractionOutput::entity_count).sum();
                    let relations = outputs.iter().map(ExtractionOutput::relation_count).sum();
                    metrics.record_extraction(chunks, entities, relations);
                    for output in outputs {
                        grouped.absorb(output);
                    }
                }
                Ok(ExtractOutcome::Failed { chunks }) => metrics.record_failed_chunks(chunks),
                Err(e) => warn!(error = %e, "Extraction task panicked"),
            }
        }
        grouped
    }

    /// All nodes first, then all edges, so edges find their real endpoints
    /// and only fall back to placeholders for names no chunk described.
    async fn merge_all(
        &self,
        grouped: Grouped,
        store: &Arc<dyn GraphStore>,
        metrics: &Arc<BuildMetrics>,
    ) -> (usize, usize) {
        let permits = Arc::new(Semaphore::new(
            self.config.concurrency.max_concurrent_merges.max(1),
        ));

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for (name, records) in grouped.nodes {
            let merger = Arc::clone(&self.merger);
            let store = Arc::clone(store);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await?;
                merger
                    .merge_node(&name, &records, store.as_ref())
                    .await
                    .map(|_| ())
                    .map_err(|e| e.context(format!("node {name}")))
            });
        }
        let nodes = drain_merges(&mut tasks, false, metrics).await;

        for ((src, tgt), records) in grouped.edges {
            let merger = Arc::clone(&self.merger);
            let store = Arc::clone(store);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await?;
                merger
                    .merge_edge((src.as_str(), tgt.as_str()), &records, store.as_ref())
                    .await
                    .map(|_| ())
                    .map_err(|e| e.context(format!("edge {src} -> {tgt}")))
            });
        }
        let edges = drain_merges(&mut tasks, true, metrics).await;

        (nodes, edges)
    }
}

async fn drain_merges(
    tasks: &mut JoinSet<Result<()>>,
    is_edge: bool,
    metrics: &BuildMetrics,
) -> usize {
    let mut merged = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {
                merged += 1;
                metrics.record_merge(is_edge, true);
            }
            Ok(Err(e)) => {
                metrics.record_merge(is_edge, false);
                warn!(error = %format!("{e:#}"), "Merge failed");
            }
            Err(e) => {
                metrics.record_merge(is_edge, false);
                warn!(error = %e, "Merge task panicked");
            }
        }
    }
    merged
}
