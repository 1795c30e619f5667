//! Folding extracted records into the graph.
//!
//! Merges are order independent: the type is the mode of a vote tally kept
//! with the node, and descriptions and provenance are set unions. Read-modify-write cycles on
//! the same node or edge are serialised by a per-key lock; distinct keys
//! merge in parallel.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use extract::prompt::build_summary_prompt;
use extract::{EntityRecord, RelationRecord, detect_language};
use llm::{Generator, Tokenizer};

use crate::store::{EdgeData, GraphStore, NodeData, SEP};

/// Type given to nodes created only because an edge points at them.
pub const UNKNOWN_TYPE: &str = "UNKNOWN";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Merged descriptions longer than this are replaced by a model summary.
    pub max_summary_tokens: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_summary_tokens: 200,
        }
    }
}

pub struct MergeEngine {
    generator: Arc<Generator>,
    tokenizer: Arc<dyn Tokenizer>,
    config: MergeConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MergeEngine {
    pub fn new(generator: Arc<Generator>, tokenizer: Arc<dyn Tokenizer>, config: MergeConfig) -> Self {
        Self {
            generator,
            tokenizer,
            config,
            locks: DashMap::new(),
        }
    }

    async fn lock(&self, key: String) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(key).or_default().value());
        lock.lock_owned().await
    }

    /// Merge `records` into the node `name`, creating it if needed.
    pub async fn merge_node(
        &self,
        name: &str,
        records: &[EntityRecord],
        store: &dyn GraphStore,
    ) -> Result<NodeData> {
        let _guard = self.lock(node_lock_key(name)).await;

        let existing = store
            .get_node(name)
            .await
            .with_context(|| format!("Failed to read node {name}"))?;

        let type_votes = tally_types(
            existing.as_ref().map(prior_votes).unwrap_or_default(),
            records.iter().map(|r| r.entity_type.as_str()),
        );
        let entity_type = winning_type(&type_votes);
        let description = self
            .merge_descriptions(
                name,
                existing.as_ref().map(|n| n.description.as_str()),
                records.iter().map(|r| r.description.as_str()),
            )
            .await;
        let source_id = union_set(
            existing.as_ref().map(|n| n.source_id.as_str()),
            records.iter().map(|r| r.source_id.as_str()),
        );

        let node = NodeData {
            entity_type,
            description,
            source_id,
            type_votes,
        };
        store
            .upsert_node(name, node.clone())
            .await
            .with_context(|| format!("Failed to write node {name}"))?;

        debug!(name, records = records.len(), "Merged node");
        Ok(node)
    }

    /// Merge `records` into the edge `src`-`tgt`. Missing endpoints are
    /// created as `UNKNOWN` placeholders carrying the edge's description and
    /// provenance before the edge is written.
    pub async fn merge_edge(
        &self,
        (src, tgt): (&str, &str),
        records: &[RelationRecord],
        store: &dyn GraphStore,
    ) -> Result<EdgeData> {
        let _guard = self.lock(edge_lock_key(src, tgt)).await;

        let existing = store
            .get_edge(src, tgt)
            .await
            .with_context(|| format!("Failed to read edge {src} -> {tgt}"))?;

        let label = format!("({src}, {tgt})");
        let description = self
            .merge_descriptions(
                &label,
                existing.as_ref().map(|e| e.description.as_str()),
                records.iter().map(|r| r.description.as_str()),
            )
            .await;
        let source_id = union_set(
            existing.as_ref().map(|e| e.source_id.as_str()),
            records.iter().map(|r| r.source_id.as_str()),
        );

        for endpoint in [src, tgt] {
            let _node_guard = self.lock(node_lock_key(endpoint)).await;
            if !store.has_node(endpoint).await? {
                debug!(name = endpoint, "Creating placeholder node for edge endpoint");
                store
                    .upsert_node(
                        endpoint,
                        NodeData {
                            entity_type: UNKNOWN_TYPE.to_string(),
                            description: description.clone(),
                            source_id: source_id.clone(),
                            type_votes: Vec::new(),
                        },
                    )
                    .await
                    .with_context(|| format!("Failed to create placeholder node {endpoint}"))?;
            }
        }

        let edge = EdgeData {
            description,
            source_id,
        };
        store
            .upsert_edge(src, tgt, edge.clone())
            .await
            .with_context(|| format!("Failed to write edge {src} -> {tgt}"))?;

        debug!(src, tgt, records = records.len(), "Merged edge");
        Ok(edge)
    }

    async fn merge_descriptions<'a>(
        &self,
        label: &str,
        existing: Option<&'a str>,
        incoming: impl Iterator<Item = &'a str>,
    ) -> String {
        let joined = union_set(existing, incoming);
        if self.tokenizer.count_tokens(&joined) <= self.config.max_summary_tokens {
            return joined;
        }

        match self.summarize(label, &joined).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(name = label, error = %e, "Summary failed, keeping joined description");
                joined
            }
        }
    }

    async fn summarize(&self, label: &str, joined: &str) -> Result<String> {
        let truncated = self.truncate(joined);
        let parts: Vec<&str> = truncated
            .split(SEP)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        let prompt = build_summary_prompt(detect_language(joined), label, &parts);

        let summary = self.generator.generate(&prompt).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            anyhow::bail!("model returned an empty summary");
        }

        info!(name = label, parts = parts.len(), "Summarized description");
        Ok(summary.to_string())
    }

    /// First `max_summary_tokens` tokens of `text`. A cut inside a
    /// multi-byte character backs off a token at a time.
    fn truncate(&self, text: &str) -> String {
        let tokens = self.tokenizer.encode(text);
        let max = self.config.max_summary_tokens.min(tokens.len());
        for cut in (max.saturating_sub(3)..=max).rev() {
            if let Ok(prefix) = self.tokenizer.decode(&tokens[..cut]) {
                return prefix;
            }
        }
        text.to_string()
    }
}

fn node_lock_key(name: &str) -> String {
    format!("node:{name}")
}

fn edge_lock_key(src: &str, tgt: &str) -> String {
    let (a, b) = extract::undirected(src, tgt);
    format!("edge:{a}\u{0}{b}")
}

/// Votes already cast for a stored node. Nodes written without a tally
/// count their type once; placeholders count nothing.
fn prior_votes(node: &NodeData) -> Vec<(String, usize)> {
    if !node.type_votes.is_empty() {
        return node.type_votes.clone();
    }
    if node.entity_type.is_empty() || node.entity_type == UNKNOWN_TYPE {
        return Vec::new();
    }
    vec![(node.entity_type.clone(), 1)]
}

/// Add one vote per incoming type, keeping first-seen order. Empty types do
/// not vote.
fn tally_types<'a>(
    mut votes: Vec<(String, usize)>,
    types: impl Iterator<Item = &'a str>,
) -> Vec<(String, usize)> {
    for t in types.filter(|t| !t.is_empty()) {
        match votes.iter_mut().find(|(seen, _)| seen == t) {
            Some((_, count)) => *count += 1,
            None => votes.push((t.to_string(), 1)),
        }
    }
    votes
}

/// Most voted type. Ties go to the type seen first.
fn winning_type(votes: &[(String, usize)]) -> String {
    let mut best: Option<&(String, usize)> = None;
    for vote in votes {
        if best.is_none_or(|(_, count)| vote.1 > *count) {
            best = Some(vote);
        }
    }
    best.map(|(t, _)| t.clone())
        .unwrap_or_else(|| UNKNOWN_TYPE.to_string())
}

/// Sorted, deduplicated union of `SEP`-joined sets.
fn union_set<'a>(existing: Option<&'a str>, incoming: impl Iterator<Item = &'a str>) -> String {
    existing
        .into_iter()
        .chain(incoming)
        .flat_map(|s| s.split(SEP))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(SEP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGraphStore;
    use llm::testing::ScriptedClient;
    use llm::{BatchScheduler, SamplingParams, SchedulerConfig};

    /// One token per character.
    struct CharTokenizer;

    impl Tokenizer for CharTokenizer {
        fn encode(&self, text: &str) -> Vec<u32> {
            text.chars().map(u32::from).collect()
        }

        fn decode(&self, tokens: &[u32]) -> Result<String> {
            tokens
                .iter()
                .map(|t| char::from_u32(*t).context("invalid char"))
                .collect()
        }
    }

    fn engine(client: Arc<ScriptedClient>, max_summary_tokens: usize) -> MergeEngine {
        let scheduler = Arc::new(BatchScheduler::new(
            client,
            SchedulerConfig {
                enabled: false,
                ..Default::default()
            },
        ));
        let generator = Arc::new(Generator::new(scheduler, None, SamplingParams::default()));
        MergeEngine::new(
            generator,
            Arc::new(CharTokenizer),
            MergeConfig { max_summary_tokens },
        )
    }

    fn entity(entity_type: &str, description: &str, source: &str) -> EntityRecord {
        EntityRecord {
            entity_name: "PARIS".into(),
            entity_type: entity_type.into(),
            description: description.into(),
            source_id: source.into(),
        }
    }

    fn relation(src: &str, tgt: &str, source: &str) -> RelationRecord {
        RelationRecord {
            src_id: src.into(),
            tgt_id: tgt.into(),
            description: "capital of".into(),
            source_id: source.into(),
        }
    }

    #[tokio::test]
    async fn node_merge_votes_type_and_unions_sets() {
        let engine = engine(Arc::new(ScriptedClient::echo()), 200);
        let store = MemoryGraphStore::new();

        engine
            .merge_node("PARIS", &[entity("LOCATION", "A city", "c1")], &store)
            .await
            .unwrap();
        let node = engine
            .merge_node(
                "PARIS",
                &[
                    entity("CITY", "A capital", "c2"),
                    entity("LOCATION", "A city", "c2"),
                ],
                &store,
            )
            .await
            .unwrap();

        assert_eq!(node.entity_type, "LOCATION");
        assert_eq!(node.description, "A capital<SEP>A city");
        assert_eq!(node.source_id, "c1<SEP>c2");
        assert_eq!(store.get_node("PARIS").await.unwrap(), Some(node));
    }

    #[tokio::test]
    async fn node_merge_is_order_independent() {
        let a = entity("LOCATION", "Capital of France", "c1");
        let b = entity("CITY", "Largest French city", "c2");
        let c = entity("LOCATION", "On the Seine", "c3");

        let forward = MemoryGraphStore::new();
        let engine_f = engine(Arc::new(ScriptedClient::echo()), 200);
        engine_f.merge_node("PARIS", &[a.clone()], &forward).await.unwrap();
        engine_f.merge_node("PARIS", &[b.clone(), c.clone()], &forward).await.unwrap();

        let backward = MemoryGraphStore::new();
        let engine_b = engine(Arc::new(ScriptedClient::echo()), 200);
        engine_b.merge_node("PARIS", &[c], &backward).await.unwrap();
        engine_b.merge_node("PARIS", &[b], &backward).await.unwrap();
        engine_b.merge_node("PARIS", &[a], &backward).await.unwrap();

        assert_eq!(
            forward.get_node("PARIS").await.unwrap(),
            backward.get_node("PARIS").await.unwrap()
        );
    }

    #[tokio::test]
    async fn edge_merge_creates_missing_endpoints() {
        let engine = engine(Arc::new(ScriptedClient::echo()), 200);
        let store = MemoryGraphStore::new();

        engine
            .merge_edge(("FRANCE", "PARIS"), &[relation("PARIS", "FRANCE", "c1")], &store)
            .await
            .unwrap();
        assert_eq!(store.node_count().await, 2);
        let placeholder = store.get_node("PARIS").await.unwrap().unwrap();
        assert_eq!(placeholder.entity_type, UNKNOWN_TYPE);
        assert_eq!(placeholder.description, "capital of");
        assert_eq!(placeholder.source_id, "c1");

        engine
            .merge_edge(("FRANCE", "LYON"), &[relation("LYON", "FRANCE", "c2")], &store)
            .await
            .unwrap();
        assert_eq!(store.node_count().await, 3);
        assert_eq!(store.edge_count().await, 2);
    }

    #[tokio::test]
    async fn placeholder_is_upgraded_by_real_entity() {
        let engine = engine(Arc::new(ScriptedClient::echo()), 200);
        let store = MemoryGraphStore::new();

        engine
            .merge_edge(("FRANCE", "PARIS"), &[relation("PARIS", "FRANCE", "c1")], &store)
            .await
            .unwrap();
        let node = engine
            .merge_node("PARIS", &[entity("LOCATION", "A city", "c1")], &store)
            .await
            .unwrap();

        assert_eq!(node.entity_type, "LOCATION");
    }

    #[tokio::test]
    async fn edge_provenance_is_a_set() {
        let engine = engine(Arc::new(ScriptedClient::echo()), 200);
        let store = MemoryGraphStore::new();

        engine
            .merge_edge(
                ("FRANCE", "PARIS"),
                &[relation("PARIS", "FRANCE", "c2"), relation("PARIS", "FRANCE", "c1")],
                &store,
            )
            .await
            .unwrap();
        let edge = engine
            .merge_edge(("FRANCE", "PARIS"), &[relation("FRANCE", "PARIS", "c1")], &store)
            .await
            .unwrap();

        assert_eq!(edge.source_id, "c1<SEP>c2");
        assert_eq!(edge.description, "capital of");
    }

    #[tokio::test]
    async fn long_description_is_summarized() {
        let client = Arc::new(ScriptedClient::new(|_| Ok("Paris, the French capital.".into())));
        let engine = engine(client.clone(), 26);
        let store = MemoryGraphStore::new();

        let node = engine
            .merge_node(
                "PARIS",
                &[
                    entity("LOCATION", "Paris is the capital of France", "c1"),
                    entity("LOCATION", "Paris lies on the river Seine", "c2"),
                ],
                &store,
            )
            .await
            .unwrap();

        assert_eq!(node.description, "Paris, the French capital.");
        assert_eq!(client.calls(), 1);
        let prompt = &client.prompts()[0];
        assert!(prompt.contains("- Paris is the capital of Fr\n"));
        assert!(!prompt.contains("Seine"));
    }

    #[tokio::test]
    async fn failed_summary_keeps_joined_text() {
        let client = Arc::new(ScriptedClient::new(|_| Err(anyhow::anyhow!("model down"))));
        let engine = engine(client, 10);
        let store = MemoryGraphStore::new();

        let node = engine
            .merge_node(
                "PARIS",
                &[
                    entity("LOCATION", "Capital of France", "c1"),
                    entity("LOCATION", "City on the Seine", "c2"),
                ],
                &store,
            )
            .await
            .unwrap();

        assert_eq!(node.description, "Capital of France<SEP>City on the Seine");
    }

    #[tokio::test]
    async fn concurrent_merges_on_one_key_lose_nothing() {
        let engine = Arc::new(engine(Arc::new(ScriptedClient::echo()), 10_000));
        let store = Arc::new(MemoryGraphStore::new());

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let engine = Arc::clone(&engine);
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let record = entity("LOCATION", &format!("fact {i}"), &format!("c{i}"));
                    engine.merge_node("PARIS", &[record], store.as_ref()).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let node = store.get_node("PARIS").await.unwrap().unwrap();
        assert_eq!(node.source_id.split(SEP).count(), 10);
        assert_eq!(node.description.split(SEP).count(), 10);
    }

    #[tokio::test]
    async fn type_history_survives_one_record_merges() {
        let l1 = entity("LOCATION", "Capital of France", "c1");
        let l2 = entity("LOCATION", "Capital of France", "c2");
        let c3 = entity("CITY", "Capital of France", "c3");

        let mut winners = Vec::new();
        for order in [[&l1, &l2, &c3], [&c3, &l1, &l2]] {
            let engine = engine(Arc::new(ScriptedClient::echo()), 200);
            let store = MemoryGraphStore::new();
            for record in order {
                engine
                    .merge_node("PARIS", std::slice::from_ref(record), &store)
                    .await
                    .unwrap();
            }
            let node = store.get_node("PARIS").await.unwrap().unwrap();
            assert_eq!(node.source_id, "c1<SEP>c2<SEP>c3");
            winners.push(node.entity_type);
        }

        assert_eq!(winners, ["LOCATION", "LOCATION"]);
    }

    #[test]
    fn vote_prefers_majority_then_first_seen() {
        let tally = |types: &[&str]| tally_types(Vec::new(), types.iter().copied());

        assert_eq!(winning_type(&tally(&["PERSON", "LOCATION", "LOCATION"])), "LOCATION");
        assert_eq!(winning_type(&tally(&["PERSON", "LOCATION"])), "PERSON");
        assert_eq!(winning_type(&tally(&["", "CITY"])), "CITY");
        assert_eq!(winning_type(&[]), UNKNOWN_TYPE);

        let resumed = tally_types(vec![("CITY".into(), 2)], ["LOCATION"].into_iter());
        assert_eq!(resumed, [("CITY".to_string(), 2), ("LOCATION".to_string(), 1)]);
        assert_eq!(winning_type(&resumed), "CITY");
    }

    #[test]
    fn placeholders_cast_no_votes() {
        let placeholder = NodeData {
            entity_type: UNKNOWN_TYPE.into(),
            description: "capital of".into(),
            source_id: "c1".into(),
            type_votes: Vec::new(),
        };
        assert!(prior_votes(&placeholder).is_empty());

        let untallied = NodeData {
            entity_type: "CITY".into(),
            ..placeholder
        };
        assert_eq!(prior_votes(&untallied), [("CITY".to_string(), 1)]);
    }
}
