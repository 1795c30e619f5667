use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A unit of source text. Identity is `id`; extraction caching keys on `content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
}

impl Chunk {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_name: String,
    pub entity_type: String,
    pub description: String,
    /// Id of the chunk this record was extracted from.
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRecord {
    pub src_id: String,
    pub tgt_id: String,
    pub description: String,
    pub source_id: String,
}

impl RelationRecord {
    /// Endpoint pair in sorted order, identical for both directions.
    pub fn undirected_key(&self) -> EdgeKey {
        undirected(&self.src_id, &self.tgt_id)
    }
}

/// One parsed line of a model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionRecord {
    Entity(EntityRecord),
    Relation(RelationRecord),
}

pub type EdgeKey = (String, String);

pub fn undirected(a: &str, b: &str) -> EdgeKey {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Records of one chunk grouped by entity name and by directed endpoint pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionOutput {
    pub nodes: BTreeMap<String, Vec<EntityRecord>>,
    pub edges: BTreeMap<EdgeKey, Vec<RelationRecord>>,
}

impl ExtractionOutput {
    pub fn from_records(records: impl IntoIterator<Item = ExtractionRecord>) -> Self {
        let mut output = Self::default();
        for record in records {
            output.push(record);
        }
        output
    }

    pub fn push(&mut self, record: ExtractionRecord) {
        match record {
            ExtractionRecord::Entity(entity) => {
                self.nodes
                    .entry(entity.entity_name.clone())
                    .or_default()
                    .push(entity);
            }
            ExtractionRecord::Relation(relation) => {
                self.edges
                    .entry((relation.src_id.clone(), relation.tgt_id.clone()))
                    .or_default()
                    .push(relation);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn entity_count(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }

    pub fn relation_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    /// Reattribute every record to `chunk_id`.
    pub fn with_source(mut self, chunk_id: &str) -> Self {
        for entity in self.nodes.values_mut().flatten() {
            entity.source_id = chunk_id.to_string();
        }
        for relation in self.edges.values_mut().flatten() {
            relation.source_id = chunk_id.to_string();
        }
        self
    }

    pub(crate) fn to_cached(&self, chunk_id: &str) -> CachedExtraction {
        CachedExtraction {
            chunk_id: chunk_id.to_string(),
            entities: self.nodes.values().flatten().cloned().collect(),
            relations: self.edges.values().flatten().cloned().collect(),
        }
    }
}

/// Flat form stored in the prompt cache. Tuple-keyed maps have no JSON form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CachedExtraction {
    pub chunk_id: String,
    pub entities: Vec<EntityRecord>,
    pub relations: Vec<RelationRecord>,
}

impl CachedExtraction {
    pub fn into_output(self) -> ExtractionOutput {
        ExtractionOutput::from_records(
            self.entities
                .into_iter()
                .map(ExtractionRecord::Entity)
                .chain(self.relations.into_iter().map(ExtractionRecord::Relation)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, source: &str) -> ExtractionRecord {
        ExtractionRecord::Entity(EntityRecord {
            entity_name: name.into(),
            entity_type: "LOCATION".into(),
            description: format!("{name} desc"),
            source_id: source.into(),
        })
    }

    fn relation(src: &str, tgt: &str, source: &str) -> ExtractionRecord {
        ExtractionRecord::Relation(RelationRecord {
            src_id: src.into(),
            tgt_id: tgt.into(),
            description: "capital of".into(),
            source_id: source.into(),
        })
    }

    #[test]
    fn groups_by_name_and_pair() {
        let output = ExtractionOutput::from_records([
            entity("PARIS", "c1"),
            entity("PARIS", "c1"),
            entity("FRANCE", "c1"),
            relation("PARIS", "FRANCE", "c1"),
        ]);

        assert_eq!(output.nodes["PARIS"].len(), 2);
        assert_eq!(output.entity_count(), 3);
        assert_eq!(output.relation_count(), 1);
        assert!(output.edges.contains_key(&("PARIS".into(), "FRANCE".into())));
    }

    #[test]
    fn undirected_key_ignores_direction() {
        assert_eq!(undirected("PARIS", "FRANCE"), undirected("FRANCE", "PARIS"));
    }

    #[test]
    fn cached_form_restores_grouping() {
        let output = ExtractionOutput::from_records([
            entity("PARIS", "c1"),
            relation("PARIS", "FRANCE", "c1"),
        ]);

        let json = serde_json::to_string(&output.to_cached("c1")).unwrap();
        let restored: CachedExtraction = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.into_output(), output);
    }

    #[test]
    fn with_source_rewrites_provenance() {
        let output = ExtractionOutput::from_records([
            entity("PARIS", "c1"),
            relation("PARIS", "FRANCE", "c1"),
        ])
        .with_source("c2");

        assert!(output.nodes.values().flatten().all(|e| e.source_id == "c2"));
        assert!(output.edges.values().flatten().all(|r| r.source_id == "c2"));
    }
}
