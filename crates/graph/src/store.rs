use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use extract::{EdgeKey, undirected};

/// Joins the parts of a merged description or provenance set.
pub const SEP: &str = "<SEP>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    pub entity_type: String,
    pub description: String,
    /// `SEP`-joined set of contributing chunk ids.
    pub source_id: String,
    /// Records per entity type, in the order each type first appeared.
    /// `entity_type` is the winner of this tally.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_votes: Vec<(String, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeData {
    pub description: String,
    pub source_id: String,
}

/// The five operations the merge engine needs from a graph backend.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<NodeData>>;

    async fn upsert_node(&self, name: &str, data: NodeData) -> Result<()>;

    async fn get_edge(&self, src: &str, tgt: &str) -> Result<Option<EdgeData>>;

    async fn upsert_edge(&self, src: &str, tgt: &str, data: EdgeData) -> Result<()>;

    async fn has_node(&self, name: &str) -> Result<bool>;
}

struct StoredEdge {
    src: String,
    tgt: String,
    data: EdgeData,
}

/// In-process graph. Edges are undirected: `get_edge(a, b)` and
/// `get_edge(b, a)` see the same edge, which keeps the direction it was
/// last written with.
#[derive(Default)]
pub struct MemoryGraphStore {
    nodes: RwLock<BTreeMap<String, NodeData>>,
    edges: RwLock<BTreeMap<EdgeKey, StoredEdge>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn edge_count(&self) -> usize {
        self.edges.read().await.len()
    }

    pub async fn snapshot(&self) -> GraphSnapshot {
        let nodes = self
            .nodes
            .read()
            .await
            .iter()
            .map(|(name, data)| NodeSnapshot {
                name: name.clone(),
                entity_type: data.entity_type.clone(),
                description: data.description.clone(),
                source_id: data.source_id.clone(),
            })
            .collect();

        let edges = self
            .edges
            .read()
            .await
            .values()
            .map(|edge| EdgeSnapshot {
                src: edge.src.clone(),
                tgt: edge.tgt.clone(),
                description: edge.data.description.clone(),
                source_id: edge.data.source_id.clone(),
            })
            .collect();

        GraphSnapshot { nodes, edges }
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn get_node(&self, name: &str) -> Result<Option<NodeData>> {
        Ok(self.nodes.read().await.get(name).cloned())
    }

    async fn upsert_node(&self, name: &str, data: NodeData) -> Result<()> {
        self.nodes.write().await.insert(name.to_string(), data);
        Ok(())
    }

    async fn get_edge(&self, src: &str, tgt: &str) -> Result<Option<EdgeData>> {
        Ok(self
            .edges
            .read()
            .await
            .get(&undirected(src, tgt))
            .map(|edge| edge.data.clone()))
    }

    async fn upsert_edge(&self, src: &str, tgt: &str, data: EdgeData) -> Result<()> {
        self.edges.write().await.insert(
            undirected(src, tgt),
            StoredEdge {
                src: src.to_string(),
                tgt: tgt.to_string(),
                data,
            },
        );
        Ok(())
    }

    async fn has_node(&self, name: &str) -> Result<bool> {
        Ok(self.nodes.read().await.contains_key(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub src: String,
    pub tgt: String,
    pub description: String,
    pub source_id: String,
}

/// Whole-graph dump, nodes sorted by name and edges by endpoint pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(entity_type: &str) -> NodeData {
        NodeData {
            entity_type: entity_type.into(),
            description: "desc".into(),
            source_id: "c1".into(),
            type_votes: vec![(entity_type.into(), 1)],
        }
    }

    #[tokio::test]
    async fn upsert_replaces_node() {
        let store = MemoryGraphStore::new();
        store.upsert_node("PARIS", node("UNKNOWN")).await.unwrap();
        store.upsert_node("PARIS", node("LOCATION")).await.unwrap();

        assert_eq!(store.node_count().await, 1);
        assert!(store.has_node("PARIS").await.unwrap());
        assert_eq!(
            store.get_node("PARIS").await.unwrap().unwrap().entity_type,
            "LOCATION"
        );
        assert!(store.get_node("LONDON").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn edges_are_found_from_either_end() {
        let store = MemoryGraphStore::new();
        let data = EdgeData {
            description: "capital of".into(),
            source_id: "c1".into(),
        };
        store.upsert_edge("FRANCE", "PARIS", data.clone()).await.unwrap();

        assert_eq!(store.get_edge("PARIS", "FRANCE").await.unwrap(), Some(data));
        assert_eq!(store.edge_count().await, 1);

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.edges[0].src, "FRANCE");
        assert_eq!(snapshot.edges[0].tgt, "PARIS");
    }

    #[tokio::test]
    async fn snapshot_serializes_to_json() {
        let store = MemoryGraphStore::new();
        store.upsert_node("PARIS", node("LOCATION")).await.unwrap();

        let json = serde_json::to_value(store.snapshot().await).unwrap();
        assert_eq!(json["nodes"][0]["name"], "PARIS");
        assert_eq!(json["edges"].as_array().map(Vec::len), Some(0));
    }

    #[test]
    fn node_without_votes_still_deserializes() {
        let node: NodeData = serde_json::from_value(serde_json::json!({
            "entity_type": "LOCATION",
            "description": "desc",
            "source_id": "c1",
        }))
        .unwrap();
        assert!(node.type_votes.is_empty());

        let json = serde_json::to_value(node).unwrap();
        assert!(json.get("type_votes").is_none());
    }
}
