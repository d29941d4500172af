use std::sync::Arc;

use common::{
    error::AppError,
    storage::vector::{
        PayloadFilter, VectorHit, VectorStore, KG_EDGES_COLLECTION, KG_NODES_COLLECTION,
    },
    utils::embedding::Embedder,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NeighborDirection {
    In,
    Out,
    Both,
}

impl NeighborDirection {
    pub fn from_loose(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "in" => NeighborDirection::In,
            "out" => NeighborDirection::Out,
            _ => NeighborDirection::Both,
        }
    }
}

/// One hop of the neighborhood: the connecting edge plus the node on the
/// far side (when it exists in the node collection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub edge_id: String,
    pub from: String,
    pub to: String,
    pub rel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<Value>,
}

/// Read-side queries over the persisted knowledge graph.
pub struct GraphSearch {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl GraphSearch {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Semantic node search, optionally restricted to one node type.
    pub async fn search_nodes(
        &self,
        query: &str,
        top_k: usize,
        node_type: Option<&str>,
    ) -> Result<Vec<VectorHit>, AppError> {
        let embedding = self.embedder.embed(query).await?;
        let filter = node_type.map(|node_type| {
            let mut filter = PayloadFilter::new();
            filter.insert("type".to_string(), json!(node_type));
            filter
        });
        self.store
            .search(KG_NODES_COLLECTION, embedding, top_k, filter)
            .await
    }

    /// 1-hop neighborhood of a node over the edge collection.
    pub async fn neighbors(
        &self,
        node_id: &str,
        direction: NeighborDirection,
        rel: Option<&str>,
        limit: usize,
    ) -> Result<Vec<NeighborEntry>, AppError> {
        let mut edges: Vec<Value> = Vec::new();

        if matches!(direction, NeighborDirection::Out | NeighborDirection::Both) {
            let mut filter = PayloadFilter::new();
            filter.insert("from_node_id".to_string(), json!(node_id));
            if let Some(rel) = rel {
                filter.insert("rel".to_string(), json!(rel));
            }
            edges.extend(
                self.store
                    .fetch_by_filter(KG_EDGES_COLLECTION, filter, limit)
                    .await?
                    .into_iter()
                    .map(|r| r.payload),
            );
        }
        if matches!(direction, NeighborDirection::In | NeighborDirection::Both) {
            let mut filter = PayloadFilter::new();
            filter.insert("to_node_id".to_string(), json!(node_id));
            if let Some(rel) = rel {
                filter.insert("rel".to_string(), json!(rel));
            }
            edges.extend(
                self.store
                    .fetch_by_filter(KG_EDGES_COLLECTION, filter, limit)
                    .await?
                    .into_iter()
                    .map(|r| r.payload),
            );
        }

        let mut entries = Vec::new();
        for payload in edges.into_iter().take(limit) {
            let from = payload
                .get("from_node_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let to = payload
                .get("to_node_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let other = if from == node_id { &to } else { &from };

            let mut node_filter = PayloadFilter::new();
            node_filter.insert("node_id".to_string(), json!(other));
            let node = self
                .store
                .fetch_by_filter(KG_NODES_COLLECTION, node_filter, 1)
                .await?
                .into_iter()
                .next()
                .map(|r| r.payload);

            entries.push(NeighborEntry {
                edge_id: payload
                    .get("edge_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                from,
                to,
                rel: payload
                    .get("rel")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                node,
            });
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{KgBuildOptions, KgBuilder};
    use crate::lexicon::Lexicon;
    use async_trait::async_trait;
    use common::model::{EvidenceRef, Requirement, RequirementTag};
    use common::storage::{db::SurrealDbClient, vector::SurrealVectorStore};
    use uuid::Uuid;

    struct HashEmbedder;

    #[async_trait]
    impl Embedder for HashEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
            // Cheap deterministic embedding: char-class histogram.
            let mut v = [0.0_f32; 4];
            for c in text.chars() {
                let slot = (c as usize) % 4;
                if let Some(x) = v.get_mut(slot) {
                    *x += 1.0;
                }
            }
            Ok(v.to_vec())
        }
        fn dimension(&self) -> usize {
            4
        }
        fn backend_label(&self) -> &'static str {
            "hash"
        }
    }

    async fn seeded_graph() -> GraphSearch {
        let db = Arc::new(
            SurrealDbClient::memory("kg_search_ns", &Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        let store: Arc<dyn VectorStore> = Arc::new(SurrealVectorStore::new(db));
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder);
        let builder = KgBuilder::new(
            None,
            Arc::clone(&store),
            Arc::clone(&embedder),
            Lexicon::default(),
        );

        let requirement = Requirement {
            req_id: "REQ-100".to_string(),
            title: "The user must reset the password".to_string(),
            tag: RequirementTag::Security,
            priority: None,
            measurable_criteria: None,
            actors: Vec::new(),
            evidence_refs: vec![EvidenceRef {
                source_file: "spec.txt".to_string(),
                sha1: "abc".to_string(),
                chunk_index: 0,
            }],
            evidence: None,
        };
        builder
            .build(
                &[requirement],
                &KgBuildOptions {
                    persist: true,
                    ..KgBuildOptions::default()
                },
            )
            .await;

        GraphSearch::new(store, embedder)
    }

    #[tokio::test]
    async fn test_neighbors_out_includes_tag() {
        let search = seeded_graph().await;
        let neighbors = search
            .neighbors("REQ-100", NeighborDirection::Out, None, 10)
            .await
            .expect("neighbors");

        assert!(!neighbors.is_empty());
        assert!(neighbors.iter().any(|n| n.to == "tag:security" && n.rel == "HAS_TAG"));
        let tagged = neighbors
            .iter()
            .find(|n| n.to == "tag:security")
            .expect("tag edge");
        assert!(tagged.node.is_some(), "far-side node hydrated");
    }

    #[tokio::test]
    async fn test_neighbors_respects_rel_filter() {
        let search = seeded_graph().await;
        let neighbors = search
            .neighbors("REQ-100", NeighborDirection::Both, Some("HAS_ACTOR"), 10)
            .await
            .expect("neighbors");
        assert!(neighbors.iter().all(|n| n.rel == "HAS_ACTOR"));
        assert!(!neighbors.is_empty());
    }

    #[tokio::test]
    async fn test_search_nodes_returns_requirement() {
        let search = seeded_graph().await;
        let hits = search
            .search_nodes("reset password", 5, Some("Requirement"))
            .await
            .expect("search");
        assert!(!hits.is_empty());
        assert!(hits.iter().any(|h| h.id == "REQ-100"));
    }
}
