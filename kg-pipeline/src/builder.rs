use std::sync::Arc;

use common::{
    error::AppError,
    llm::{extract_json_str, ChatClient, ChatMessage, ChatRequest},
    model::Requirement,
    storage::vector::{VectorRecord, VectorStore, KG_EDGES_COLLECTION, KG_NODES_COLLECTION},
    utils::embedding::Embedder,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    graph::{dedupe_edges, dedupe_nodes, entity_id, norm_key, KgEdge, KgNode, NodeType, Relation},
    lexicon::Lexicon,
};

const KG_EXPAND_TEMPERATURE: f32 = 0.0;

#[derive(Debug, Clone)]
pub struct KgBuildOptions {
    pub use_llm: bool,
    pub llm_fallback: bool,
    pub dedupe: bool,
    pub persist: bool,
    pub model: Option<String>,
}

impl Default for KgBuildOptions {
    fn default() -> Self {
        Self {
            use_llm: false,
            llm_fallback: true,
            dedupe: true,
            persist: false,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct KgBuildStats {
    pub nodes: usize,
    pub edges: usize,
    pub deduped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted_nodes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted_edges: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KgBuildResult {
    pub nodes: Vec<KgNode>,
    pub edges: Vec<KgEdge>,
    pub stats: KgBuildStats,
}

#[derive(Debug, Deserialize, Default)]
struct LlmGraph {
    #[serde(default)]
    nodes: Vec<LlmNode>,
    #[serde(default)]
    edges: Vec<LlmEdge>,
}

#[derive(Debug, Deserialize)]
struct LlmNode {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    node_type: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct LlmEdge {
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    rel: String,
}

/// Maps requirement DTOs into a knowledge graph: one requirement node plus
/// tag/actor/entity/action satellites from lexicon heuristics, optionally
/// refined by a strict-JSON LLM pass, deduplicated by canonical key and
/// persisted to the vector store.
pub struct KgBuilder {
    chat: Option<Arc<dyn ChatClient>>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    lexicon: Lexicon,
}

impl KgBuilder {
    pub fn new(
        chat: Option<Arc<dyn ChatClient>>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        lexicon: Lexicon,
    ) -> Self {
        Self {
            chat,
            store,
            embedder,
            lexicon,
        }
    }

    pub async fn build(
        &self,
        requirements: &[Requirement],
        options: &KgBuildOptions,
    ) -> KgBuildResult {
        if requirements.is_empty() {
            return KgBuildResult::default();
        }

        let mut all_nodes = Vec::new();
        let mut all_edges = Vec::new();

        for requirement in requirements {
            let (nodes, edges) = self.map_requirement(requirement, options).await;
            all_nodes.extend(nodes);
            all_edges.extend(edges);
        }

        let (mut nodes, mut edges, deduped) = if options.dedupe {
            let (nodes, removed_nodes) = dedupe_nodes(all_nodes);
            let (edges, removed_edges) = dedupe_edges(all_edges);
            (nodes, edges, removed_nodes.saturating_add(removed_edges))
        } else {
            (all_nodes, all_edges, 0)
        };

        let mut stats = KgBuildStats {
            nodes: nodes.len(),
            edges: edges.len(),
            deduped,
            ..KgBuildStats::default()
        };

        if options.persist {
            match self.persist(&mut nodes, &mut edges).await {
                Ok((persisted_nodes, persisted_edges)) => {
                    stats.persisted_nodes = Some(persisted_nodes);
                    stats.persisted_edges = Some(persisted_edges);
                }
                Err(err) => {
                    // The in-memory graph stays usable; report and move on.
                    error!(error = %err, "knowledge graph persistence failed");
                    stats.persist_error = Some(err.to_string());
                }
            }
        }

        info!(
            nodes = stats.nodes,
            edges = stats.edges,
            deduped = stats.deduped,
            "knowledge graph built"
        );
        KgBuildResult {
            nodes,
            edges,
            stats,
        }
    }

    async fn map_requirement(
        &self,
        requirement: &Requirement,
        options: &KgBuildOptions,
    ) -> (Vec<KgNode>, Vec<KgEdge>) {
        let req_id = requirement.req_id.trim();
        let req_id = if req_id.is_empty() {
            format!(
                "REQ-{}",
                norm_key(&requirement.title).chars().take(16).collect::<String>()
            )
        } else {
            req_id.to_string()
        };
        let title = requirement.title.trim().to_string();
        let tag = requirement.tag.as_str();
        let evidence = serde_json::to_value(&requirement.evidence_refs).unwrap_or_default();
        let first_source = requirement.evidence_refs.first().map(|ev| {
            json!({
                "file": ev.source_file,
                "sha1": ev.sha1,
                "chunkIndex": ev.chunk_index,
            })
        });

        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        nodes.push(KgNode {
            id: req_id.clone(),
            node_type: NodeType::Requirement,
            name: title.clone(),
            payload: json!({
                "node_id": req_id,
                "type": "Requirement",
                "name": title,
                "tag": tag,
                "source": first_source,
                "raw": serde_json::to_value(requirement).unwrap_or_default(),
                "canonical_key": format!("requirement#{}", norm_key(&req_id)),
            }),
            embed_text: Some(title.clone()),
        });

        let tag_id = entity_id(NodeType::Tag, tag);
        nodes.push(KgNode {
            id: tag_id.clone(),
            node_type: NodeType::Tag,
            name: tag.to_string(),
            payload: json!({
                "node_id": tag_id,
                "type": "Tag",
                "name": tag,
                "evidence": evidence,
                "canonical_key": format!("tag#{}", norm_key(tag)),
            }),
            embed_text: None,
        });
        edges.push(self.relation_edge(
            &req_id,
            &tag_id,
            Relation::HasTag,
            &evidence,
            Some(format!("{title} HAS_TAG {tag}")),
        ));

        let (heuristic_nodes, heuristic_edges) =
            self.heuristic_actor_entity_action(&req_id, &title, &evidence);
        let sparse = heuristic_nodes.is_empty() && heuristic_edges.is_empty();
        nodes.extend(heuristic_nodes);
        edges.extend(heuristic_edges);

        let llm_available = self.chat.is_some();
        if (options.use_llm && llm_available) || (options.llm_fallback && llm_available && sparse) {
            match self.llm_expand(&title, &req_id, tag, options.model.as_deref()).await {
                Ok((llm_nodes, llm_edges)) => {
                    nodes.extend(llm_nodes);
                    edges.extend(llm_edges);
                }
                Err(err) => {
                    warn!(req_id = %req_id, error = %err, "LLM graph expansion skipped");
                }
            }
        }

        (nodes, edges)
    }

    fn relation_edge(
        &self,
        from: &str,
        to: &str,
        rel: Relation,
        evidence: &Value,
        embed_text: Option<String>,
    ) -> KgEdge {
        let id = KgEdge::edge_id(from, rel, to);
        KgEdge {
            id: id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            rel,
            payload: json!({
                "edge_id": id,
                "from_node_id": from,
                "to_node_id": to,
                "rel": rel.as_str(),
                "evidence": evidence,
                "canonical_key": format!("from={from}|rel={}|to={to}", rel.as_str()),
            }),
            embed_text,
        }
    }

    /// Best-effort actor/entity/action satellites from the lexicon.
    fn heuristic_actor_entity_action(
        &self,
        req_id: &str,
        title: &str,
        evidence: &Value,
    ) -> (Vec<KgNode>, Vec<KgEdge>) {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        if let Some(actor) = self.lexicon.detect_actor(title) {
            let actor_id = entity_id(NodeType::Actor, &actor);
            nodes.push(KgNode {
                id: actor_id.clone(),
                node_type: NodeType::Actor,
                name: actor.clone(),
                payload: json!({
                    "node_id": actor_id,
                    "type": "Actor",
                    "name": actor,
                    "canonical_key": format!("actor#{}", norm_key(&actor)),
                }),
                embed_text: None,
            });
            edges.push(self.relation_edge(
                req_id,
                &actor_id,
                Relation::HasActor,
                evidence,
                Some(format!("{title} HAS_ACTOR {actor}")),
            ));
        }

        let action_id = self.lexicon.guess_action(title).map(|action| {
            let action_id = entity_id(NodeType::Action, &action);
            nodes.push(KgNode {
                id: action_id.clone(),
                node_type: NodeType::Action,
                name: action.clone(),
                payload: json!({
                    "node_id": action_id,
                    "type": "Action",
                    "verb": action,
                    "canonical_key": format!("action#{}", norm_key(&action)),
                }),
                embed_text: None,
            });
            edges.push(self.relation_edge(
                req_id,
                &action_id,
                Relation::HasAction,
                evidence,
                Some(format!("{title} HAS_ACTION {action}")),
            ));
            action_id
        });

        for entity in self.lexicon.detect_entities(title) {
            let eid = entity_id(NodeType::Entity, &entity);
            nodes.push(KgNode {
                id: eid.clone(),
                node_type: NodeType::Entity,
                name: entity.clone(),
                payload: json!({
                    "node_id": eid,
                    "type": "Entity",
                    "name": entity,
                    "canonical_key": format!("entity#{}", norm_key(&entity)),
                }),
                embed_text: None,
            });
            if let Some(action_id) = &action_id {
                edges.push(self.relation_edge(
                    action_id,
                    &eid,
                    Relation::OnEntity,
                    evidence,
                    Some(format!("{action_id} ON_ENTITY {entity}")),
                ));
            }
        }

        (nodes, edges)
    }

    /// Strict-JSON graph view from the LLM. Invalid JSON is ignored; missing
    /// ids are synthesized from `(type, name)`.
    async fn llm_expand(
        &self,
        title: &str,
        req_id: &str,
        tag: &str,
        model: Option<&str>,
    ) -> Result<(Vec<KgNode>, Vec<KgEdge>), AppError> {
        let Some(chat) = &self.chat else {
            return Ok((Vec::new(), Vec::new()));
        };

        let request = ChatRequest::new(
            vec![
                ChatMessage::system(
                    "Extract a knowledge-graph view from the requirement title. Answer ONLY with JSON (no explanations).",
                ),
                ChatMessage::user(format!(
                    "Return a JSON object with nodes and edges.\nSchema:\n{{\n  \"nodes\": [{{\"id\": \"...\", \"type\": \"...\", \"name\": \"...\"}}],\n  \"edges\": [{{\"from\": \"...\", \"to\": \"...\", \"rel\": \"...\"}}]\n}}\nTitle: \"{title}\"\nReqId: {req_id}\nTag: {tag}\n"
                )),
            ],
            KG_EXPAND_TEMPERATURE,
        )
        .with_model(model.map(str::to_string));

        let content = chat.complete(request).await?.into_text();
        let graph: LlmGraph = match extract_json_str(&content)
            .and_then(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| AppError::LLMParsing(format!("graph JSON malformed: {e}")))
            }) {
            Ok(graph) => graph,
            Err(err) => {
                debug!(error = %err, "LLM graph reply ignored");
                return Ok((Vec::new(), Vec::new()));
            }
        };

        let mut nodes = Vec::new();
        for raw in graph.nodes {
            let node_type = NodeType::from_loose(&raw.node_type);
            let name = if raw.name.trim().is_empty() {
                raw.id.trim().to_string()
            } else {
                raw.name.trim().to_string()
            };
            if name.is_empty() {
                continue;
            }
            let id = if raw.id.trim().is_empty() {
                entity_id(node_type, &name)
            } else {
                raw.id.trim().to_string()
            };
            nodes.push(KgNode {
                id: id.clone(),
                node_type,
                name: name.clone(),
                payload: json!({
                    "node_id": id,
                    "type": node_type.as_str(),
                    "name": name,
                }),
                embed_text: None,
            });
        }

        let mut edges = Vec::new();
        for raw in graph.edges {
            let from = raw.from.trim();
            let to = raw.to.trim();
            if from.is_empty() || to.is_empty() {
                continue;
            }
            let rel = Relation::from_loose(&raw.rel);
            let id = KgEdge::edge_id(from, rel, to);
            edges.push(KgEdge {
                id: id.clone(),
                from: from.to_string(),
                to: to.to_string(),
                rel,
                payload: json!({
                    "edge_id": id,
                    "from_node_id": from,
                    "to_node_id": to,
                    "rel": rel.as_str(),
                }),
                embed_text: None,
            });
        }

        Ok((nodes, edges))
    }

    /// Upserts the graph into the two vector collections. Node embeddings
    /// come from `embed_text` (falling back to the name); edges are stored
    /// without vectors.
    async fn persist(
        &self,
        nodes: &mut [KgNode],
        edges: &mut [KgEdge],
    ) -> Result<(usize, usize), AppError> {
        let dimension = self.embedder.dimension();
        self.store
            .ensure_collection(KG_NODES_COLLECTION, dimension)
            .await?;
        self.store
            .ensure_collection(KG_EDGES_COLLECTION, dimension)
            .await?;

        let texts: Vec<String> = nodes
            .iter()
            .map(|n| n.embed_text.clone().unwrap_or_else(|| n.name.clone()))
            .collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        let node_records: Vec<VectorRecord> = nodes
            .iter()
            .zip(embeddings)
            .map(|(node, embedding)| VectorRecord {
                id: node.id.clone(),
                embedding: Some(embedding),
                payload: node.payload.clone(),
            })
            .collect();
        let persisted_nodes = self.store.upsert(KG_NODES_COLLECTION, node_records).await?;

        let edge_records: Vec<VectorRecord> = edges
            .iter()
            .map(|edge| VectorRecord {
                id: edge.id.clone(),
                embedding: None,
                payload: edge.payload.clone(),
            })
            .collect();
        let persisted_edges = self.store.upsert(KG_EDGES_COLLECTION, edge_records).await?;

        Ok((persisted_nodes, persisted_edges))
    }
}
