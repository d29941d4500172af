use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeType {
    Requirement,
    Tag,
    Actor,
    Entity,
    Action,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Requirement => "Requirement",
            NodeType::Tag => "Tag",
            NodeType::Actor => "Actor",
            NodeType::Entity => "Entity",
            NodeType::Action => "Action",
        }
    }

    pub fn from_loose(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "requirement" => NodeType::Requirement,
            "tag" => NodeType::Tag,
            "actor" => NodeType::Actor,
            "action" => NodeType::Action,
            _ => NodeType::Entity,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Relation {
    #[serde(rename = "HAS_TAG")]
    HasTag,
    #[serde(rename = "HAS_ACTOR")]
    HasActor,
    #[serde(rename = "HAS_ACTION")]
    HasAction,
    #[serde(rename = "ON_ENTITY")]
    OnEntity,
    #[serde(rename = "RELATES_TO")]
    RelatesTo,
}

impl Relation {
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::HasTag => "HAS_TAG",
            Relation::HasActor => "HAS_ACTOR",
            Relation::HasAction => "HAS_ACTION",
            Relation::OnEntity => "ON_ENTITY",
            Relation::RelatesTo => "RELATES_TO",
        }
    }

    pub fn from_loose(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "HAS_TAG" => Relation::HasTag,
            "HAS_ACTOR" => Relation::HasActor,
            "HAS_ACTION" => Relation::HasAction,
            "ON_ENTITY" => Relation::OnEntity,
            _ => Relation::RelatesTo,
        }
    }
}

/// Graph node. Identity is the canonical `id`; `embed_text` feeds the vector
/// index when present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KgNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_text: Option<String>,
}

/// Graph edge. Identity is `from#rel#to`; evidence lives in the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KgEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub rel: Relation,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_text: Option<String>,
}

impl KgEdge {
    pub fn edge_id(from: &str, rel: Relation, to: &str) -> String {
        format!("{from}#{}#{to}", rel.as_str())
    }
}

/// Normalizes a name for canonical keys: lowercase, collapsed whitespace,
/// restricted character set.
pub fn norm_key(s: &str) -> String {
    let lowered = s.trim().to_lowercase();
    let mut collapsed = String::with_capacity(lowered.len());
    let mut last_was_space = false;
    for c in lowered.chars() {
        if c.is_whitespace() {
            if !last_was_space && !collapsed.is_empty() {
                collapsed.push(' ');
            }
            last_was_space = true;
            continue;
        }
        last_was_space = false;
        let allowed = c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || matches!(c, 'ä' | 'ö' | 'ü' | 'ß' | ':' | '-' | '_' | '/' | '.');
        if allowed {
            collapsed.push(c);
        }
    }
    collapsed.trim().to_string()
}

/// Canonical id for non-requirement nodes: `{type lowercased}:{normalized}`.
pub fn entity_id(node_type: NodeType, name: &str) -> String {
    format!(
        "{}:{}",
        node_type.as_str().to_lowercase(),
        norm_key(name).replace(' ', "_")
    )
}

fn canonical_node_key(node: &KgNode) -> String {
    let payload_str = |key: &str| {
        node.payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    // Key precedence: id | node_id | canonical_key | "{type}#{norm(name)}".
    if !node.id.trim().is_empty() {
        return node.id.trim().to_string();
    }
    payload_str("node_id")
        .or_else(|| payload_str("canonical_key"))
        .unwrap_or_else(|| format!("{}#{}", node.node_type.as_str(), norm_key(&node.name)))
}

fn canonical_edge_key(edge: &KgEdge) -> String {
    let payload_str = |key: &str| {
        edge.payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    // Key precedence: id | edge_id | canonical_key | "from=..|rel=..|to=..".
    if !edge.id.trim().is_empty() {
        return edge.id.trim().to_string();
    }
    payload_str("edge_id")
        .or_else(|| payload_str("canonical_key"))
        .unwrap_or_else(|| {
            format!(
                "from={}|rel={}|to={}",
                edge.from,
                edge.rel.as_str(),
                edge.to
            )
        })
}

/// Set-union of two evidence arrays keyed by `(sourceFile, sha1, chunkIndex)`.
fn merge_evidence(target: &mut Value, incoming: &Value) {
    let incoming_list = match incoming.get("evidence").and_then(Value::as_array) {
        Some(list) if !list.is_empty() => list.clone(),
        _ => return,
    };

    let target_object = match target.as_object_mut() {
        Some(object) => object,
        None => return,
    };
    let entry = target_object
        .entry("evidence")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(existing) = entry.as_array_mut() else {
        return;
    };

    let key_of = |ev: &Value| {
        (
            ev.get("sourceFile").and_then(Value::as_str).unwrap_or_default().to_string(),
            ev.get("sha1").and_then(Value::as_str).unwrap_or_default().to_string(),
            ev.get("chunkIndex").and_then(Value::as_u64).unwrap_or_default(),
        )
    };
    let mut seen: BTreeSet<(String, String, u64)> = existing.iter().map(key_of).collect();
    for ev in incoming_list {
        let key = key_of(&ev);
        if seen.insert(key) {
            existing.push(ev);
        }
    }
}

/// Collapses duplicate nodes by canonical key, merging evidence payloads.
/// Returns the compact list and the number of removed duplicates.
pub fn dedupe_nodes(nodes: Vec<KgNode>) -> (Vec<KgNode>, usize) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<KgNode> = Vec::with_capacity(nodes.len());
    let mut removed = 0_usize;

    for node in nodes {
        let key = canonical_node_key(&node);
        match seen.get(&key) {
            Some(&index) => {
                removed = removed.saturating_add(1);
                if let Some(kept) = out.get_mut(index) {
                    merge_evidence(&mut kept.payload, &node.payload);
                }
            }
            None => {
                seen.insert(key, out.len());
                out.push(node);
            }
        }
    }
    (out, removed)
}

/// Same as [`dedupe_nodes`] for edges.
pub fn dedupe_edges(edges: Vec<KgEdge>) -> (Vec<KgEdge>, usize) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<KgEdge> = Vec::with_capacity(edges.len());
    let mut removed = 0_usize;

    for edge in edges {
        let key = canonical_edge_key(&edge);
        match seen.get(&key) {
            Some(&index) => {
                removed = removed.saturating_add(1);
                if let Some(kept) = out.get_mut(index) {
                    merge_evidence(&mut kept.payload, &edge.payload);
                }
            }
            None => {
                seen.insert(key, out.len());
                out.push(edge);
            }
        }
    }
    (out, removed)
}
