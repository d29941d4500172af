use std::sync::Arc;

use common::{
    error::AppError,
    llm::{ChatClient, ChatMessage, ChatOutcome, ChatRequest},
    model::{Chunk, EvidenceRef, Requirement, RequirementPriority, RequirementTag},
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use agent_runtime::bus::{BusMessage, MessageBus, MessageContext, TOPIC_DTO};

use crate::{
    chunking::{chunk_payloads, force_split_in_two, ChunkingOptions},
    extraction::{DocumentParser, FileOrText},
    schema::{requirement_extraction_tool, EXTRACTION_SYSTEM_PROMPT},
};

const MINING_TEMPERATURE: f32 = 0.2;

/// Chunking bounds used when neighbor evidence needs a second chunk.
const NEIGHBOR_FALLBACK: ChunkingOptions = ChunkingOptions {
    min_tokens: 1,
    max_tokens: 8,
    overlap_tokens: 1,
};

#[derive(Debug, Clone, Default)]
pub struct MiningOptions {
    pub model: Option<String>,
    pub neighbor_refs: bool,
    pub chunking: Option<ChunkingOptions>,
}

/// One extracted item as the model reports it. Unknown fields are dropped.
#[derive(Debug, Deserialize)]
struct ExtractedItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    priority: String,
    #[serde(default)]
    measurable_criteria: String,
    #[serde(default)]
    actors: Vec<String>,
    #[serde(default)]
    evidence: String,
}

#[derive(Debug, Deserialize, Default)]
struct ExtractedPayload {
    #[serde(default)]
    requirements: Vec<ExtractedItem>,
    /// Legacy content-JSON shape.
    #[serde(default)]
    items: Vec<ExtractedItem>,
}

impl ExtractedPayload {
    fn into_items(self) -> Vec<ExtractedItem> {
        if self.requirements.is_empty() {
            self.items
        } else {
            self.requirements
        }
    }
}

/// Mines requirement DTOs from documents: extract text, window into chunks,
/// run one forced tool-call completion per chunk and assemble typed
/// requirements with provenance refs. Re-entrant; concurrent mines on
/// disjoint inputs are safe.
pub struct MiningAgent {
    chat: Arc<dyn ChatClient>,
    parser: Arc<dyn DocumentParser>,
    /// When present, every mined DTO is also published on the DTO topic for
    /// external forwarding.
    bus: Option<Arc<MessageBus>>,
}

impl MiningAgent {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        parser: Arc<dyn DocumentParser>,
        bus: Option<Arc<MessageBus>>,
    ) -> Self {
        Self { chat, parser, bus }
    }

    pub async fn mine(
        &self,
        inputs: Vec<FileOrText>,
        options: &MiningOptions,
    ) -> Result<Vec<Requirement>, AppError> {
        let (requirements, _) = self.mine_with_chunks(inputs, options).await?;
        Ok(requirements)
    }

    /// Like [`Self::mine`], additionally returning the chunks so callers can
    /// persist them for retrieval.
    pub async fn mine_with_chunks(
        &self,
        inputs: Vec<FileOrText>,
        options: &MiningOptions,
    ) -> Result<(Vec<Requirement>, Vec<Chunk>), AppError> {
        let normalized = FileOrText::normalize(inputs);

        let mut raw_records = Vec::new();
        for (filename, data, content_type) in &normalized {
            match self.parser.extract(filename, data, content_type) {
                Ok(blocks) => raw_records.extend(blocks),
                Err(err) => {
                    warn!(filename = %filename, error = %err, "text extraction failed");
                }
            }
        }
        if raw_records.is_empty() {
            info!("mining: no raw text extracted; nothing to do");
            return Ok((Vec::new(), Vec::new()));
        }

        let chunking = options.chunking.unwrap_or_default();
        let mut chunks = chunk_payloads(&raw_records, chunking);

        // Neighbor evidence needs at least two chunks: re-chunk finer, then
        // force a whitespace split as the last resort.
        if options.neighbor_refs && chunks.len() < 2 {
            chunks = chunk_payloads(&raw_records, NEIGHBOR_FALLBACK);
            if chunks.len() < 2 {
                if let Some(first) = raw_records.first() {
                    chunks = force_split_in_two(first);
                }
            }
        }
        if chunks.is_empty() {
            info!("mining: no chunks produced; nothing to do");
            return Ok((Vec::new(), Vec::new()));
        }

        let mut requirements = Vec::new();
        for index in 0..chunks.len() {
            let Some(chunk) = chunks.get(index) else {
                continue;
            };
            if chunk.text.trim().is_empty() {
                continue;
            }

            let items = self.mine_chunk(chunk, options.model.clone()).await;
            if items.is_empty() {
                continue;
            }

            let neighbors = if options.neighbor_refs {
                neighbor_evidence(&chunks, index)
            } else {
                Vec::new()
            };

            let multiple = items.len() > 1;
            for (item_index, item) in items.into_iter().enumerate() {
                let Some(mut requirement) = build_requirement(item, chunk) else {
                    continue;
                };
                if multiple {
                    requirement.req_id =
                        format!("{}{}", suggested_req_id(chunk), suffix_for(item_index));
                }
                requirement.merge_evidence(&neighbors);

                if let Some(bus) = &self.bus {
                    let ctx = MessageContext::new(uuid::Uuid::new_v4().to_string())
                        .with_req_id(Some(requirement.req_id.clone()));
                    bus.publish(
                        TOPIC_DTO,
                        BusMessage::MinedDto {
                            requirement: requirement.clone(),
                        },
                        &ctx,
                    )
                    .await;
                }

                requirements.push(requirement);
            }
        }

        info!(count = requirements.len(), "mining produced DTOs");
        Ok((requirements, chunks))
    }

    /// One forced tool-call completion for a chunk. A missing tool call
    /// falls back to content JSON; anything else yields zero items, never an
    /// error.
    async fn mine_chunk(&self, chunk: &Chunk, model: Option<String>) -> Vec<ExtractedItem> {
        let suggested = suggested_req_id(chunk);
        let messages = vec![
            ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Extract all requirements from the following text chunk.\n\
                 Use '{suggested}' as the base for req_id, adding -a, -b, -c... for multiple requirements.\n\n\
                 Text:\n---\n{}\n---",
                chunk.text.trim()
            )),
        ];

        let request = ChatRequest::new(messages, MINING_TEMPERATURE)
            .with_model(model)
            .with_tool(requirement_extraction_tool());

        match self.chat.complete(request).await {
            Ok(ChatOutcome::ToolCall { arguments, .. }) => parse_items(&arguments),
            Ok(ChatOutcome::Text(content)) => {
                warn!("tool call expected but not received; parsing content as JSON");
                parse_items(&content)
            }
            Err(err) => {
                warn!(error = %err, chunk_index = chunk.payload.chunk_index, "chunk mining failed");
                Vec::new()
            }
        }
    }
}

fn parse_items(raw: &str) -> Vec<ExtractedItem> {
    let Ok(json) = common::llm::extract_json_str(raw) else {
        return Vec::new();
    };

    // Surface silently-dropped keys once; the typed shape is authoritative.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&json) {
        if let Some(object) = value.as_object() {
            for key in object.keys() {
                if key != "requirements" && key != "items" {
                    debug!(key = %key, "unknown field in extraction payload dropped");
                }
            }
        }
    }

    serde_json::from_str::<ExtractedPayload>(&json)
        .map(ExtractedPayload::into_items)
        .unwrap_or_default()
}

fn suggested_req_id(chunk: &Chunk) -> String {
    let sha_prefix: String = if chunk.payload.sha1.is_empty() {
        "X".to_string()
    } else {
        chunk.payload.sha1.chars().take(6).collect()
    };
    format!("REQ-{}-{:03}", sha_prefix, chunk.payload.chunk_index)
}

/// Suffixes for multiple items from one chunk: nothing, then `-a`..`-z`,
/// then the numeric item index.
fn suffix_for(index: usize) -> String {
    match index {
        0 => String::new(),
        1..=26 => {
            let letter = char::from(b'a'.saturating_add((index.saturating_sub(1)) as u8));
            format!("-{letter}")
        }
        _ => format!("-{index}"),
    }
}

fn build_requirement(item: ExtractedItem, chunk: &Chunk) -> Option<Requirement> {
    let title = item.title.trim().to_string();
    if title.is_empty() {
        return None;
    }

    let measurable_criteria = Some(item.measurable_criteria.trim().to_string())
        .filter(|c| !c.is_empty());
    let evidence = Some(item.evidence.trim().to_string()).filter(|e| !e.is_empty());
    let priority = RequirementPriority::from_loose(&item.priority)
        .unwrap_or(RequirementPriority::Must);

    Some(Requirement {
        req_id: suggested_req_id(chunk),
        title,
        tag: RequirementTag::from_loose(&item.tag),
        priority: Some(priority),
        measurable_criteria,
        actors: item.actors,
        evidence_refs: vec![chunk.payload.evidence_ref()],
        evidence,
    })
}

/// Evidence refs of the chunks at position ±1 sharing `(sha1, source_file)`.
fn neighbor_evidence(chunks: &[Chunk], index: usize) -> Vec<EvidenceRef> {
    let Some(current) = chunks.get(index) else {
        return Vec::new();
    };
    let mut refs = Vec::new();
    let candidates = [index.checked_sub(1), index.checked_add(1)];
    for candidate in candidates.into_iter().flatten() {
        if let Some(neighbor) = chunks.get(candidate) {
            if neighbor.payload.sha1 == current.payload.sha1
                && neighbor.payload.source_file == current.payload.source_file
            {
                refs.push(neighbor.payload.evidence_ref());
            }
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::DefaultDocumentParser;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic stub: returns the same tool-call payload on every chunk.
    struct StubChat {
        payload: String,
        as_tool_call: bool,
        calls: AtomicUsize,
    }

    impl StubChat {
        fn tool(payload: &str) -> Self {
            Self {
                payload: payload.to_string(),
                as_tool_call: true,
                calls: AtomicUsize::new(0),
            }
        }

        fn text(payload: &str) -> Self {
            Self {
                payload: payload.to_string(),
                as_tool_call: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatClient for StubChat {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatOutcome, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.as_tool_call {
                Ok(ChatOutcome::ToolCall {
                    name: "submit_requirements".to_string(),
                    arguments: self.payload.clone(),
                })
            } else {
                Ok(ChatOutcome::Text(self.payload.clone()))
            }
        }
    }

    struct FailingChat;

    #[async_trait]
    impl ChatClient for FailingChat {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatOutcome, AppError> {
            Err(AppError::UpstreamUnavailable("llm down".into()))
        }
    }

    const SINGLE_ITEM: &str =
        r#"{"requirements":[{"title":"SSO support","tag":"security","priority":"must"}]}"#;

    fn agent(chat: Arc<dyn ChatClient>) -> MiningAgent {
        MiningAgent::new(chat, Arc::new(DefaultDocumentParser), None)
    }

    fn is_hex(s: &str) -> bool {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
    }

    #[tokio::test]
    async fn test_single_file_mining_without_neighbors() {
        let miner = agent(Arc::new(StubChat::tool(SINGLE_ITEM)));
        let requirements = miner
            .mine(
                vec![FileOrText::Text(
                    "The system shall support SSO. Response time under 200ms.".to_string(),
                )],
                &MiningOptions::default(),
            )
            .await
            .expect("mine");

        assert_eq!(requirements.len(), 1);
        let req = requirements.first().expect("requirement");
        assert_eq!(req.evidence_refs.len(), 1);
        assert_eq!(req.tag, RequirementTag::Security);

        let rest = req.req_id.strip_prefix("REQ-").expect("REQ- prefix");
        let (sha_part, index_part) = rest.split_at(6);
        assert!(is_hex(sha_part), "expected hex sha prefix, got {sha_part}");
        assert_eq!(index_part, "-000");
    }

    #[tokio::test]
    async fn test_neighbor_refs_forces_two_chunks() {
        let miner = agent(Arc::new(StubChat::tool(SINGLE_ITEM)));
        let requirements = miner
            .mine(
                vec![FileOrText::Text(
                    "The system shall support SSO. Response time under 200ms.".to_string(),
                )],
                &MiningOptions {
                    neighbor_refs: true,
                    ..MiningOptions::default()
                },
            )
            .await
            .expect("mine");

        assert!(!requirements.is_empty());
        let with_neighbor = requirements
            .iter()
            .find(|r| r.evidence_refs.len() >= 2)
            .expect("at least one requirement with neighbor evidence");

        let own = with_neighbor.evidence_refs.first().expect("own ref");
        assert!(with_neighbor.evidence_refs.iter().any(|ev| {
            ev.chunk_index == own.chunk_index.saturating_add(1)
                || Some(ev.chunk_index) == own.chunk_index.checked_sub(1)
        }));
    }

    #[tokio::test]
    async fn test_multiple_items_get_suffixes() {
        let payload = r#"{"requirements":[
            {"title":"The system must do A","tag":"functional","priority":"must"},
            {"title":"The system must do B","tag":"functional","priority":"must"},
            {"title":"The system must do C","tag":"functional","priority":"must"}
        ]}"#;
        let miner = agent(Arc::new(StubChat::tool(payload)));
        let requirements = miner
            .mine(
                vec![FileOrText::Text("short body".to_string())],
                &MiningOptions::default(),
            )
            .await
            .expect("mine");

        assert_eq!(requirements.len(), 3);
        let ids: Vec<&str> = requirements.iter().map(|r| r.req_id.as_str()).collect();
        assert!(ids.first().is_some_and(|id| id.ends_with("-000")));
        assert!(ids.get(1).is_some_and(|id| id.ends_with("-000-a")));
        assert!(ids.get(2).is_some_and(|id| id.ends_with("-000-b")));
    }

    #[tokio::test]
    async fn test_content_json_fallback() {
        let miner = agent(Arc::new(StubChat::text(
            r#"{"items":[{"title":"Fallback works","tag":"weird-tag"}]}"#,
        )));
        let requirements = miner
            .mine(
                vec![FileOrText::Text("body".to_string())],
                &MiningOptions::default(),
            )
            .await
            .expect("mine");

        assert_eq!(requirements.len(), 1);
        // Unknown tags remap to functional.
        assert_eq!(
            requirements.first().map(|r| r.tag),
            Some(RequirementTag::Functional)
        );
    }

    #[tokio::test]
    async fn test_llm_failure_yields_zero_requirements() {
        let miner = agent(Arc::new(FailingChat));
        let requirements = miner
            .mine(
                vec![FileOrText::Text("body".to_string())],
                &MiningOptions::default(),
            )
            .await
            .expect("mine");
        assert!(requirements.is_empty());
    }

    #[tokio::test]
    async fn test_empty_titles_are_skipped() {
        let miner = agent(Arc::new(StubChat::tool(
            r#"{"requirements":[{"title":"  ","tag":"functional"},{"title":"Kept","tag":"data"}]}"#,
        )));
        let requirements = miner
            .mine(
                vec![FileOrText::Text("body".to_string())],
                &MiningOptions::default(),
            )
            .await
            .expect("mine");

        assert_eq!(requirements.len(), 1);
        assert_eq!(requirements.first().map(|r| r.title.as_str()), Some("Kept"));
    }

    #[test]
    fn test_suffix_series() {
        assert_eq!(suffix_for(0), "");
        assert_eq!(suffix_for(1), "-a");
        assert_eq!(suffix_for(26), "-z");
        assert_eq!(suffix_for(27), "-27");
    }

    #[tokio::test]
    async fn test_idempotent_for_identical_input() {
        let input = "The system shall support SSO.";
        let run = |payload: &'static str| async move {
            let miner = agent(Arc::new(StubChat::tool(payload)));
            miner
                .mine(
                    vec![FileOrText::Text(input.to_string())],
                    &MiningOptions::default(),
                )
                .await
                .expect("mine")
        };

        let first = run(SINGLE_ITEM).await;
        let second = run(SINGLE_ITEM).await;
        let first_ids: Vec<String> = first.iter().map(|r| r.req_id.clone()).collect();
        let second_ids: Vec<String> = second.iter().map(|r| r.req_id.clone()).collect();
        assert_eq!(first_ids, second_ids);
    }
}
