use std::sync::Arc;

use common::{
    error::AppError,
    llm::{ChatClient, ChatMessage, ChatRequest},
    storage::types::suggestion::Suggestion,
    utils::checksum::requirement_checksum,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::cache::ArtifactCache;

const SUGGEST_TEMPERATURE: f32 = 0.0;
const SUGGEST_BLOCK_START: &str = "<<<REQ_ATOM>>>";
const SUGGEST_BLOCK_END: &str = "<<<END_ATOM>>>";

/// One atomic improvement suggestion for a requirement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestionAtom {
    #[serde(default)]
    pub original_fragment: String,
    pub correction: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<Value>,
    #[serde(default)]
    pub notes: String,
}

/// Produces atomic rewrite suggestions per requirement and records them.
pub struct SuggestionService {
    chat: Option<Arc<dyn ChatClient>>,
    cache: ArtifactCache,
    model_name: String,
}

impl SuggestionService {
    pub fn new(chat: Option<Arc<dyn ChatClient>>, cache: ArtifactCache, model_name: String) -> Self {
        Self {
            chat,
            cache,
            model_name,
        }
    }

    pub async fn suggest(&self, text: &str) -> Result<Vec<SuggestionAtom>, AppError> {
        let atoms = match &self.chat {
            Some(chat) => match self.llm_suggest(chat, text).await {
                Ok(atoms) if !atoms.is_empty() => atoms,
                Ok(_) => Vec::new(),
                Err(err) => {
                    warn!(error = %err, "suggestion call failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if !atoms.is_empty() {
            let checksum = requirement_checksum(text);
            for atom in &atoms {
                let record = Suggestion::new(
                    checksum.clone(),
                    atom.correction.clone(),
                    self.model_name.clone(),
                );
                if let Err(err) = self.cache.db().store_item(record).await {
                    warn!(error = %err, "suggestion persistence failed");
                }
            }
        }

        Ok(atoms)
    }

    async fn llm_suggest(
        &self,
        chat: &Arc<dyn ChatClient>,
        text: &str,
    ) -> Result<Vec<SuggestionAtom>, AppError> {
        let system = format!(
            "You are an experienced requirements engineer.\n\
             Output exclusively 1-3 blocks, each exactly:\n{SUGGEST_BLOCK_START}\n{{JSON per schema}}\n{SUGGEST_BLOCK_END}\n\
             No additional text, no code fences. Each JSON block follows this schema:\n\
             {{\"original_fragment\": string, \"correction\": string, \"acceptance_criteria\": [string], \"metrics\": [object], \"notes\": string}}"
        );
        let user = serde_json::json!({
            "requirementText": text,
            "constraints": {
                "atomsPerRequirement": 3,
                "designIndependent": true,
                "measurable": true,
                "testable": true,
            },
        });

        let content = chat
            .complete(ChatRequest::new(
                vec![ChatMessage::system(system), ChatMessage::user(user.to_string())],
                SUGGEST_TEMPERATURE,
            ))
            .await?
            .into_text();

        Ok(parse_suggestion_blocks(&content))
    }
}

/// Parses `<<<REQ_ATOM>>> ... <<<END_ATOM>>>` delimited JSON blocks.
/// Malformed blocks are skipped.
pub fn parse_suggestion_blocks(text: &str) -> Vec<SuggestionAtom> {
    let mut atoms = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(SUGGEST_BLOCK_START) {
        let Some(after_start) = rest.get(start.saturating_add(SUGGEST_BLOCK_START.len())..) else {
            break;
        };
        let Some(end) = after_start.find(SUGGEST_BLOCK_END) else {
            break;
        };
        if let Some(body) = after_start.get(..end) {
            match serde_json::from_str::<SuggestionAtom>(body.trim()) {
                Ok(atom) => atoms.push(atom),
                Err(err) => warn!(error = %err, "suggestion block skipped"),
            }
        }
        rest = after_start
            .get(end.saturating_add(SUGGEST_BLOCK_END.len())..)
            .unwrap_or_default();
    }
    atoms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delimited_blocks() {
        let text = format!(
            "{SUGGEST_BLOCK_START}\n{}\n{SUGGEST_BLOCK_END}\nnoise\n{SUGGEST_BLOCK_START}\n{}\n{SUGGEST_BLOCK_END}",
            r#"{"original_fragment": "fast", "correction": "within 200 ms (p95)", "acceptance_criteria": ["Given normal load"], "metrics": [], "notes": ""}"#,
            r#"{"correction": "single user action"}"#,
        );
        let atoms = parse_suggestion_blocks(&text);
        assert_eq!(atoms.len(), 2);
        assert_eq!(
            atoms.first().map(|a| a.correction.as_str()),
            Some("within 200 ms (p95)")
        );
    }

    #[test]
    fn malformed_blocks_are_skipped() {
        let text = format!("{SUGGEST_BLOCK_START}\nnot json\n{SUGGEST_BLOCK_END}");
        assert!(parse_suggestion_blocks(&text).is_empty());
    }
}
