use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use common::{
    error::AppError,
    llm::{extract_json_str, ChatClient, ChatMessage, ChatRequest},
    storage::types::{
        criterion::{Criterion, DEFAULT_CRITERIA_KEYS},
        evaluation::{CriterionEvaluation, Evaluation},
    },
    utils::checksum::requirement_checksum,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::cache::ArtifactCache;

const EVALUATION_TEMPERATURE: f32 = 0.0;
const PASS_SCORE: f32 = 0.7;

const EVALUATION_SYSTEM_PROMPT: &str = "You are a quality reviewer for software requirements. \
Score the requirement against the given criteria with scores from 0.0 to 1.0. \
Return ONLY JSON of the form: {\"details\": [{\"criterion\": string, \"score\": number, \"passed\": bool, \"feedback\": string}]}";

/// Per-requirement scoring result plus bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub score: f32,
    pub verdict: String,
    pub evaluation: Vec<CriterionEvaluation>,
    pub model: String,
    pub latency_ms: u64,
    pub cached: bool,
}

/// The scoring seam used by the delegators; tests plug deterministic stubs.
#[async_trait]
pub trait RequirementScorer: Send + Sync {
    async fn score(
        &self,
        text: &str,
        criteria_keys: Option<&[String]>,
        threshold: f32,
    ) -> Result<EvaluationOutcome, AppError>;
}

/// Scores requirements per criterion via the LLM (JSON mode) with a
/// deterministic heuristic fallback, aggregates with rubric weights and
/// persists every evaluation append-only through the artifact cache.
pub struct EvaluationService {
    chat: Option<Arc<dyn ChatClient>>,
    cache: ArtifactCache,
    model_name: String,
}

#[derive(Debug, Deserialize)]
struct LlmDetails {
    #[serde(default)]
    details: Vec<LlmDetail>,
}

#[derive(Debug, Deserialize)]
struct LlmDetail {
    #[serde(default)]
    criterion: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    passed: Option<bool>,
    #[serde(default)]
    feedback: String,
}

impl EvaluationService {
    pub fn new(chat: Option<Arc<dyn ChatClient>>, cache: ArtifactCache, model_name: String) -> Self {
        Self {
            chat,
            cache,
            model_name,
        }
    }

    fn resolve_criteria(criteria_keys: Option<&[String]>) -> Vec<String> {
        match criteria_keys {
            Some(keys) if !keys.is_empty() => keys.to_vec(),
            _ => DEFAULT_CRITERIA_KEYS.iter().map(|k| (*k).to_string()).collect(),
        }
    }

    /// Deterministic scores used when no LLM is configured or the LLM reply
    /// is unusable: length drives clarity, digits drive testability, units
    /// drive measurability.
    fn heuristic_evaluation(text: &str, criteria_keys: &[String]) -> Vec<CriterionEvaluation> {
        let lower = text.to_lowercase();
        let contains_number = lower.chars().any(|c| c.is_ascii_digit());
        let words = lower.split_whitespace().count();

        let clarity = if words <= 20 {
            0.9
        } else if words <= 40 {
            0.7
        } else {
            0.5
        };
        let testability = if contains_number { 0.85 } else { 0.55 };
        let units = ["ms", "s", "second", "seconds", "%", "throughput", "latency"];
        let has_unit = units.iter().any(|u| lower.contains(u));
        let measurability = if has_unit || contains_number { 0.8 } else { 0.5 };

        criteria_keys
            .iter()
            .map(|key| {
                let (score, feedback): (f32, &str) = match key.as_str() {
                    "clarity" => (clarity, "Wording is mostly unambiguous."),
                    "testability" => (testability, "Check criteria are partially derivable."),
                    "measurability" => (measurability, "Measurable aspects are recognizable."),
                    _ => (0.6, "General assessment"),
                };
                CriterionEvaluation {
                    criterion: key.clone(),
                    score,
                    passed: score >= PASS_SCORE,
                    feedback: feedback.to_string(),
                }
            })
            .collect()
    }

    async fn llm_evaluation(
        &self,
        chat: &Arc<dyn ChatClient>,
        text: &str,
        criteria_keys: &[String],
    ) -> Result<Vec<CriterionEvaluation>, AppError> {
        let user_payload = json!({
            "requirementText": text,
            "criteriaKeys": criteria_keys,
            "outputSchema": {
                "details": [
                    {"criterion": "string", "score": "float 0..1", "passed": "bool", "feedback": "string"}
                ]
            },
        });

        let request = ChatRequest::new(
            vec![
                ChatMessage::system(EVALUATION_SYSTEM_PROMPT),
                ChatMessage::user(user_payload.to_string()),
            ],
            EVALUATION_TEMPERATURE,
        )
        .with_json_response();

        let content = chat.complete(request).await?.into_text();
        let parsed: LlmDetails = serde_json::from_str(&extract_json_str(&content)?)
            .map_err(|e| AppError::LLMParsing(format!("evaluate response malformed: {e}")))?;

        let allowed: BTreeSet<&str> = criteria_keys.iter().map(String::as_str).collect();
        let details: Vec<CriterionEvaluation> = parsed
            .details
            .into_iter()
            .filter(|d| allowed.contains(d.criterion.as_str()))
            .map(|d| {
                let score = d.score.clamp(0.0, 1.0);
                CriterionEvaluation {
                    criterion: d.criterion,
                    score,
                    passed: d.passed.unwrap_or(score >= PASS_SCORE),
                    feedback: d.feedback,
                }
            })
            .collect();

        if details.is_empty() {
            return Err(AppError::LLMParsing(
                "evaluate returned no valid details".into(),
            ));
        }
        Ok(details)
    }

    /// Weighted mean over criteria; missing weights count as 1.0.
    fn aggregate(details: &[CriterionEvaluation], criteria: &[Criterion]) -> f32 {
        if details.is_empty() {
            return 0.0;
        }
        let mut weighted_sum = 0.0_f32;
        let mut weight_total = 0.0_f32;
        for detail in details {
            let weight = Criterion::weight_for(criteria, &detail.criterion);
            weighted_sum += detail.score * weight;
            weight_total += weight;
        }
        if weight_total <= f32::EPSILON {
            0.0
        } else {
            weighted_sum / weight_total
        }
    }
}

#[async_trait]
impl RequirementScorer for EvaluationService {
    async fn score(
        &self,
        text: &str,
        criteria_keys: Option<&[String]>,
        threshold: f32,
    ) -> Result<EvaluationOutcome, AppError> {
        let criteria_keys = Self::resolve_criteria(criteria_keys);
        let checksum = requirement_checksum(text);

        // Read path determinism: an identical (text, criteria set) pair is
        // scored once; later requests read the latest persisted record.
        if let Some((cached, details)) = self.cache.latest_evaluation(&checksum).await? {
            let cached_keys: BTreeSet<&str> = details.iter().map(|d| d.criterion.as_str()).collect();
            let requested: BTreeSet<&str> = criteria_keys.iter().map(String::as_str).collect();
            if cached_keys == requested {
                debug!(checksum = %checksum, "evaluation served from artifact cache");
                let verdict = if cached.score >= threshold { "pass" } else { "fail" };
                return Ok(EvaluationOutcome {
                    score: cached.score,
                    verdict: verdict.to_string(),
                    evaluation: details,
                    model: cached.model,
                    latency_ms: cached.latency_ms,
                    cached: true,
                });
            }
        }

        let started = Instant::now();
        let details = match &self.chat {
            Some(chat) => match self.llm_evaluation(chat, text, &criteria_keys).await {
                Ok(details) => details,
                Err(err) => {
                    warn!(error = %err, "LLM evaluation failed; using heuristic fallback");
                    Self::heuristic_evaluation(text, &criteria_keys)
                }
            },
            None => Self::heuristic_evaluation(text, &criteria_keys),
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let criteria = Criterion::load_active(self.cache.db()).await?;
        let score = Self::aggregate(&details, &criteria);
        let verdict = if score >= threshold { "pass" } else { "fail" };

        let record = Evaluation::new(
            checksum,
            self.model_name.clone(),
            latency_ms,
            score,
            verdict.to_string(),
        );
        self.cache.put_evaluation(record, &details).await?;

        Ok(EvaluationOutcome {
            score,
            verdict: verdict.to_string(),
            evaluation: details,
            model: self.model_name.clone(),
            latency_ms,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::llm::ChatOutcome;
    use common::storage::db::SurrealDbClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct ScriptedChat {
        reply: String,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChatClient for ScriptedChat {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatOutcome, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatOutcome::Text(self.reply.clone()))
        }
    }

    async fn service_with_chat(reply: &str) -> (EvaluationService, Arc<AtomicUsize>) {
        let db = Arc::new(
            SurrealDbClient::memory("eval_svc_ns", &Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        db.ensure_initialized().await.expect("init");
        let calls = Arc::new(AtomicUsize::new(0));
        let chat = ScriptedChat {
            reply: reply.to_string(),
            calls: Arc::clone(&calls),
        };
        (
            EvaluationService::new(
                Some(Arc::new(chat)),
                ArtifactCache::new(db),
                "stub-model".to_string(),
            ),
            calls,
        )
    }

    #[tokio::test]
    async fn test_llm_scores_are_aggregated_and_persisted() {
        let reply = r#"{"details": [
            {"criterion": "clarity", "score": 0.9, "passed": true, "feedback": "clear"},
            {"criterion": "measurability", "score": 0.6, "passed": false, "feedback": "no metrics"}
        ]}"#;
        let (service, _) = service_with_chat(reply).await;

        let outcome = service
            .score(
                "The system shall respond quickly",
                Some(&["clarity".to_string(), "measurability".to_string()]),
                0.7,
            )
            .await
            .expect("score");

        assert!((outcome.score - 0.75).abs() < 1e-5);
        assert_eq!(outcome.verdict, "pass");
        assert_eq!(outcome.evaluation.len(), 2);
        assert!(!outcome.cached);
    }

    #[tokio::test]
    async fn test_identical_input_hits_cache_second_time() {
        let reply = r#"{"details": [
            {"criterion": "clarity", "score": 0.8, "passed": true, "feedback": "ok"}
        ]}"#;
        let (service, calls) = service_with_chat(reply).await;
        let keys = vec!["clarity".to_string()];

        let first = service.score("Same requirement", Some(&keys), 0.7).await.expect("first");
        let second = service.score("Same requirement", Some(&keys), 0.7).await.expect("second");

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "only one LLM evaluation performed");
    }

    #[tokio::test]
    async fn test_heuristic_fallback_without_llm() {
        let db = Arc::new(
            SurrealDbClient::memory("eval_svc_ns", &Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        db.ensure_initialized().await.expect("init");
        let service = EvaluationService::new(None, ArtifactCache::new(db), "heuristic".to_string());

        let with_metrics = service
            .score("The system shall respond within 200 ms", None, 0.7)
            .await
            .expect("score");
        let without_metrics = service
            .score("The system must be fast", None, 0.7)
            .await
            .expect("score");

        assert!(with_metrics.score > without_metrics.score);
        assert_eq!(with_metrics.evaluation.len(), DEFAULT_CRITERIA_KEYS.len());
    }

    #[tokio::test]
    async fn test_garbage_llm_reply_falls_back_to_heuristic() {
        let (service, _) = service_with_chat("not json at all").await;
        let outcome = service
            .score("The system shall sync data", None, 0.7)
            .await
            .expect("score");
        assert_eq!(outcome.evaluation.len(), DEFAULT_CRITERIA_KEYS.len());
    }

    #[tokio::test]
    async fn test_weights_shift_the_aggregate() {
        let details = vec![
            CriterionEvaluation {
                criterion: "clarity".into(),
                score: 1.0,
                passed: true,
                feedback: String::new(),
            },
            CriterionEvaluation {
                criterion: "measurability".into(),
                score: 0.0,
                passed: false,
                feedback: String::new(),
            },
        ];
        let criteria = vec![Criterion::new("clarity", "clarity", "", 3.0)];
        let score = EvaluationService::aggregate(&details, &criteria);
        // clarity weight 3, measurability defaults to 1 => 3/4.
        assert!((score - 0.75).abs() < 1e-6);
    }
}
