use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_runtime::pool::{ProgressCallback, TaskOutcome, WorkerPool};
use common::{
    error::AppError,
    llm::{strip_markdown_fences, ChatClient, ChatMessage, ChatRequest},
    storage::types::evaluation::CriterionEvaluation,
    utils::checksum::requirement_checksum,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::{cache::ArtifactCache, evaluation::RequirementScorer, AgentMessageSink};

const REWRITE_TEMPERATURE: f32 = 0.3;
const PROGRESS_EVERY: usize = 3;
const REVALIDATION_PERMITS: usize = 5;

/// IEEE 29148 shape the rewrites are steered toward.
const IEEE_29148_TEMPLATE: &str = "\nThe system shall [ACTION] [OBJECT] [CONSTRAINT].\n\n\
Acceptance Criteria:\n- GIVEN [precondition]\n- WHEN [trigger]\n- THEN [expected outcome]\n- AND [additional verification]\n";

/// Canonical improvement hint per failing criterion.
fn criterion_hint(criterion: &str) -> &'static str {
    match criterion {
        "clarity" => "Use precise, unambiguous language. Define all technical terms.",
        "testability" => "Add specific acceptance criteria with GIVEN-WHEN-THEN format.",
        "measurability" => "Include quantifiable metrics (numbers, percentages, time limits).",
        "atomic" => "Focus on a single, indivisible requirement. Split compound requirements.",
        "design_independent" => "Describe WHAT, not HOW. Avoid implementation details.",
        "unambiguous" => "Remove vague terms like 'should', 'may', 'approximately'. Be explicit.",
        "concise" => "Remove unnecessary words while keeping all essential information.",
        "consistent_language" => "Use standard terminology consistently throughout.",
        "purpose_independent" => "Focus on the requirement itself, not the business rationale.",
        "follows_template" => "Use structured format: Actor + Action + Object + Constraint + Acceptance.",
        _ => "Improve this aspect.",
    }
}

/// A requirement that failed validation, with its evaluation feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRequirement {
    pub req_id: String,
    pub text: String,
    pub score: f32,
    pub evaluation: Vec<CriterionEvaluation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteResult {
    pub req_id: String,
    pub original_text: String,
    pub rewritten_text: String,
    pub improvement_summary: String,
    pub addressed_criteria: Vec<String>,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_evaluation: Option<Vec<CriterionEvaluation>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchRewriteResult {
    pub total: usize,
    pub rewritten: usize,
    pub improved: usize,
    pub unchanged: usize,
    pub error_count: usize,
    pub results: Vec<RewriteResult>,
    pub total_time_ms: u64,
    pub avg_time_per_item_ms: u64,
}

/// Feedback-driven rewriting. Attempts within one requirement run
/// sequentially; requirements rewrite in parallel up to the pool bound.
/// Re-validation goes through its own semaphore so it cannot starve the
/// rewrite workers.
pub struct RewriteDelegator {
    chat: Arc<dyn ChatClient>,
    scorer: Arc<dyn RequirementScorer>,
    cache: ArtifactCache,
    pool: WorkerPool,
    validation_semaphore: Arc<Semaphore>,
    max_attempts: u32,
    target_score: f32,
    enable_revalidation: bool,
    model_name: String,
}

struct AttemptState {
    text: String,
    evaluation: Vec<CriterionEvaluation>,
}

impl RewriteDelegator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat: Arc<dyn ChatClient>,
        scorer: Arc<dyn RequirementScorer>,
        cache: ArtifactCache,
        max_concurrent: usize,
        per_task_timeout: Duration,
        max_attempts: u32,
        target_score: f32,
        enable_revalidation: bool,
        model_name: String,
    ) -> Self {
        info!(
            max_concurrent,
            max_attempts, target_score, "rewrite delegator initialized"
        );
        Self {
            chat,
            scorer,
            cache,
            pool: WorkerPool::new(max_concurrent, per_task_timeout),
            validation_semaphore: Arc::new(Semaphore::new(REVALIDATION_PERMITS)),
            max_attempts: max_attempts.max(1),
            target_score,
            enable_revalidation,
            model_name,
        }
    }

    fn build_rewrite_prompt(text: &str, evaluation: &[CriterionEvaluation]) -> String {
        let failed: Vec<&CriterionEvaluation> =
            evaluation.iter().filter(|e| !e.passed).collect();

        let mut prompt = format!(
            "You are a Requirements Engineering expert following IEEE 29148 standards.\n\n\
             TASK: Rewrite the following requirement to address ALL failed quality criteria.\n\n\
             ORIGINAL REQUIREMENT:\n\"{text}\"\n\n\
             FAILED QUALITY CRITERIA ({} issues):\n",
            failed.len()
        );
        for (i, criterion) in failed.iter().enumerate() {
            prompt.push_str(&format!(
                "\n{}. {} (Score: {:.2})\n   Problem: {}\n   Solution: {}\n",
                i.saturating_add(1),
                criterion.criterion.to_uppercase(),
                criterion.score,
                criterion.feedback,
                criterion_hint(&criterion.criterion),
            ));
        }
        prompt.push_str(&format!(
            "\n\nREQUIRED OUTPUT FORMAT (IEEE 29148):\n{IEEE_29148_TEMPLATE}\n\
             RULES:\n\
             1. Address EVERY failed criterion listed above\n\
             2. Use precise, measurable language (specific numbers, not \"fast\" or \"small\")\n\
             3. Include acceptance criteria in GIVEN-WHEN-THEN format\n\
             4. Keep the original intent and functionality\n\
             5. Write in English\n\
             6. Output ONLY the rewritten requirement, nothing else\n\n\
             REWRITTEN REQUIREMENT:\n"
        ));
        prompt
    }

    async fn rewrite_once(&self, state: &AttemptState) -> Result<String, AppError> {
        let prompt = Self::build_rewrite_prompt(&state.text, &state.evaluation);
        let request = ChatRequest::new(
            vec![
                ChatMessage::system(
                    "You are a Requirements Engineering expert. Output ONLY the rewritten requirement, no explanations.",
                ),
                ChatMessage::user(prompt),
            ],
            REWRITE_TEMPERATURE,
        );
        let content = self.chat.complete(request).await?.into_text();
        Ok(strip_markdown_fences(&content))
    }

    /// Sequential attempt loop for one requirement. Returns the best attempt
    /// when the target is never reached.
    async fn rewrite_requirement(
        &self,
        failed: FailedRequirement,
        message_sink: Option<AgentMessageSink>,
    ) -> RewriteResult {
        let started = Instant::now();
        let addressed: Vec<String> = failed
            .evaluation
            .iter()
            .filter(|e| !e.passed)
            .map(|e| e.criterion.clone())
            .collect();

        let mut state = AttemptState {
            text: failed.text.clone(),
            evaluation: failed.evaluation.clone(),
        };
        let mut best_text = failed.text.clone();
        let mut best_score: Option<f32> = None;
        let mut best_evaluation: Option<Vec<CriterionEvaluation>> = None;
        let mut attempt = 1_u32;

        let mut result = loop {
            let rewritten = match self.rewrite_once(&state).await {
                Ok(rewritten) if !rewritten.trim().is_empty() => rewritten,
                Ok(_) => {
                    break RewriteResult {
                        req_id: failed.req_id.clone(),
                        original_text: failed.text.clone(),
                        rewritten_text: failed.text.clone(),
                        improvement_summary: "Empty rewrite - no changes applied".to_string(),
                        addressed_criteria: addressed.clone(),
                        attempt,
                        tag: failed.tag.clone(),
                        error: Some("empty rewrite".to_string()),
                        processing_time_ms: 0,
                        new_score: None,
                        new_evaluation: None,
                    }
                }
                Err(err) => {
                    break RewriteResult {
                        req_id: failed.req_id.clone(),
                        original_text: failed.text.clone(),
                        rewritten_text: failed.text.clone(),
                        improvement_summary: format!("Error: {err}"),
                        addressed_criteria: addressed.clone(),
                        attempt,
                        tag: failed.tag.clone(),
                        error: Some(err.to_string()),
                        processing_time_ms: 0,
                        new_score: None,
                        new_evaluation: None,
                    }
                }
            };

            if !self.enable_revalidation {
                break RewriteResult {
                    req_id: failed.req_id.clone(),
                    original_text: failed.text.clone(),
                    rewritten_text: rewritten,
                    improvement_summary: format!("Addressed {} criteria", addressed.len()),
                    addressed_criteria: addressed.clone(),
                    attempt,
                    tag: failed.tag.clone(),
                    error: None,
                    processing_time_ms: 0,
                    new_score: None,
                    new_evaluation: None,
                };
            }

            // Re-score under the validation semaphore so rewrites keep their
            // own pool slots.
            let outcome = {
                let _permit = self.validation_semaphore.acquire().await;
                self.scorer
                    .score(&rewritten, None, self.target_score)
                    .await
            };

            match outcome {
                Ok(validated) => {
                    if best_score.is_none_or(|best| validated.score > best) {
                        best_text.clone_from(&rewritten);
                        best_score = Some(validated.score);
                        best_evaluation = Some(validated.evaluation.clone());
                    }

                    if validated.score >= self.target_score {
                        info!(
                            req_id = %failed.req_id,
                            attempt,
                            score = validated.score,
                            "rewrite reached target score"
                        );
                        break RewriteResult {
                            req_id: failed.req_id.clone(),
                            original_text: failed.text.clone(),
                            rewritten_text: rewritten,
                            improvement_summary: format!(
                                "Improved from {:.2} to {:.2} after {attempt} attempt(s)",
                                failed.score, validated.score
                            ),
                            addressed_criteria: addressed.clone(),
                            attempt,
                            tag: failed.tag.clone(),
                            error: None,
                            processing_time_ms: 0,
                            new_score: Some(validated.score),
                            new_evaluation: Some(validated.evaluation),
                        };
                    }

                    if attempt < self.max_attempts {
                        info!(
                            req_id = %failed.req_id,
                            score = validated.score,
                            target = self.target_score,
                            next_attempt = attempt + 1,
                            "rewrite below target; retrying with fresh feedback"
                        );
                        if let Some(sink) = &message_sink {
                            sink(
                                "RewriteDelegator",
                                &format!("{}: Score {:.2}, retrying...", failed.req_id, validated.score),
                            );
                        }
                        state = AttemptState {
                            text: rewritten,
                            evaluation: validated.evaluation,
                        };
                        attempt = attempt.saturating_add(1);
                        continue;
                    }

                    info!(
                        req_id = %failed.req_id,
                        final_score = validated.score,
                        "rewrite attempts exhausted; keeping best attempt"
                    );
                    break RewriteResult {
                        req_id: failed.req_id.clone(),
                        original_text: failed.text.clone(),
                        rewritten_text: best_text.clone(),
                        improvement_summary: format!(
                            "Max attempts reached. Score improved from {:.2} to {:.2}",
                            failed.score,
                            best_score.unwrap_or(failed.score)
                        ),
                        addressed_criteria: addressed.clone(),
                        attempt,
                        tag: failed.tag.clone(),
                        error: None,
                        processing_time_ms: 0,
                        new_score: best_score,
                        new_evaluation: best_evaluation.clone(),
                    };
                }
                Err(err) => {
                    warn!(req_id = %failed.req_id, error = %err, "re-validation failed");
                    break RewriteResult {
                        req_id: failed.req_id.clone(),
                        original_text: failed.text.clone(),
                        rewritten_text: rewritten,
                        improvement_summary: format!("Re-validation failed: {err}"),
                        addressed_criteria: addressed.clone(),
                        attempt,
                        tag: failed.tag.clone(),
                        error: Some(err.to_string()),
                        processing_time_ms: 0,
                        new_score: None,
                        new_evaluation: None,
                    };
                }
            }
        };

        result.processing_time_ms =
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if result.error.is_none() && result.rewritten_text != result.original_text {
            let checksum = requirement_checksum(&result.original_text);
            if let Err(err) = self
                .cache
                .put_rewrite(&checksum, &result.rewritten_text, &self.model_name)
                .await
            {
                warn!(req_id = %result.req_id, error = %err, "rewrite persistence failed");
            }
        }

        result
    }

    pub async fn rewrite_batch(
        &self,
        failed: Vec<FailedRequirement>,
        message_sink: Option<AgentMessageSink>,
    ) -> BatchRewriteResult {
        let send = |message: String| {
            if let Some(sink) = &message_sink {
                sink("RewriteDelegator", &message);
            }
        };
        let started = Instant::now();
        let total = failed.len();
        if total == 0 {
            return BatchRewriteResult::default();
        }

        info!(
            total,
            max_concurrent = self.pool.max_concurrent(),
            max_attempts = self.max_attempts,
            "starting parallel rewrite"
        );
        send(format!(
            "Starting parallel rewrite of {total} requirements with {} workers...",
            self.pool.max_concurrent()
        ));

        let progress: Option<ProgressCallback> = message_sink.clone().map(|sink| {
            let callback: ProgressCallback = Arc::new(move |done, total, _worker, _msg| {
                if done % PROGRESS_EVERY == 0 || done == total {
                    sink(
                        "RewriteDelegator",
                        &format!("Progress: {done}/{total} rewritten..."),
                    );
                }
            });
            callback
        });

        // The worker closure needs 'static futures, so each task captures a
        // cheap handle bundle rather than &self.
        let this = Arc::new(self.clone_handles());
        let task_sink = message_sink.clone();
        let outcomes = self
            .pool
            .run(
                failed.clone(),
                move |_idx, item: FailedRequirement| {
                    let this = Arc::clone(&this);
                    let sink = task_sink.clone();
                    async move {
                        Ok::<RewriteResult, AppError>(this.rewrite_requirement(item, sink).await)
                    }
                },
                progress,
            )
            .await;

        let mut results = Vec::with_capacity(total);
        let mut rewritten = 0_usize;
        let mut improved = 0_usize;
        let mut unchanged = 0_usize;
        let mut error_count = 0_usize;

        for (index, outcome) in outcomes.into_iter().enumerate() {
            let result = match outcome {
                TaskOutcome::Ok(result) => result,
                other => {
                    let item = failed.get(index);
                    RewriteResult {
                        req_id: item.map(|i| i.req_id.clone()).unwrap_or_default(),
                        original_text: item.map(|i| i.text.clone()).unwrap_or_default(),
                        rewritten_text: item.map(|i| i.text.clone()).unwrap_or_default(),
                        improvement_summary: other
                            .error_message()
                            .map(|e| format!("Error: {e}"))
                            .unwrap_or_default(),
                        addressed_criteria: Vec::new(),
                        attempt: 1,
                        tag: item.and_then(|i| i.tag.clone()),
                        error: other.error_message(),
                        processing_time_ms: 0,
                        new_score: None,
                        new_evaluation: None,
                    }
                }
            };

            if result.error.is_some() {
                error_count = error_count.saturating_add(1);
            } else if result.rewritten_text != result.original_text {
                rewritten = rewritten.saturating_add(1);
                if result.new_score.is_some_and(|s| s >= self.target_score) {
                    improved = improved.saturating_add(1);
                }
            } else {
                unchanged = unchanged.saturating_add(1);
            }
            results.push(result);
        }

        let total_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            total_time_ms,
            rewritten, improved, unchanged, error_count, "parallel rewrite completed"
        );
        send(format!(
            "Parallel rewrite complete in {:.1}s: {rewritten} rewritten, {improved} improved to score >= {}",
            total_time_ms as f64 / 1000.0,
            self.target_score
        ));

        BatchRewriteResult {
            total,
            rewritten,
            improved,
            unchanged,
            error_count,
            results,
            total_time_ms,
            avg_time_per_item_ms: total_time_ms / (total as u64),
        }
    }

    /// Cheap clone of the handles a pooled task needs.
    fn clone_handles(&self) -> Self {
        Self {
            chat: Arc::clone(&self.chat),
            scorer: Arc::clone(&self.scorer),
            cache: self.cache.clone(),
            pool: self.pool.clone(),
            validation_semaphore: Arc::clone(&self.validation_semaphore),
            max_attempts: self.max_attempts,
            target_score: self.target_score,
            enable_revalidation: self.enable_revalidation,
            model_name: self.model_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::EvaluationOutcome;
    use async_trait::async_trait;
    use common::llm::ChatOutcome;
    use common::storage::db::SurrealDbClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct ScriptedChat {
        replies: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatClient for ScriptedChat {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatOutcome, AppError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .get(index.min(self.replies.len().saturating_sub(1)))
                .cloned()
                .unwrap_or_default();
            Ok(ChatOutcome::Text(reply))
        }
    }

    struct ScriptedScorer {
        scores: Vec<f32>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequirementScorer for ScriptedScorer {
        async fn score(
            &self,
            _text: &str,
            _criteria_keys: Option<&[String]>,
            threshold: f32,
        ) -> Result<EvaluationOutcome, AppError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            let score = self
                .scores
                .get(index.min(self.scores.len().saturating_sub(1)))
                .copied()
                .unwrap_or(0.0);
            Ok(EvaluationOutcome {
                score,
                verdict: if score >= threshold { "pass" } else { "fail" }.to_string(),
                evaluation: vec![CriterionEvaluation {
                    criterion: "measurability".to_string(),
                    score,
                    passed: score >= threshold,
                    feedback: "scripted".to_string(),
                }],
                model: "mock".to_string(),
                latency_ms: 1,
                cached: false,
            })
        }
    }

    async fn delegator(
        replies: Vec<&str>,
        scores: Vec<f32>,
        max_attempts: u32,
    ) -> RewriteDelegator {
        let db = Arc::new(
            SurrealDbClient::memory("rewrite_ns", &Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        RewriteDelegator::new(
            Arc::new(ScriptedChat {
                replies: replies.into_iter().map(str::to_string).collect(),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(ScriptedScorer {
                scores,
                calls: AtomicUsize::new(0),
            }),
            ArtifactCache::new(db),
            3,
            Duration::from_secs(30),
            max_attempts,
            0.7,
            true,
            "stub-model".to_string(),
        )
    }

    fn failing_requirement() -> FailedRequirement {
        FailedRequirement {
            req_id: "REQ-001".to_string(),
            text: "The system must be fast".to_string(),
            score: 0.4,
            evaluation: vec![CriterionEvaluation {
                criterion: "measurability".to_string(),
                score: 0.3,
                passed: false,
                feedback: "no metrics".to_string(),
            }],
            tag: Some("performance".to_string()),
        }
    }

    #[tokio::test]
    async fn test_single_attempt_reaches_target() {
        let delegator = delegator(
            vec!["The system shall respond within 200ms (p95)."],
            vec![0.85],
            3,
        )
        .await;

        let batch = delegator.rewrite_batch(vec![failing_requirement()], None).await;
        assert_eq!(batch.rewritten, 1);
        assert_eq!(batch.improved, 1);

        let result = batch.results.first().expect("result");
        assert_eq!(result.attempt, 1);
        assert_eq!(result.new_score, Some(0.85));
        assert_eq!(result.addressed_criteria, vec!["measurability".to_string()]);
        assert_eq!(result.rewritten_text, "The system shall respond within 200ms (p95).");
    }

    #[tokio::test]
    async fn test_retries_until_target() {
        let delegator = delegator(
            vec![
                "The system shall respond fast.",
                "The system shall respond within 150ms (p95).",
            ],
            vec![0.5, 0.9],
            3,
        )
        .await;

        let batch = delegator.rewrite_batch(vec![failing_requirement()], None).await;
        let result = batch.results.first().expect("result");
        assert_eq!(result.attempt, 2);
        assert_eq!(result.new_score, Some(0.9));
        assert!(result.improvement_summary.contains("2 attempt"));
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_best_attempt() {
        let delegator = delegator(
            vec!["rewrite v1", "rewrite v2", "rewrite v3"],
            vec![0.5, 0.65, 0.6],
            3,
        )
        .await;

        let batch = delegator.rewrite_batch(vec![failing_requirement()], None).await;
        let result = batch.results.first().expect("result");
        assert_eq!(result.attempt, 3);
        // Best attempt was the second one.
        assert_eq!(result.rewritten_text, "rewrite v2");
        assert_eq!(result.new_score, Some(0.65));
        assert!(result.improvement_summary.contains("Max attempts"));
        assert_eq!(batch.improved, 0);
        assert_eq!(batch.rewritten, 1);
    }

    #[tokio::test]
    async fn test_markdown_fences_are_stripped() {
        let delegator = delegator(
            vec!["```\nThe system shall sync within 5s.\n```"],
            vec![0.9],
            3,
        )
        .await;

        let batch = delegator.rewrite_batch(vec![failing_requirement()], None).await;
        let result = batch.results.first().expect("result");
        assert_eq!(result.rewritten_text, "The system shall sync within 5s.");
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let delegator = delegator(vec![], vec![], 3).await;
        let batch = delegator.rewrite_batch(Vec::new(), None).await;
        assert_eq!(batch.total, 0);
    }
}
