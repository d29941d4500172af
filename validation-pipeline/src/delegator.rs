use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_runtime::pool::{ProgressCallback, TaskOutcome, WorkerPool};
use common::{error::AppError, storage::types::evaluation::CriterionEvaluation};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{evaluation::RequirementScorer, AgentMessageSink};

const PROGRESS_EVERY: usize = 5;

/// One requirement queued for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationItem {
    pub req_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub req_id: String,
    pub title: String,
    pub score: f32,
    pub verdict: String,
    pub evaluation: Vec<CriterionEvaluation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub error_count: usize,
    pub results: Vec<ValidationResult>,
    pub total_time_ms: u64,
    pub avg_time_per_item_ms: u64,
}

/// Fans requirement scoring out over the worker pool. Failure on one item
/// yields `verdict = "error"` for that item only; siblings continue.
pub struct ValidationDelegator {
    scorer: Arc<dyn RequirementScorer>,
    pool: WorkerPool,
    threshold: f32,
}

impl ValidationDelegator {
    pub fn new(
        scorer: Arc<dyn RequirementScorer>,
        max_concurrent: usize,
        per_task_timeout: Duration,
        threshold: f32,
    ) -> Self {
        info!(max_concurrent, "validation delegator initialized");
        Self {
            scorer,
            pool: WorkerPool::new(max_concurrent, per_task_timeout),
            threshold,
        }
    }

    pub async fn validate(
        &self,
        requirements: Vec<ValidationItem>,
        criteria_keys: Option<Vec<String>>,
        threshold: Option<f32>,
        message_sink: Option<AgentMessageSink>,
    ) -> BatchResult {
        let send = |message: String| {
            if let Some(sink) = &message_sink {
                sink("ValidationDelegator", &message);
            }
        };
        let started = Instant::now();
        let total = requirements.len();
        if total == 0 {
            return BatchResult::default();
        }

        let threshold = threshold.unwrap_or(self.threshold);
        info!(
            total,
            max_concurrent = self.pool.max_concurrent(),
            "starting parallel validation"
        );
        send(format!(
            "Starting parallel validation of {total} requirements with {} workers...",
            self.pool.max_concurrent()
        ));

        let progress: Option<ProgressCallback> = message_sink.clone().map(|sink| {
            let callback: ProgressCallback = Arc::new(move |done, total, _worker, _msg| {
                if done % PROGRESS_EVERY == 0 || done == total {
                    sink(
                        "ValidationDelegator",
                        &format!("Progress: {done}/{total} validated..."),
                    );
                }
            });
            callback
        });

        let scorer = Arc::clone(&self.scorer);
        let criteria_keys = Arc::new(criteria_keys);
        let outcomes = self
            .pool
            .run(
                requirements.clone(),
                move |_idx, item: ValidationItem| {
                    let scorer = Arc::clone(&scorer);
                    let criteria_keys = Arc::clone(&criteria_keys);
                    async move {
                        let item_started = Instant::now();
                        let outcome = scorer
                            .score(&item.text, criteria_keys.as_deref(), threshold)
                            .await?;
                        Ok::<ValidationResult, AppError>(ValidationResult {
                            req_id: item.req_id,
                            title: item.text,
                            score: outcome.score,
                            verdict: outcome.verdict,
                            evaluation: outcome.evaluation,
                            tag: item.tag,
                            error: None,
                            worker_id: None,
                            processing_time_ms: u64::try_from(
                                item_started.elapsed().as_millis(),
                            )
                            .unwrap_or(u64::MAX),
                        })
                    }
                },
                progress,
            )
            .await;

        let mut results = Vec::with_capacity(total);
        let mut passed = 0_usize;
        let mut failed = 0_usize;
        let mut error_count = 0_usize;

        for (index, outcome) in outcomes.into_iter().enumerate() {
            let item = requirements.get(index);
            match outcome {
                TaskOutcome::Ok(result) => {
                    match result.verdict.as_str() {
                        "pass" => passed = passed.saturating_add(1),
                        "error" => error_count = error_count.saturating_add(1),
                        _ => failed = failed.saturating_add(1),
                    }
                    results.push(result);
                }
                other => {
                    error_count = error_count.saturating_add(1);
                    results.push(ValidationResult {
                        req_id: item.map(|i| i.req_id.clone()).unwrap_or_default(),
                        title: item.map(|i| i.text.clone()).unwrap_or_default(),
                        score: 0.0,
                        verdict: "error".to_string(),
                        evaluation: Vec::new(),
                        tag: item.and_then(|i| i.tag.clone()),
                        error: other.error_message(),
                        worker_id: None,
                        processing_time_ms: 0,
                    });
                }
            }
        }

        let total_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let avg_time_per_item_ms = total_time_ms / (total as u64);
        info!(
            total_time_ms,
            passed, failed, error_count, "parallel validation completed"
        );
        send(format!(
            "Parallel validation complete in {:.1}s: {passed} passed, {failed} failed, {error_count} errors",
            total_time_ms as f64 / 1000.0
        ));

        BatchResult {
            total,
            passed,
            failed,
            error_count,
            results,
            total_time_ms,
            avg_time_per_item_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::EvaluationOutcome;
    use async_trait::async_trait;

    /// Mock scorer sleeping a fixed time, passing iff the text has a digit.
    struct SleepyScorer {
        delay: Duration,
    }

    #[async_trait]
    impl RequirementScorer for SleepyScorer {
        async fn score(
            &self,
            text: &str,
            _criteria_keys: Option<&[String]>,
            threshold: f32,
        ) -> Result<EvaluationOutcome, AppError> {
            tokio::time::sleep(self.delay).await;
            if text.contains("boom") {
                return Err(AppError::Processing("scoring exploded".into()));
            }
            let score = if text.chars().any(|c| c.is_ascii_digit()) {
                0.9
            } else {
                0.4
            };
            Ok(EvaluationOutcome {
                score,
                verdict: if score >= threshold { "pass" } else { "fail" }.to_string(),
                evaluation: Vec::new(),
                model: "mock".to_string(),
                latency_ms: 1,
                cached: false,
            })
        }
    }

    fn items(n: usize) -> Vec<ValidationItem> {
        (0..n)
            .map(|i| ValidationItem {
                req_id: format!("REQ-{i:03}"),
                text: format!("The system shall handle load profile {i} within 200 ms"),
                tag: Some("performance".to_string()),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_parallel_validation_speedup() {
        let delegator = ValidationDelegator::new(
            Arc::new(SleepyScorer {
                delay: Duration::from_millis(300),
            }),
            5,
            Duration::from_secs(10),
            0.7,
        );

        let started = Instant::now();
        let batch = delegator.validate(items(20), None, None, None).await;
        let elapsed = started.elapsed();

        assert_eq!(batch.total, 20);
        assert_eq!(batch.passed + batch.failed + batch.error_count, 20);
        // 20 * 300ms serial; demand at least a 3x speedup.
        assert!(
            elapsed < Duration::from_millis(20 * 300 / 3),
            "expected >= 3x speedup, took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_error_isolation_per_item() {
        let delegator = ValidationDelegator::new(
            Arc::new(SleepyScorer {
                delay: Duration::from_millis(1),
            }),
            3,
            Duration::from_secs(5),
            0.7,
        );

        let mut batch_items = items(3);
        if let Some(item) = batch_items.get_mut(1) {
            item.text = "boom".to_string();
        }
        let batch = delegator.validate(batch_items, None, None, None).await;

        assert_eq!(batch.total, 3);
        assert_eq!(batch.error_count, 1);
        let errored = batch.results.get(1).expect("second result");
        assert_eq!(errored.verdict, "error");
        assert!(errored.error.as_deref().is_some_and(|e| e.contains("exploded")));
        // Results keep input order.
        assert_eq!(batch.results.first().map(|r| r.req_id.as_str()), Some("REQ-000"));
    }

    #[tokio::test]
    async fn test_timeouts_surface_as_item_errors() {
        let delegator = ValidationDelegator::new(
            Arc::new(SleepyScorer {
                delay: Duration::from_millis(200),
            }),
            2,
            Duration::from_millis(20),
            0.7,
        );

        let batch = delegator.validate(items(2), None, None, None).await;
        assert_eq!(batch.error_count, 2);
        assert!(batch
            .results
            .iter()
            .all(|r| r.error.as_deref().is_some_and(|e| e.contains("Timeout"))));
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let delegator = ValidationDelegator::new(
            Arc::new(SleepyScorer {
                delay: Duration::from_millis(1),
            }),
            2,
            Duration::from_secs(1),
            0.7,
        );
        let batch = delegator.validate(Vec::new(), None, None, None).await;
        assert_eq!(batch.total, 0);
        assert!(batch.results.is_empty());
    }
}
