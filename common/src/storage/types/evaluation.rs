use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};
use uuid::Uuid;

/// Wire shape of a single criterion verdict, shared by the evaluation
/// service, the rewrite feedback prompts and the HTTP surface.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct CriterionEvaluation {
    pub criterion: String,
    pub score: f32,
    pub passed: bool,
    pub feedback: String,
}

stored_object!(Evaluation, "evaluation", {
    requirement_checksum: String,
    model: String,
    latency_ms: u64,
    score: f32,
    verdict: String
});

mod detail {
    use crate::stored_object;

    stored_object!(EvaluationDetailRow, "evaluation_detail", {
        evaluation_id: String,
        criterion_key: String,
        score: f32,
        passed: bool,
        feedback: String
    });
}

pub use detail::EvaluationDetailRow;

impl Evaluation {
    pub fn new(
        requirement_checksum: String,
        model: String,
        latency_ms: u64,
        score: f32,
        verdict: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            requirement_checksum,
            model,
            latency_ms,
            score,
            verdict,
        }
    }

    /// Stores the aggregate row and its per-criterion detail rows in a single
    /// transaction so a partially written evaluation can never be observed.
    /// Rows are append-only; history is never rewritten.
    pub async fn store_with_details(
        evaluation: Evaluation,
        details: &[CriterionEvaluation],
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let evaluation_id = evaluation.id.clone();

        let mut query = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "CREATE type::thing('{table}', $eval_id) CONTENT $eval;",
                table = Self::table_name(),
            ))
            .bind(("eval_id", evaluation_id.clone()))
            .bind(("eval", evaluation));

        for (i, detail) in details.iter().enumerate() {
            let row = EvaluationDetailRow::new(evaluation_id.clone(), detail);
            query = query
                .query(format!(
                    "CREATE type::thing('{table}', $detail_id_{i}) CONTENT $detail_{i};",
                    table = EvaluationDetailRow::table_name(),
                ))
                .bind((format!("detail_id_{i}"), row.id.clone()))
                .bind((format!("detail_{i}"), row));
        }

        let response = query.query("COMMIT TRANSACTION;").await?;
        response.check()?;

        Ok(())
    }

    /// The newest evaluation for a checksum, with its criterion details.
    /// Older rows are history and stay untouched.
    pub async fn latest_by_checksum(
        checksum: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<(Evaluation, Vec<CriterionEvaluation>)>, AppError> {
        let mut response = db
            .query(format!(
                "SELECT * FROM {} WHERE requirement_checksum = $checksum \
                 ORDER BY created_at DESC LIMIT 1",
                Self::table_name()
            ))
            .bind(("checksum", checksum.to_owned()))
            .await?;
        let rows: Vec<Evaluation> = response.take(0)?;

        let Some(evaluation) = rows.into_iter().next() else {
            return Ok(None);
        };

        let mut detail_response = db
            .query(format!(
                "SELECT * FROM {} WHERE evaluation_id = $eval_id",
                EvaluationDetailRow::table_name()
            ))
            .bind(("eval_id", evaluation.id.clone()))
            .await?;
        let detail_rows: Vec<EvaluationDetailRow> = detail_response.take(0)?;

        let details = detail_rows
            .into_iter()
            .map(|row| CriterionEvaluation {
                criterion: row.criterion_key,
                score: row.score,
                passed: row.passed,
                feedback: row.feedback,
            })
            .collect();

        Ok(Some((evaluation, details)))
    }
}

impl EvaluationDetailRow {
    fn new(evaluation_id: String, detail: &CriterionEvaluation) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            evaluation_id,
            criterion_key: detail.criterion.clone(),
            score: detail.score,
            passed: detail.passed,
            feedback: detail.feedback.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_details() -> Vec<CriterionEvaluation> {
        vec![
            CriterionEvaluation {
                criterion: "clarity".into(),
                score: 0.9,
                passed: true,
                feedback: "clear enough".into(),
            },
            CriterionEvaluation {
                criterion: "measurability".into(),
                score: 0.4,
                passed: false,
                feedback: "no metrics".into(),
            },
        ]
    }

    #[tokio::test]
    async fn test_store_and_fetch_latest() {
        let db = SurrealDbClient::memory("eval_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let eval = Evaluation::new("abc".into(), "stub".into(), 12, 0.65, "fail".into());
        Evaluation::store_with_details(eval.clone(), &sample_details(), &db)
            .await
            .expect("store");

        let (latest, details) = Evaluation::latest_by_checksum("abc", &db)
            .await
            .expect("query")
            .expect("row");
        assert_eq!(latest.id, eval.id);
        assert_eq!(details.len(), 2);
        assert!(details.iter().any(|d| d.criterion == "measurability" && !d.passed));
    }

    #[tokio::test]
    async fn test_latest_wins_over_history() {
        let db = SurrealDbClient::memory("eval_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let mut old = Evaluation::new("abc".into(), "stub".into(), 10, 0.2, "fail".into());
        old.created_at = Utc::now() - chrono::Duration::seconds(60);
        Evaluation::store_with_details(old, &[], &db).await.expect("store old");

        let new = Evaluation::new("abc".into(), "stub".into(), 10, 0.9, "pass".into());
        let new_id = new.id.clone();
        Evaluation::store_with_details(new, &[], &db).await.expect("store new");

        let (latest, _) = Evaluation::latest_by_checksum("abc", &db)
            .await
            .expect("query")
            .expect("row");
        assert_eq!(latest.id, new_id);
        assert_eq!(latest.verdict, "pass");
    }

    #[tokio::test]
    async fn test_latest_missing_checksum_is_none() {
        let db = SurrealDbClient::memory("eval_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        let latest = Evaluation::latest_by_checksum("missing", &db)
            .await
            .expect("query");
        assert!(latest.is_none());
    }
}
