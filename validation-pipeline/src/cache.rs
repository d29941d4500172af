use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            evaluation::{CriterionEvaluation, Evaluation},
            rewritten_requirement::RewrittenRequirement,
        },
    },
};
use tracing::debug;

/// Cache scopes map onto the append-only artifact tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    Evaluation,
    Rewrite,
}

/// Read-through cache over persisted artifacts, keyed by the SHA-256 of the
/// normalized requirement title. Writes are idempotent appends; reads
/// resolve concurrent writers by latest timestamp.
#[derive(Clone)]
pub struct ArtifactCache {
    db: Arc<SurrealDbClient>,
}

impl ArtifactCache {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    pub async fn latest_evaluation(
        &self,
        checksum: &str,
    ) -> Result<Option<(Evaluation, Vec<CriterionEvaluation>)>, AppError> {
        let hit = Evaluation::latest_by_checksum(checksum, &self.db).await?;
        if hit.is_some() {
            debug!(checksum, scope = ?CacheScope::Evaluation, "artifact cache hit");
        }
        Ok(hit)
    }

    pub async fn put_evaluation(
        &self,
        evaluation: Evaluation,
        details: &[CriterionEvaluation],
    ) -> Result<(), AppError> {
        Evaluation::store_with_details(evaluation, details, &self.db).await
    }

    pub async fn latest_rewrite(
        &self,
        checksum: &str,
    ) -> Result<Option<RewrittenRequirement>, AppError> {
        let hit = RewrittenRequirement::latest_by_checksum(checksum, &self.db).await?;
        if hit.is_some() {
            debug!(checksum, scope = ?CacheScope::Rewrite, "artifact cache hit");
        }
        Ok(hit)
    }

    pub async fn put_rewrite(
        &self,
        checksum: &str,
        rewritten: &str,
        model: &str,
    ) -> Result<(), AppError> {
        let record = RewrittenRequirement::new(
            checksum.to_string(),
            rewritten.to_string(),
            model.to_string(),
        );
        self.db.store_item(record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_rewrite_roundtrip() {
        let db = Arc::new(
            SurrealDbClient::memory("cache_ns", &Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        let cache = ArtifactCache::new(db);

        assert!(cache.latest_rewrite("sum").await.expect("query").is_none());
        cache
            .put_rewrite("sum", "The system shall respond within 200ms.", "stub")
            .await
            .expect("put");
        let hit = cache.latest_rewrite("sum").await.expect("query").expect("hit");
        assert_eq!(hit.redefined_requirement, "The system shall respond within 200ms.");
    }
}
