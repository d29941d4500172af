use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};
use uuid::Uuid;

stored_object!(RewrittenRequirement, "rewritten_requirement", {
    requirement_checksum: String,
    redefined_requirement: String,
    model: String
});

impl RewrittenRequirement {
    pub fn new(requirement_checksum: String, redefined_requirement: String, model: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            requirement_checksum,
            redefined_requirement,
            model,
        }
    }

    pub async fn latest_by_checksum(
        checksum: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<RewrittenRequirement>, AppError> {
        let mut response = db
            .query(format!(
                "SELECT * FROM {} WHERE requirement_checksum = $checksum \
                 ORDER BY created_at DESC LIMIT 1",
                Self::table_name()
            ))
            .bind(("checksum", checksum.to_owned()))
            .await?;
        let rows: Vec<RewrittenRequirement> = response.take(0)?;
        Ok(rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_by_checksum_orders_by_time() {
        let db = SurrealDbClient::memory("rewrite_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        let mut first = RewrittenRequirement::new("sum".into(), "v1".into(), "stub".into());
        first.created_at = Utc::now() - chrono::Duration::seconds(30);
        db.store_item(first).await.expect("store first");

        let second = RewrittenRequirement::new("sum".into(), "v2".into(), "stub".into());
        db.store_item(second.clone()).await.expect("store second");

        let latest = RewrittenRequirement::latest_by_checksum("sum", &db)
            .await
            .expect("query")
            .expect("row");
        assert_eq!(latest.redefined_requirement, "v2");
        assert_eq!(latest.id, second.id);
    }
}
