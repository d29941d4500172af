use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};
use uuid::Uuid;

stored_object!(Criterion, "criterion", {
    key: String,
    name: String,
    description: String,
    weight: f32,
    active: bool
});

/// The canonical quality rubric. Weights default to 1.0 and can be tuned
/// per deployment by updating the `criterion` table.
pub const DEFAULT_CRITERIA_KEYS: [&str; 10] = [
    "clarity",
    "testability",
    "measurability",
    "atomic",
    "concise",
    "unambiguous",
    "consistent_language",
    "follows_template",
    "design_independent",
    "purpose_independent",
];

impl Criterion {
    pub fn new(key: &str, name: &str, description: &str, weight: f32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            key: key.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            weight,
            active: true,
        }
    }

    /// Seeds the rubric with the default criteria. Existing rows win.
    pub async fn ensure_defaults(db: &SurrealDbClient) -> Result<(), AppError> {
        let existing = Self::load_active(db).await?;
        for key in DEFAULT_CRITERIA_KEYS {
            if existing.iter().any(|c| c.key == key) {
                continue;
            }
            db.store_item(Criterion::new(key, key, "", 1.0)).await?;
        }
        Ok(())
    }

    pub async fn load_active(db: &SurrealDbClient) -> Result<Vec<Criterion>, AppError> {
        let mut response = db
            .query(format!(
                "SELECT * FROM {} WHERE active = true",
                Self::table_name()
            ))
            .await?;
        let rows: Vec<Criterion> = response.take(0)?;
        Ok(rows)
    }

    /// Weight for a criterion key; unknown keys weigh 1.0.
    pub fn weight_for(criteria: &[Criterion], key: &str) -> f32 {
        criteria
            .iter()
            .find(|c| c.key == key)
            .map_or(1.0, |c| c.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_defaults_seeds_once() {
        let db = SurrealDbClient::memory("criterion_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        Criterion::ensure_defaults(&db).await.expect("first seed");
        Criterion::ensure_defaults(&db).await.expect("second seed");

        let active = Criterion::load_active(&db).await.expect("load");
        assert_eq!(active.len(), DEFAULT_CRITERIA_KEYS.len());
    }

    #[tokio::test]
    async fn test_weight_for_defaults_to_one() {
        let criteria = vec![Criterion::new("clarity", "clarity", "", 2.0)];
        assert!((Criterion::weight_for(&criteria, "clarity") - 2.0).abs() < f32::EPSILON);
        assert!((Criterion::weight_for(&criteria, "missing") - 1.0).abs() < f32::EPSILON);
    }
}
