use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::AppError, storage::db::SurrealDbClient};

pub const REQUIREMENTS_COLLECTION: &str = "requirements_v2";
pub const KG_NODES_COLLECTION: &str = "kg_nodes_v1";
pub const KG_EDGES_COLLECTION: &str = "kg_edges_v1";
pub const TRACE_COLLECTION: &str = "arch_trace";

/// A record living in a vector collection. `embedding` is optional so the
/// same store can hold non-embedded records (e.g. graph edges).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub embedding: Option<Vec<f32>>,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

/// Equality filter over payload fields.
pub type PayloadFilter = BTreeMap<String, Value>;

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, collection: &str, dimension: usize)
        -> Result<(), AppError>;

    async fn upsert(
        &self,
        collection: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize, AppError>;

    async fn search(
        &self,
        collection: &str,
        query: Vec<f32>,
        top_k: usize,
        filter: Option<PayloadFilter>,
    ) -> Result<Vec<VectorHit>, AppError>;

    async fn fetch_by_filter(
        &self,
        collection: &str,
        filter: PayloadFilter,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, AppError>;
}

/// SurrealDB-backed vector store: one schemaless table per collection with an
/// HNSW index over `embedding`.
#[derive(Clone)]
pub struct SurrealVectorStore {
    db: Arc<SurrealDbClient>,
}

impl SurrealVectorStore {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    /// Collection and field names are interpolated into queries, so restrict
    /// them to identifier characters.
    fn sanitize(name: &str) -> Result<String, AppError> {
        if !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            Ok(name.to_string())
        } else {
            Err(AppError::Validation(format!(
                "invalid collection or field name: {name}"
            )))
        }
    }

    fn filter_clauses(
        filter: &PayloadFilter,
        prefix: &str,
    ) -> Result<(String, Vec<(String, Value)>), AppError> {
        let mut clauses = String::new();
        let mut binds = Vec::with_capacity(filter.len());
        for (i, (field, value)) in filter.iter().enumerate() {
            let field = Self::sanitize(field)?;
            let bind_name = format!("f{i}");
            clauses.push_str(&format!(" {prefix} payload.{field} = ${bind_name}"));
            binds.push((bind_name, value.clone()));
        }
        Ok((clauses, binds))
    }
}

const UPSERT_BATCH_SIZE: usize = 64;
const HNSW_EF_SEARCH: usize = 100;

#[async_trait]
impl VectorStore for SurrealVectorStore {
    async fn ensure_collection(
        &self,
        collection: &str,
        dimension: usize,
    ) -> Result<(), AppError> {
        let collection = Self::sanitize(collection)?;
        self.db
            .client
            .query(format!("DEFINE TABLE IF NOT EXISTS {collection} SCHEMALESS;"))
            .await?
            .check()?;
        self.db
            .client
            .query(format!(
                "DEFINE INDEX OVERWRITE idx_embedding_{collection} ON TABLE {collection} \
                 FIELDS embedding HNSW DIMENSION {dimension};"
            ))
            .await?
            .check()?;
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize, AppError> {
        let collection = Self::sanitize(collection)?;
        let total = records.len();

        // Batches are atomic: either every record of a sub-batch lands or none.
        for batch in records.chunks(UPSERT_BATCH_SIZE) {
            let mut query = self.db.client.query("BEGIN TRANSACTION;");
            for (i, record) in batch.iter().enumerate() {
                query = query
                    .query(format!(
                        "UPSERT type::thing('{collection}', $id_{i}) CONTENT $record_{i};"
                    ))
                    .bind((format!("id_{i}"), record.id.clone()))
                    .bind((format!("record_{i}"), record.clone()));
            }
            let response = query.query("COMMIT TRANSACTION;").await?;
            response.check()?;
        }

        Ok(total)
    }

    async fn search(
        &self,
        collection: &str,
        query: Vec<f32>,
        top_k: usize,
        filter: Option<PayloadFilter>,
    ) -> Result<Vec<VectorHit>, AppError> {
        let collection = Self::sanitize(collection)?;
        let take = top_k.max(1);

        let (clauses, binds) = match &filter {
            Some(filter) => Self::filter_clauses(filter, "AND")?,
            None => (String::new(), Vec::new()),
        };

        let sql = format!(
            "SELECT meta::id(id) AS id, payload, \
             vector::similarity::cosine(embedding, $embedding) AS score \
             FROM {collection} \
             WHERE embedding <|{take},{HNSW_EF_SEARCH}|> $embedding{clauses} \
             ORDER BY score DESC LIMIT {take};"
        );

        let mut request = self.db.query(sql).bind(("embedding", query));
        for (name, value) in binds {
            request = request.bind((name, value));
        }

        let mut response = request.await?;
        let hits: Vec<VectorHit> = response.take(0).unwrap_or_default();
        Ok(hits)
    }

    async fn fetch_by_filter(
        &self,
        collection: &str,
        filter: PayloadFilter,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, AppError> {
        let collection = Self::sanitize(collection)?;
        let (clauses, binds) = Self::filter_clauses(&filter, "AND")?;
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE true{clauses}")
        };

        let sql = format!(
            "SELECT meta::id(id) AS id, embedding, payload FROM {collection}{where_clause} \
             LIMIT {limit};",
            limit = limit.max(1)
        );

        let mut request = self.db.query(sql);
        for (name, value) in binds {
            request = request.bind((name, value));
        }

        let mut response = request.await?;
        let records: Vec<VectorRecord> = response.take(0).unwrap_or_default();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    async fn store() -> SurrealVectorStore {
        let db = SurrealDbClient::memory("vector_ns", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        SurrealVectorStore::new(Arc::new(db))
    }

    fn record(id: &str, embedding: Vec<f32>, payload: Value) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            embedding: Some(embedding),
            payload,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_search_orders_by_similarity() {
        let store = store().await;
        store
            .ensure_collection("kg_nodes_v1", 3)
            .await
            .expect("ensure collection");

        store
            .upsert(
                "kg_nodes_v1",
                vec![
                    record("a", vec![1.0, 0.0, 0.0], json!({"name": "alpha"})),
                    record("b", vec![0.0, 1.0, 0.0], json!({"name": "beta"})),
                ],
            )
            .await
            .expect("upsert");

        let hits = store
            .search("kg_nodes_v1", vec![0.0, 1.0, 0.0], 2, None)
            .await
            .expect("search");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits.first().map(|h| h.id.as_str()), Some("b"));
    }

    #[tokio::test]
    async fn test_search_honors_payload_filter() {
        let store = store().await;
        store
            .ensure_collection("kg_nodes_v1", 3)
            .await
            .expect("ensure collection");

        store
            .upsert(
                "kg_nodes_v1",
                vec![
                    record("tag", vec![1.0, 0.0, 0.0], json!({"type": "Tag"})),
                    record("req", vec![1.0, 0.0, 0.0], json!({"type": "Requirement"})),
                ],
            )
            .await
            .expect("upsert");

        let mut filter = PayloadFilter::new();
        filter.insert("type".into(), json!("Tag"));
        let hits = store
            .search("kg_nodes_v1", vec![1.0, 0.0, 0.0], 5, Some(filter))
            .await
            .expect("search");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits.first().map(|h| h.id.as_str()), Some("tag"));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_per_id() {
        let store = store().await;
        store
            .ensure_collection("kg_edges_v1", 3)
            .await
            .expect("ensure collection");

        let first = record("e1", vec![1.0, 0.0, 0.0], json!({"rel": "HAS_TAG"}));
        let second = record("e1", vec![1.0, 0.0, 0.0], json!({"rel": "HAS_ACTOR"}));
        store
            .upsert("kg_edges_v1", vec![first])
            .await
            .expect("first upsert");
        store
            .upsert("kg_edges_v1", vec![second])
            .await
            .expect("second upsert");

        let records = store
            .fetch_by_filter("kg_edges_v1", PayloadFilter::new(), 10)
            .await
            .expect("fetch");
        assert_eq!(records.len(), 1);
        assert_eq!(
            records.first().and_then(|r| r.payload.get("rel")),
            Some(&json!("HAS_ACTOR"))
        );
    }

    #[tokio::test]
    async fn test_invalid_collection_name_rejected() {
        let store = store().await;
        let result = store.ensure_collection("bad name;", 3).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
