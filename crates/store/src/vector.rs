//! Vector database seam.
//!
//! The memory engine only ever talks to [`VectorStore`]; production wires a
//! real database behind it, tests use [`MemoryVectorStore`] which returns
//! deterministic rows from a brute-force cosine scan.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::StoreError;

/// One comparison in a `where` clause.
#[derive(Debug, Clone)]
pub enum FilterValue {
    Eq(Value),
    In(Vec<Value>),
}

impl FilterValue {
    fn matches(&self, actual: Option<&Value>) -> bool {
        match (self, actual) {
            (Self::Eq(expected), Some(actual)) => expected == actual,
            (Self::In(options), Some(actual)) => options.contains(actual),
            _ => false,
        }
    }
}

/// Conjunction of field comparisons: `{field: value}` and
/// `{field: {$in: [...]}}`.
#[derive(Debug, Clone, Default)]
pub struct WhereFilter {
    clauses: HashMap<String, FilterValue>,
}

impl WhereFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses
            .insert(field.into(), FilterValue::Eq(value.into()));
        self
    }

    pub fn any_of(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.clauses.insert(field.into(), FilterValue::In(values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, metadata: &serde_json::Map<String, Value>) -> bool {
        self.clauses
            .iter()
            .all(|(field, filter)| filter.matches(metadata.get(field)))
    }
}

/// A stored row: id + embedding + metadata + display document.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Map<String, Value>,
    pub document: String,
}

/// A query hit with its cosine similarity to the query embedding.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub record: VectorRecord,
    pub similarity: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), StoreError>;

    /// Nearest rows by cosine similarity, optionally restricted by `filter`.
    async fn query(
        &self,
        collection: &str,
        query_embedding: &[f32],
        n_results: usize,
        filter: Option<&WhereFilter>,
    ) -> Result<Vec<VectorMatch>, StoreError>;

    /// Fetch rows by id and/or filter without ranking.
    async fn get(
        &self,
        collection: &str,
        ids: Option<&[String]>,
        filter: Option<&WhereFilter>,
    ) -> Result<Vec<VectorRecord>, StoreError>;

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, StoreError>;

    async fn count(&self, collection: &str) -> Result<usize, StoreError>;
}

/// Brute-force in-memory implementation.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, HashMap<String, VectorRecord>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 { 0.0 } else { dot / (na * nb) }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn add(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let rows = collections.entry(collection.to_string()).or_default();
        for record in records {
            rows.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        query_embedding: &[f32],
        n_results: usize,
        filter: Option<&WhereFilter>,
    ) -> Result<Vec<VectorMatch>, StoreError> {
        let collections = self.collections.read().await;
        let Some(rows) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = rows
            .values()
            .filter(|record| filter.is_none_or(|f| f.matches(&record.metadata)))
            .map(|record| VectorMatch {
                similarity: cosine(query_embedding, &record.embedding),
                record: record.clone(),
            })
            .collect();

        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(n_results);
        Ok(matches)
    }

    async fn get(
        &self,
        collection: &str,
        ids: Option<&[String]>,
        filter: Option<&WhereFilter>,
    ) -> Result<Vec<VectorRecord>, StoreError> {
        let collections = self.collections.read().await;
        let Some(rows) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let out = rows
            .values()
            .filter(|record| ids.is_none_or(|ids| ids.contains(&record.id)))
            .filter(|record| filter.is_none_or(|f| f.matches(&record.metadata)))
            .cloned()
            .collect();
        Ok(out)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, StoreError> {
        let mut collections = self.collections.write().await;
        let Some(rows) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = rows.len();
        for id in ids {
            rows.remove(id);
        }
        Ok(before - rows.len())
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map_or(0, HashMap::len))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(id: &str, embedding: Vec<f32>, memory_type: &str) -> VectorRecord {
        let mut metadata = serde_json::Map::new();
        metadata.insert("memory_type".into(), json!(memory_type));
        VectorRecord {
            id: id.to_string(),
            embedding,
            metadata,
            document: format!("doc-{id}"),
        }
    }

    #[tokio::test]
    async fn query_ranks_by_similarity_and_respects_filters() {
        let store = MemoryVectorStore::new();
        store
            .add(
                "unified_memory_v2",
                vec![
                    record("a", vec![1.0, 0.0], "personal_fact"),
                    record("b", vec![0.9, 0.1], "event"),
                    record("c", vec![0.0, 1.0], "personal_fact"),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .query("unified_memory_v2", &[1.0, 0.0], 10, None)
            .await
            .unwrap();
        assert_eq!(hits[0].record.id, "a");
        assert_eq!(hits[1].record.id, "b");

        let filter = WhereFilter::new().eq("memory_type", "personal_fact");
        let hits = store
            .query("unified_memory_v2", &[1.0, 0.0], 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.record.metadata["memory_type"] == "personal_fact"));
    }

    #[tokio::test]
    async fn in_filter_restricts_to_candidate_ids() {
        let store = MemoryVectorStore::new();
        let mut with_id = |id: &str| {
            let mut r = record(id, vec![1.0, 0.0], "event");
            r.metadata.insert("memory_id".into(), json!(id));
            r
        };
        store
            .add("c", vec![with_id("a"), with_id("b"), with_id("x")])
            .await
            .unwrap();

        let filter = WhereFilter::new().any_of("memory_id", vec![json!("a"), json!("b")]);
        let hits = store.query("c", &[1.0, 0.0], 10, Some(&filter)).await.unwrap();
        let mut ids: Vec<_> = hits.iter().map(|h| h.record.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn delete_and_count() {
        let store = MemoryVectorStore::new();
        store
            .add("c", vec![record("a", vec![1.0], "event"), record("b", vec![1.0], "event")])
            .await
            .unwrap();
        assert_eq!(store.count("c").await.unwrap(), 2);
        assert_eq!(store.delete("c", &["a".to_string()]).await.unwrap(), 1);
        assert_eq!(store.count("c").await.unwrap(), 1);
        assert_eq!(store.count("missing").await.unwrap(), 0);
    }
}
