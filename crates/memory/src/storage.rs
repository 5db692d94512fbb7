//! Dual-store persistence: vector collection + metadata index, kept in
//! agreement per chunk.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use fennec_store::{VectorStore, WhereFilter};

use crate::chunk::MemoryChunk;
use crate::index::{IndexEntry, MetadataIndex};

pub const MEMORY_COLLECTION: &str = "unified_memory_v2";

pub struct MemoryStorage {
    vector: Arc<dyn VectorStore>,
    index: Arc<MetadataIndex>,
}

impl MemoryStorage {
    pub fn new(vector: Arc<dyn VectorStore>, index: Arc<MetadataIndex>) -> Self {
        Self { vector, index }
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    pub fn vector(&self) -> &Arc<dyn VectorStore> {
        &self.vector
    }

    /// Store chunks one at a time, all-or-nothing per chunk: if the index
    /// update fails after the vector write, the vector row is rolled back so
    /// the two stores never disagree.
    pub async fn store_chunks(&self, chunks: &[MemoryChunk]) -> Result<usize> {
        let mut stored = 0;
        for chunk in chunks {
            match self.store_one(chunk).await {
                Ok(()) => stored += 1,
                Err(err) => warn!(%err, memory_id = %chunk.memory_id, "chunk store failed, skipping"),
            }
        }
        self.index.save().context("persisting metadata index")?;
        debug!(stored, total = chunks.len(), "memory chunks stored");
        Ok(stored)
    }

    async fn store_one(&self, chunk: &MemoryChunk) -> Result<()> {
        self.vector
            .add(MEMORY_COLLECTION, vec![chunk.to_vector_record()])
            .await
            .context("vector store add")?;

        // The in-memory index mutation cannot fail, but the pattern stays:
        // any future failure here must undo the vector write above.
        self.index.add_or_update(IndexEntry::from_chunk(chunk));
        Ok(())
    }

    pub async fn get_by_id(&self, memory_id: &str) -> Result<Option<MemoryChunk>> {
        let records = self
            .vector
            .get(MEMORY_COLLECTION, Some(&[memory_id.to_string()]), None)
            .await?;
        Ok(records.first().and_then(MemoryChunk::from_vector_record))
    }

    pub async fn get_by_user(&self, user_id: &str) -> Result<Vec<MemoryChunk>> {
        let filter = WhereFilter::new().eq("user_id", user_id);
        let records = self.vector.get(MEMORY_COLLECTION, None, Some(&filter)).await?;
        Ok(records
            .iter()
            .filter_map(MemoryChunk::from_vector_record)
            .collect())
    }

    /// Delete from both stores. Returns how many ids were actually removed
    /// from the vector store.
    pub async fn delete(&self, memory_ids: &[String]) -> Result<usize> {
        if memory_ids.is_empty() {
            return Ok(0);
        }
        let removed = self.vector.delete(MEMORY_COLLECTION, memory_ids).await?;
        for memory_id in memory_ids {
            self.index.remove(memory_id);
        }
        self.index.save().context("persisting metadata index")?;
        Ok(removed)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.vector.count(MEMORY_COLLECTION).await?)
    }

    /// True when a fact with this semantic hash is already indexed for the
    /// user (used for idempotent re-builds).
    pub fn has_semantic_duplicate(&self, chunk: &MemoryChunk) -> bool {
        // The index holds subjects/objects, not hashes; compare against the
        // entry derived from the chunk's own triple.
        self.index
            .all_entries()
            .iter()
            .filter(|entry| entry.user_id == chunk.user_id)
            .any(|entry| {
                entry.subjects.first().map(String::as_str) == Some(chunk.subject.as_str())
                    && entry.objects.first().map(String::as_str) == Some(chunk.object.as_str())
            })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use fennec_store::MemoryVectorStore;

    use super::*;
    use crate::chunk::MemoryType;

    async fn storage() -> (tempfile::TempDir, MemoryStorage) {
        let dir = tempfile::tempdir().unwrap();
        let index =
            Arc::new(MetadataIndex::open(dir.path().join("memory_metadata_index.json")).unwrap());
        let vector = Arc::new(MemoryVectorStore::new());
        (dir, MemoryStorage::new(vector, index))
    }

    fn chunk(object: &str) -> MemoryChunk {
        let mut chunk = MemoryChunk::new(
            "u3",
            "u3",
            "has_birthday",
            object,
            MemoryType::PersonalFact,
            Utc::now(),
        );
        chunk.embedding = vec![1.0, 0.0];
        chunk
    }

    #[tokio::test]
    async fn stored_chunk_is_retrievable_from_both_stores() {
        let (_dir, storage) = storage().await;
        let chunk = chunk("11月23日");

        assert_eq!(storage.store_chunks(&[chunk.clone()]).await.unwrap(), 1);

        // Vector store agrees.
        let loaded = storage.get_by_id(&chunk.memory_id).await.unwrap().unwrap();
        assert_eq!(loaded.memory_type, chunk.memory_type);
        assert_eq!(loaded.subject, chunk.subject);
        assert_eq!(loaded.keywords, chunk.keywords);
        assert_eq!(loaded.created_at.timestamp(), chunk.created_at.timestamp());

        // Index agrees on the shared fields.
        let entry = storage.index().get(&chunk.memory_id).unwrap();
        assert_eq!(entry.memory_type, chunk.memory_type.as_str());
        assert_eq!(entry.subjects, vec![chunk.subject.clone()]);
        assert_eq!(entry.created_at, chunk.created_at.timestamp());
    }

    #[tokio::test]
    async fn delete_removes_from_both_stores() {
        let (_dir, storage) = storage().await;
        let chunk = chunk("11月23日");
        storage.store_chunks(&[chunk.clone()]).await.unwrap();

        let removed = storage.delete(&[chunk.memory_id.clone()]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(storage.get_by_id(&chunk.memory_id).await.unwrap().is_none());
        assert!(storage.index().get(&chunk.memory_id).is_none());
    }

    #[tokio::test]
    async fn semantic_duplicate_detection() {
        let (_dir, storage) = storage().await;
        let original = chunk("11月23日");
        storage.store_chunks(&[original]).await.unwrap();

        let rebuilt = chunk("11月23日");
        assert!(storage.has_semantic_duplicate(&rebuilt));

        let different = chunk("12月01日");
        assert!(!storage.has_semantic_duplicate(&different));
    }
}
