//! Near-duplicate fusion over freshly built chunks.
//!
//! Chunks whose embeddings land within the similarity threshold inside the
//! dedup window collapse into one: the survivor keeps the highest confidence
//! and the summed access counts.

use chrono::Duration;
use tracing::debug;

use fennec_config::MemoryConfig;
use fennec_llm::cosine_similarity;

use crate::chunk::MemoryChunk;

pub struct FusionEngine {
    similarity_threshold: f64,
    window: Duration,
}

impl FusionEngine {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            similarity_threshold: config.fusion_similarity_threshold,
            window: Duration::hours(config.deduplication_window_hours as i64),
        }
    }

    /// Collapse duplicates inside `fresh`, then against `existing` (already
    /// stored chunks from the same window). Chunks absorbed into an existing
    /// one are dropped entirely; the stored row already covers them.
    pub fn fuse(&self, fresh: Vec<MemoryChunk>, existing: &[MemoryChunk]) -> Vec<MemoryChunk> {
        let mut result: Vec<MemoryChunk> = Vec::with_capacity(fresh.len());

        'next_chunk: for chunk in fresh {
            // Identical fact already stored: idempotent no-op.
            if existing
                .iter()
                .any(|stored| stored.semantic_hash == chunk.semantic_hash)
            {
                debug!(memory_id = %chunk.memory_id, "chunk identical to stored fact, skipping");
                continue;
            }

            for stored in existing {
                if self.is_duplicate(&chunk, stored) {
                    debug!(
                        memory_id = %chunk.memory_id,
                        duplicate_of = %stored.memory_id,
                        "chunk fused into stored memory"
                    );
                    continue 'next_chunk;
                }
            }

            // Within the fresh batch the earlier chunk absorbs the later one.
            if let Some(survivor) = result.iter_mut().find(|kept| self.is_duplicate(&chunk, kept))
            {
                survivor.confidence = survivor.confidence.max(chunk.confidence);
                survivor.importance = survivor.importance.max(chunk.importance);
                survivor.access_count += chunk.access_count;
                for keyword in chunk.keywords {
                    if !survivor.keywords.contains(&keyword) {
                        survivor.keywords.push(keyword);
                    }
                }
                continue;
            }

            result.push(chunk);
        }

        result
    }

    fn is_duplicate(&self, a: &MemoryChunk, b: &MemoryChunk) -> bool {
        if a.semantic_hash == b.semantic_hash {
            return true;
        }
        if (a.created_at - b.created_at).abs() > self.window {
            return false;
        }
        if a.embedding.is_empty() || b.embedding.is_empty() {
            return false;
        }
        f64::from(cosine_similarity(&a.embedding, &b.embedding)) >= self.similarity_threshold
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::chunk::{Confidence, MemoryType};

    fn chunk(object: &str, embedding: Vec<f32>) -> MemoryChunk {
        let mut chunk = MemoryChunk::new(
            "u1",
            "u1",
            "likes",
            object,
            MemoryType::Preference,
            Utc::now(),
        );
        chunk.embedding = embedding;
        chunk
    }

    fn engine() -> FusionEngine {
        FusionEngine::new(&MemoryConfig::default())
    }

    #[test]
    fn near_duplicates_in_batch_are_merged() {
        let a = chunk("火锅", vec![1.0, 0.0]);
        let mut b = chunk("麻辣火锅", vec![0.99, 0.01]);
        b.confidence = Confidence::Verified;
        b.access_count = 2;

        let fused = engine().fuse(vec![a, b], &[]);
        assert_eq!(fused.len(), 1);
        // Survivor keeps max confidence and summed access counts.
        assert_eq!(fused[0].confidence, Confidence::Verified);
        assert_eq!(fused[0].access_count, 2);
    }

    #[test]
    fn dissimilar_chunks_stay_separate() {
        let a = chunk("火锅", vec![1.0, 0.0]);
        let b = chunk("滑雪", vec![0.0, 1.0]);
        let fused = engine().fuse(vec![a, b], &[]);
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn chunk_identical_to_stored_is_dropped() {
        let stored = chunk("火锅", vec![1.0, 0.0]);
        let fresh = chunk("火锅", vec![1.0, 0.0]);
        let fused = engine().fuse(vec![fresh], &[stored]);
        assert!(fused.is_empty());
    }

    #[test]
    fn outside_window_is_not_a_duplicate() {
        let mut stored = chunk("火锅", vec![1.0, 0.0]);
        stored.created_at = Utc::now() - chrono::Duration::hours(48);
        // Different object so semantic hashes differ.
        let fresh = chunk("吃火锅", vec![1.0, 0.0]);

        let fused = engine().fuse(vec![fresh], &[stored]);
        assert_eq!(fused.len(), 1);
    }
}
