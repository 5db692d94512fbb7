//! Long-term memory engine: build, fuse, store, retrieve, forget.
//!
//! Facts are stored twice: embeddings in the vector collection
//! `unified_memory_v2`, metadata in a JSON inverted-index sidecar, and the
//! two are kept in agreement per chunk. Retrieval narrows candidates through
//! the index before touching the vector store.

mod builder;
mod chunk;
mod engine;
mod forgetting;
mod fusion;
mod index;
mod query;
mod storage;

pub use builder::{BuildContext, ExtractionStrategy, MemoryBuilder};
pub use chunk::{Confidence, Importance, MemoryChunk, MemoryType, semantic_hash};
pub use engine::{MemorySystem, ProcessReport};
pub use forgetting::{ForgettingEngine, ForgettingReport};
pub use fusion::FusionEngine;
pub use index::{IndexEntry, IndexQuery, MetadataIndex};
pub use query::{MemoryQueryPlanner, QueryPlan, Recency};
pub use storage::{MEMORY_COLLECTION, MemoryStorage};
