//! Memory Module
//!
//! Tiered semantic memory (short, medium and long term) over a single
//! vector index, plus the embedding providers used to turn text into
//! vectors.

mod embeddings;
mod tiered;

pub use embeddings::{EMBEDDING_DIMENSIONS, EmbeddingProvider, HashingEmbedder};
#[cfg(feature = "embeddings")]
pub use embeddings::FastEmbedProvider;
pub use tiered::{MemoryHit, MemoryStats, SweepReport, TieredMemory};
