//! Embedding providers for memory writes and recall.
//!
//! The store only requires `embed(text) -> vector` with a fixed dimension.
//! Two providers ship with the SDK:
//!
//! - [`HashingEmbedder`]: deterministic feature hashing over word tokens, no
//!   model download, suitable for tests and air-gapped hosts
//! - [`FastEmbedProvider`] (feature `embeddings`): local all-MiniLM-L6-v2
//!   inference through `fastembed`, 384 dimensions
//!
//! ```ignore
//! use aatis_sdk::memory::{EmbeddingProvider, HashingEmbedder};
//!
//! let embedder = HashingEmbedder::new(384);
//! let vector = embedder.embed("nmap -sV 10.0.0.5").await?;
//! ```

use async_trait::async_trait;

use crate::SDKResult;
use crate::utils::hash_bucket;

/// Embedding dimensions for all-MiniLM-L6-v2
pub const EMBEDDING_DIMENSIONS: usize = 384;

/// Turns text into fixed-dimension vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Dimension of every vector this provider returns
    fn dimensions(&self) -> usize;

    /// Embed a single text
    async fn embed(&self, text: &str) -> SDKResult<Vec<f32>>;
}

/// Feature-hashing embedder.
///
/// Each lowercase alphanumeric token adds ±1 to one bucket chosen by its
/// SHA-256 digest; the vector is L2-normalised. Texts sharing tokens get a
/// positive cosine similarity.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    /// Synchronous embedding, same output as [`EmbeddingProvider::embed`]
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return vector;
        }

        for token in tokens(text) {
            let (bucket, sign) = hash_bucket(&token, self.dimensions);
            vector[bucket] += sign;
        }

        aatis_core::vector::normalize(&vector)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIMENSIONS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> SDKResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Local embedding model loaded lazily on first use
#[cfg(feature = "embeddings")]
pub struct FastEmbedProvider {
    model: std::sync::Arc<tokio::sync::RwLock<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "embeddings")]
impl Default for FastEmbedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "embeddings")]
impl FastEmbedProvider {
    pub fn new() -> Self {
        Self {
            model: std::sync::Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    async fn ensure_model(&self) -> SDKResult<()> {
        use crate::SDKError;
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let model_guard = self.model.read().await;
        if model_guard.is_some() {
            return Ok(());
        }
        drop(model_guard);

        let mut model_guard = self.model.write().await;
        if model_guard.is_some() {
            return Ok(());
        }

        tracing::info!("Loading embedding model: all-MiniLM-L6-v2");
        let start = std::time::Instant::now();

        let mut init_options = InitOptions::default();
        init_options.model_name = EmbeddingModel::AllMiniLML6V2;
        init_options.show_download_progress = false;

        let model = TextEmbedding::try_new(init_options)
            .map_err(|e| SDKError::memory(format!("Failed to load embedding model: {}", e)))?;

        tracing::info!("Embedding model loaded in {:?}", start.elapsed());

        *model_guard = Some(model);
        Ok(())
    }
}

#[cfg(feature = "embeddings")]
#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    fn dimensions(&self) -> usize {
        EMBEDDING_DIMENSIONS
    }

    async fn embed(&self, text: &str) -> SDKResult<Vec<f32>> {
        use crate::SDKError;

        self.ensure_model().await?;

        let model_guard = self.model.read().await;
        let model = model_guard
            .as_ref()
            .ok_or_else(|| SDKError::memory("Embedding model not initialized"))?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| SDKError::memory(format!("Failed to generate embedding: {}", e)))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| SDKError::memory("No embedding generated"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("Open port 22 on 10.0.0.5").await.unwrap();
        let b = embedder.embed("open PORT 22 on 10.0.0.5").await.unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
    }

    #[test]
    fn test_shared_tokens_are_similar() {
        let embedder = HashingEmbedder::new(256);
        let a = embedder.embed_sync("ssh open on host alpha");
        let b = embedder.embed_sync("ssh open on host beta");
        let c = embedder.embed_sync("quarterly revenue report");
        assert!(cosine(&a, &b) > cosine(&a, &c));
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        assert_eq!(embedder.embed_sync("  ...  "), vec![0.0; 8]);
    }
}
