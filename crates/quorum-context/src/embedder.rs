// Embedder Seam
// The vector producer is an external collaborator; the indexer only sees
// this trait. Failures are either retryable (transient backend trouble) or
// fatal (bad model, bad input).

use async_trait::async_trait;

use crate::error::{ContextError, ContextResult};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model id this embedder serves.
    fn model(&self) -> &str;

    /// Vector length produced for every input.
    fn dimensions(&self) -> usize;

    /// Embed one chunk of text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> ContextResult<Vec<f32>>;
}

/// Deterministic local fallback: hashes token n-grams into a fixed-size
/// vector. No semantic quality, but stable across runs and offline.
pub struct HashingEmbedder {
    model: String,
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            model: format!("hashing-{dimensions}"),
            dimensions,
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> ContextResult<Vec<f32>> {
        if self.dimensions == 0 {
            return Err(ContextError::Embedding {
                retryable: false,
                message: "embedder configured with zero dimensions".to_string(),
            });
        }
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let slot = (hash % self.dimensions as u64) as usize;
            vector[slot] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vectors_are_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(32);
        let a = embedder.embed("the quick brown fox").await.unwrap();
        let b = embedder.embed("the quick brown fox").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn different_text_embeds_differently() {
        let embedder = HashingEmbedder::new(32);
        let a = embedder.embed("alpha beta gamma").await.unwrap();
        let b = embedder.embed("delta epsilon zeta").await.unwrap();
        assert_ne!(a, b);
    }
}
