/// Mock embedder for tests and offline runs.
///
/// Signed feature hashing over lowercase word tokens: texts sharing
/// vocabulary land close together, identical texts embed identically.
/// Buckets come from blake3, so vectors are stable across toolchains and a
/// persisted store stays searchable after an upgrade.
use super::{Embedder, EmbedderError};

pub struct MockEmbedder {
    pub dimensions: usize,
    model: String,
}

impl MockEmbedder {
    /// Create a new `MockEmbedder` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            model: format!("mock-hash-{dimensions}"),
        }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = blake3::hash(token.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        let hash = u64::from_le_bytes(prefix);
        let index = (hash % self.dimensions as u64) as usize;
        let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl Embedder for MockEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        if self.dimensions == 0 {
            return Err(EmbedderError::InferenceFailed("zero dimensions".into()));
        }

        let mut embedding = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let (index, sign) = self.bucket(&token.to_lowercase());
            embedding[index] += sign;
        }

        // Text without tokens still needs a usable direction.
        if embedding.iter().all(|v| *v == 0.0) {
            embedding[0] = 1.0;
        }

        // L2 normalize
        let norm_sq: f32 = embedding.iter().map(|v| v * v).sum();
        if norm_sq > 0.0 {
            let inv = 1.0 / norm_sq.sqrt();
            for v in &mut embedding {
                *v *= inv;
            }
        }

        Ok(embedding)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
