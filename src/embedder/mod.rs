/// Embedder trait and shared types for text embedding.
pub mod http;
pub mod mock;
pub mod service;

use thiserror::Error;

pub use service::{EmbedStats, EmbeddingService, PartialEmbedding};

/// Errors that can occur during embedding operations.
#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedding service unavailable: {0}")]
    Transient(String),

    #[error("embedding service rate limited")]
    RateLimited,

    #[error("embedding service rejected credentials: {0}")]
    Authentication(String),

    #[error("embedding quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("embedding failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<EmbedderError>,
    },
}

impl EmbedderError {
    /// Network and rate-limit failures are retried; everything else is fatal
    /// to the current run.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited)
    }
}

/// Trait for text embedding implementations.
///
/// All implementations must be `Send + Sync` to allow concurrent use
/// behind `Arc`. Calls are blocking; async callers go through
/// [`EmbeddingService`].
pub trait Embedder: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    /// Embed multiple text strings into vectors, in input order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError>;

    /// Return the dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;

    /// Identifier of the model; part of the embedding cache key.
    fn model_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EmbedderError::Transient("reset".into()).is_transient());
        assert!(EmbedderError::RateLimited.is_transient());
        assert!(!EmbedderError::Authentication("401".into()).is_transient());
        assert!(!EmbedderError::QuotaExhausted("402".into()).is_transient());

        let exhausted = EmbedderError::RetriesExhausted {
            attempts: 3,
            source: Box::new(EmbedderError::RateLimited),
        };
        assert!(!exhausted.is_transient());
        assert!(exhausted.to_string().contains("3 attempts"));
    }
}
