/// Batched, cached, retrying front end over an [`Embedder`].
///
/// Batches run on the blocking pool with at most `max_in_flight` in flight;
/// results are reassembled in batch order so vectors zip back onto their
/// chunks positionally.
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use serde::Serialize;
use tracing::{debug, warn};

use super::http::HttpEmbedder;
use super::mock::MockEmbedder;
use super::{Embedder, EmbedderError};
use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::db::models::{Chunk, estimate_tokens};

pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    max_batch_tokens: usize,
    max_in_flight: usize,
    max_retries: u32,
    retry_base_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmbedStats {
    /// Distinct texts sent to the embedder.
    pub computed: usize,
    /// Chunks filled from the cache.
    pub cached: usize,
    pub batches: usize,
}

/// A chunk embedding run that stopped at a failed batch.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct PartialEmbedding {
    pub stats: EmbedStats,
    /// Vectors computed before the failure; still valid cache entries.
    pub fresh: Vec<(String, Vec<f32>)>,
    pub source: EmbedderError,
}

impl EmbeddingService {
    pub fn new(embedder: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self {
            embedder,
            batch_size: config.batch_size.max(1),
            max_batch_tokens: config.max_batch_tokens.max(1),
            max_in_flight: config.max_in_flight.max(1),
            max_retries: config.max_retries,
            retry_base_ms: config.retry_base_ms,
        }
    }

    /// Build the configured provider. The HTTP provider needs a running tokio runtime.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, EmbedderError> {
        let embedder: Arc<dyn Embedder> = match config.provider {
            EmbeddingProvider::Mock => Arc::new(MockEmbedder::new(config.dimensions)),
            EmbeddingProvider::Http => Arc::new(HttpEmbedder::new(config)?),
        };
        Ok(Self::new(embedder, config))
    }

    pub fn model_id(&self) -> &str {
        self.embedder.model_id()
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    /// Chunks worth of work one `embed_chunks` call keeps in flight.
    pub fn window(&self) -> usize {
        self.batch_size * self.max_in_flight
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut vectors = self.embed_batch_with_retry(Arc::new(vec![text.to_string()])).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbedderError::InvalidResponse("no vector for query".into()))
    }

    /// Embed `texts` in order, batched under the count and token ceilings.
    pub async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedderError> {
        match self.embed_prefix(&texts).await {
            (vectors, None) => Ok(vectors),
            (_, Some(e)) => Err(e),
        }
    }

    /// Vectors for the longest prefix of `texts` whose batches succeeded,
    /// plus the error that stopped the run, if any.
    async fn embed_prefix(&self, texts: &[String]) -> (Vec<Vec<f32>>, Option<EmbedderError>) {
        let mut batches = stream::iter(
            self.plan_batches(texts)
                .into_iter()
                .map(|range| self.embed_batch_with_retry(Arc::new(texts[range].to_vec()))),
        )
        .buffered(self.max_in_flight);

        let mut vectors = Vec::with_capacity(texts.len());
        while let Some(batch) = batches.next().await {
            match batch {
                Ok(batch) => vectors.extend(batch),
                Err(e) => return (vectors, Some(e)),
            }
        }
        (vectors, None)
    }

    /// Fill `embedding` on every chunk: cache hits first, then one embedder
    /// call per distinct [`Chunk::embedding_key`]. Returns the freshly
    /// computed `(key, vector)` pairs for the cache.
    ///
    /// When a batch fails, the chunks covered by earlier batches keep their
    /// vectors and the error carries those pairs.
    pub async fn embed_chunks(
        &self,
        chunks: &mut [Chunk],
        cache: &HashMap<String, Vec<f32>>,
    ) -> Result<(EmbedStats, Vec<(String, Vec<f32>)>), PartialEmbedding> {
        let mut stats = EmbedStats::default();
        let keys: Vec<String> = chunks.iter().map(Chunk::embedding_key).collect();
        let mut pending: Vec<&str> = Vec::new();
        let mut texts: Vec<String> = Vec::new();
        let mut queued: HashSet<&str> = HashSet::new();

        for (chunk, key) in chunks.iter_mut().zip(&keys) {
            if let Some(vector) = cache.get(key) {
                chunk.embedding = Some(vector.clone());
                stats.cached += 1;
            } else if queued.insert(key) {
                pending.push(key);
                texts.push(chunk.embedding_text());
            }
        }

        if texts.is_empty() {
            return Ok((stats, Vec::new()));
        }

        stats.batches = self.plan_batches(&texts).len();
        debug!(
            "embedding {} texts in {} batches ({} cached)",
            texts.len(),
            stats.batches,
            stats.cached
        );

        let (vectors, error) = self.embed_prefix(&texts).await;
        stats.computed = vectors.len();
        let fresh: HashMap<&str, Vec<f32>> = pending.into_iter().zip(vectors).collect();

        for (chunk, key) in chunks.iter_mut().zip(&keys) {
            if chunk.embedding.is_none() {
                chunk.embedding = fresh.get(key.as_str()).cloned();
            }
        }

        let mut fresh: Vec<(String, Vec<f32>)> = fresh
            .into_iter()
            .map(|(key, vector)| (key.to_string(), vector))
            .collect();
        fresh.sort_by(|a, b| a.0.cmp(&b.0));

        match error {
            None => Ok((stats, fresh)),
            Some(source) => Err(PartialEmbedding { stats, fresh, source }),
        }
    }

    fn plan_batches(&self, texts: &[String]) -> Vec<Range<usize>> {
        let mut batches = Vec::new();
        let mut start = 0;
        let mut tokens = 0;
        for (i, text) in texts.iter().enumerate() {
            let t = estimate_tokens(text);
            let full = i - start >= self.batch_size || tokens + t > self.max_batch_tokens;
            if i > start && full {
                batches.push(start..i);
                start = i;
                tokens = 0;
            }
            tokens += t;
        }
        if start < texts.len() {
            batches.push(start..texts.len());
        }
        batches
    }

    /// One batch as a unit: transient failures retry with exponential
    /// backoff, anything else fails the batch immediately.
    async fn embed_batch_with_retry(&self, batch: Arc<Vec<String>>) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let mut attempt: u32 = 0;
        loop {
            let embedder = Arc::clone(&self.embedder);
            let texts = Arc::clone(&batch);
            let result = tokio::task::spawn_blocking(move || {
                let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
                embedder.embed_batch(&refs)
            })
            .await
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding task failed: {e}")))?;

            match result {
                Ok(vectors) => return self.validate(vectors, batch.len()),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = Duration::from_millis(self.retry_base_ms.saturating_mul(1 << attempt.min(16)));
                    warn!(
                        "embedding batch failed ({e}), retrying in {}ms ({}/{})",
                        delay.as_millis(),
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(EmbedderError::RetriesExhausted {
                        attempts: attempt + 1,
                        source: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn validate(&self, vectors: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if vectors.len() != expected {
            return Err(EmbedderError::InvalidResponse(format!(
                "expected {expected} vectors, got {}",
                vectors.len()
            )));
        }
        let dimensions = self.dimensions();
        for vector in &vectors {
            if vector.len() != dimensions {
                return Err(EmbedderError::InvalidResponse(format!(
                    "expected {dimensions} dimensions, got {}",
                    vector.len()
                )));
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(EmbedderError::InvalidResponse("non-finite value in vector".into()));
            }
        }
        Ok(vectors)
    }
}
