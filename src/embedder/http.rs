/// OpenAI-compatible `/embeddings` client.
///
/// The request runs on the tokio runtime the embedder was created on and is
/// awaited with `Handle::block_on`, so `embed_batch` must be called from a
/// blocking thread (`spawn_blocking`), never from inside an async task.
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use super::{Embedder, EmbedderError};
use crate::config::EmbeddingConfig;

pub struct HttpEmbedder {
    client: Client,
    runtime: Handle,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
    send_dimensions: bool,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [&'a str],
    model: &'a str,
    /// Asks models with adjustable output size for exactly the store's width.
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbedderError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            EmbedderError::Authentication(format!("environment variable {} is not set", config.api_key_env))
        })?;
        let runtime = Handle::try_current().map_err(|e| EmbedderError::InferenceFailed(e.to_string()))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EmbedderError::InferenceFailed(e.to_string()))?;

        Ok(Self {
            client,
            runtime,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            dimensions: config.dimensions,
            send_dimensions: config.send_dimensions,
        })
    }

    fn request<'a>(&'a self, texts: &'a [&'a str]) -> EmbeddingRequest<'a> {
        EmbeddingRequest {
            input: texts,
            model: &self.model,
            dimensions: self.send_dimensions.then_some(self.dimensions),
        }
    }
}

/// Map a non-success response onto the error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> EmbedderError {
    let lower = body.to_lowercase();
    match status {
        StatusCode::PAYMENT_REQUIRED => EmbedderError::QuotaExhausted(format!("status {status}")),
        StatusCode::TOO_MANY_REQUESTS if lower.contains("insufficient_quota") || lower.contains("quota") => {
            EmbedderError::QuotaExhausted(format!("status {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => EmbedderError::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            EmbedderError::Authentication(format!("status {status}"))
        }
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            EmbedderError::Transient(format!("status {status}"))
        }
        _ => EmbedderError::InferenceFailed(format!("status {status}")),
    }
}

/// Restore input order when the service reports `index` per item.
fn order_embeddings(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>, EmbedderError> {
    if data.len() != expected {
        return Err(EmbedderError::InvalidResponse(format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

impl Embedder for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut vectors = self.embed_batch(&[text])?;
        vectors
            .pop()
            .ok_or_else(|| EmbedderError::InvalidResponse("empty response".into()))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = self.request(texts);

        let (status, text) = self.runtime.block_on(async {
            let response = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| EmbedderError::Transient(e.to_string()))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| EmbedderError::Transient(e.to_string()))?;
            Ok::<_, EmbedderError>((status, text))
        })?;

        if !status.is_success() {
            tracing::error!("embedding API error {status}: {text}");
            return Err(classify_status(status, &text));
        }

        let resp: EmbeddingResponse =
            serde_json::from_str(&text).map_err(|e| EmbedderError::InvalidResponse(e.to_string()))?;
        order_embeddings(resp.data, texts.len())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
