//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when embeddings are not configured.
//! - **[`OpenAiProvider`]** — calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaProvider`]** — calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Tests register their own deterministic provider through the same
//! trait, so the whole pipeline runs without network access.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate the provider named in the
//! configuration.
//!
//! # Retry Strategy
//!
//! The HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::EmbeddingConfig;
use crate::error::MemoryError;

/// An embedding backend: turns a batch of texts into dense vectors.
///
/// Implementations must be `Send + Sync`; the pipeline shares one
/// provider across all workers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError>;
}

/// Embed a single query text.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> Result<Vec<f32>, MemoryError> {
    let results = provider.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| MemoryError::transient("empty embedding response"))
}

/// Instantiate the provider named in the configuration.
pub fn create_provider(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, MemoryError> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledProvider)),
        other => Err(MemoryError::validation(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

/// Cosine similarity between two vectors; 0.0 when shapes mismatch.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

// ============ Disabled Provider ============

/// A no-op provider that always returns errors.
///
/// Used when `embedding.provider = "disabled"`. A pipeline whose step
/// plan includes `generate_embeddings` fails permanently against it.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        Err(MemoryError::permanent("embedding provider is disabled"))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, MemoryError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| MemoryError::validation("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| MemoryError::validation("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| MemoryError::validation("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MemoryError::transient(format!("build HTTP client: {e}")))?;
        Ok(Self {
            model,
            dims,
            api_key,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        #[derive(Deserialize)]
        struct ApiResponse {
            data: Vec<ApiEmbedding>,
        }
        #[derive(Deserialize)]
        struct ApiEmbedding {
            embedding: Vec<f32>,
        }

        let body = json!({ "model": self.model, "input": texts });
        let send = || async {
            self.client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
        };

        let response = retry_request(send, self.max_retries).await?;
        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::transient(format!("decode embeddings response: {e}")))?;

        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        check_response_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST {base_url}/api/embed`. Defaults to
/// `http://localhost:11434` when `embedding.base_url` is not set.
pub struct OllamaProvider {
    model: String,
    dims: usize,
    base_url: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, MemoryError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| MemoryError::validation("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| MemoryError::validation("embedding.dims required for Ollama provider"))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MemoryError::transient(format!("build HTTP client: {e}")))?;
        Ok(Self {
            model,
            dims,
            base_url,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        #[derive(Deserialize)]
        struct ApiResponse {
            embeddings: Vec<Vec<f32>>,
        }

        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let body = json!({ "model": self.model, "input": texts });
        let send = || async { self.client.post(&url).json(&body).send().await };

        let response = retry_request(send, self.max_retries).await?;
        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::transient(format!("decode embeddings response: {e}")))?;

        check_response_shape(&parsed.embeddings, texts.len(), self.dims)?;
        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }
}

// ============ Shared HTTP plumbing ============

/// Send a request with exponential backoff on 429/5xx/network errors.
/// Non-retryable 4xx statuses fail immediately as permanent.
async fn retry_request<F, Fut>(send: F, max_retries: u32) -> Result<reqwest::Response, MemoryError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let mut last_error = String::new();
    for attempt in 0..=max_retries {
        if attempt > 0 {
            let backoff = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(backoff).await;
        }
        match send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let retryable = status.as_u16() == 429 || status.is_server_error();
                let body = response.text().await.unwrap_or_default();
                last_error = format!("embedding API returned {status}: {body}");
                if !retryable {
                    return Err(MemoryError::permanent(last_error));
                }
            }
            Err(e) => {
                last_error = format!("embedding request failed: {e}");
            }
        }
    }
    Err(MemoryError::transient(last_error))
}

fn check_response_shape(
    vectors: &[Vec<f32>],
    expected_count: usize,
    expected_dims: usize,
) -> Result<(), MemoryError> {
    if vectors.len() != expected_count {
        return Err(MemoryError::transient(format!(
            "embedding API returned {} vectors for {} inputs",
            vectors.len(),
            expected_count
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected_dims) {
        return Err(MemoryError::permanent(format!(
            "embedding API returned {}-dim vector, expected {}",
            bad.len(),
            expected_dims
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, 0.5, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_mismatched_shapes_is_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn disabled_provider_errors() {
        let provider = DisabledProvider;
        assert!(matches!(
            provider.embed(&["x".to_string()]).await,
            Err(MemoryError::Permanent(_))
        ));
    }

    #[test]
    fn shape_check_catches_count_and_dims() {
        assert!(check_response_shape(&[vec![0.0; 4]], 1, 4).is_ok());
        assert!(check_response_shape(&[vec![0.0; 4]], 2, 4).is_err());
        assert!(check_response_shape(&[vec![0.0; 3]], 1, 4).is_err());
    }
}
