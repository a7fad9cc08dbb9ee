use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::error::{Result, RagsyncError};
use super::{check_batch, Embedder};

/// Retries for a query embedding after a 429/5xx or network error
const QUERY_MAX_RETRIES: usize = 3;

/// Request structure for the embeddings API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Response structure from the embeddings API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Individual embedding data in API response
#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Failure of one HTTP round trip
struct RequestError {
    retryable: bool,
    message: String,
}

impl From<RequestError> for RagsyncError {
    fn from(e: RequestError) -> Self {
        RagsyncError::Embedding(e.message)
    }
}

/// Client for any OpenAI-compatible embeddings endpoint
///
/// Document batches are split into requests of at most `batch_size` texts.
/// Query embeddings retry transient failures with exponential backoff;
/// document batches fail fast so the orchestrator can count the file as
/// failed and move on.
pub struct OpenAIEmbedder {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
    dimension: usize,
    batch_size: usize,
}

impl OpenAIEmbedder {
    /// Create a new embedder
    ///
    /// # Arguments
    ///
    /// * `api_key` - Bearer token
    /// * `base_url` - API root such as `https://api.openai.com/v1`
    /// * `model` - Model name (e.g. "intfloat/multilingual-e5-large")
    /// * `dimension` - Expected vector length; other lengths are errors
    /// * `batch_size` - Maximum texts per request (capped at 2048)
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        dimension: usize,
        batch_size: usize,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| RagsyncError::Embedding(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model,
            dimension,
            batch_size: batch_size.clamp(1, 2048),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn request(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, RequestError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest { model: &self.model, input: texts })
            .send()
            .await
            .map_err(|e| RequestError {
                retryable: true,
                message: format!("Network error: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(RequestError {
                retryable: is_retryable(status),
                message: format!("Embeddings API error {}: {}", status, body),
            });
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| RequestError {
            retryable: false,
            message: format!("Failed to parse response: {}", e),
        })?;

        Ok(order_by_index(parsed.data))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Servers may return items out of order; `index` restores request order
fn order_by_index(mut data: Vec<EmbeddingData>) -> Vec<Vec<f32>> {
    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
    }
    data.into_iter().map(|d| d.embedding).collect()
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.request(batch).await?;
            check_batch(&vectors, batch.len(), self.dimension)?;
            all.extend(vectors);
        }
        Ok(all)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let input = [text.to_string()];
        let start = std::time::Instant::now();
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);

        loop {
            match self.request(&input).await {
                Ok(mut vectors) => {
                    check_batch(&vectors, 1, self.dimension)?;
                    log::debug!("Query embedding took {:?} (attempt {})", start.elapsed(), attempt + 1);
                    return Ok(vectors.remove(0));
                }
                Err(e) if e.retryable && attempt < QUERY_MAX_RETRIES => {
                    log::warn!("Retry {}/{} after error: {}", attempt + 1, QUERY_MAX_RETRIES, e.message);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
