//! Embedding model seam.
//!
//! The pipeline only sees [`Embedder`]. Two implementations ship:
//! - [`OpenAIEmbedder`] for any OpenAI-compatible `/embeddings` endpoint
//! - [`HashingEmbedder`], a deterministic offline feature-hashing model
//!
//! [`Prefixed`] adds e5-style "query: " / "passage: " prefixes to either.

pub mod hashing;
pub mod openai;

use std::sync::Arc;
use async_trait::async_trait;
use crate::config::EmbeddingsConfig;
use crate::error::{Result, RagsyncError};

pub use hashing::HashingEmbedder;
pub use openai::OpenAIEmbedder;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded in logs
    fn model_id(&self) -> &str;

    /// Length of every vector this embedder returns
    fn dimension(&self) -> usize;

    /// Embed documents, one vector per input in input order.
    ///
    /// Any failure fails the whole batch.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        if vectors.len() != 1 {
            return Err(RagsyncError::Embedding(format!(
                "expected 1 query embedding, got {}",
                vectors.len()
            )));
        }
        Ok(vectors.remove(0))
    }
}

/// Prepends fixed prefixes before delegating, as e5-family models expect
pub struct Prefixed<E> {
    inner: E,
    query_prefix: String,
    document_prefix: String,
}

impl<E: Embedder> Prefixed<E> {
    pub fn new(inner: E, query_prefix: impl Into<String>, document_prefix: impl Into<String>) -> Self {
        Self {
            inner,
            query_prefix: query_prefix.into(),
            document_prefix: document_prefix.into(),
        }
    }
}

#[async_trait]
impl<E: Embedder> Embedder for Prefixed<E> {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.document_prefix.is_empty() {
            return self.inner.embed_batch(texts).await;
        }
        let prefixed: Vec<String> = texts
            .iter()
            .map(|t| format!("{}{}", self.document_prefix, t))
            .collect();
        self.inner.embed_batch(&prefixed).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.inner
            .embed_query(&format!("{}{}", self.query_prefix, text))
            .await
    }
}

/// Check an embedder response against the request
pub(crate) fn check_batch(vectors: &[Vec<f32>], requested: usize, dim: usize) -> Result<()> {
    if vectors.len() != requested {
        return Err(RagsyncError::Embedding(format!(
            "requested {} embeddings, got {}",
            requested,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
        return Err(RagsyncError::Embedding(format!(
            "model returned dimension {}, configured {}",
            bad.len(),
            dim
        )));
    }
    Ok(())
}

/// Build the embedder described by the `[embeddings]` config section
pub fn build_embedder(config: &EmbeddingsConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                RagsyncError::Config(format!("Environment variable {} not set", config.api_key_env))
            })?;
            let embedder = OpenAIEmbedder::new(
                api_key,
                config.base_url.clone(),
                config.model.clone(),
                config.dimensions,
                config.batch_size,
            )?;
            Ok(Arc::new(Prefixed::new(
                embedder,
                config.query_prefix.clone(),
                config.document_prefix.clone(),
            )))
        }
        "hashing" => Ok(Arc::new(Prefixed::new(
            HashingEmbedder::new(config.model.clone(), config.dimensions),
            config.query_prefix.clone(),
            config.document_prefix.clone(),
        ))),
        other => Err(RagsyncError::Config(format!("Unknown embedding provider: {}", other))),
    }
}
