//! Text embedding: the [`Embedder`] trait and an OpenAI-compatible client.
//!
//! The client talks to `{base_url}/embeddings`, so it works against the
//! hosted OpenAI API as well as any compatible server (vLLM, Ollama, LM
//! Studio). Rate limits and server errors are retried with exponential
//! backoff; other client errors fail immediately.

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::{Error, Result},
    http,
    vector_index::normalize,
};

/// Turns text into fixed-dimension vectors.
///
/// All vectors produced by one embedder must share a dimension.
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Scale vectors to unit length.
    pub normalize: bool,
    /// Texts per request during builds.
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            base_url: http::OPENAI_BASE_URL.to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            normalize: true,
            batch_size: 32,
            max_retries: 3,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Config("embedding.model must be set".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config(
                "embedding.batch_size must be > 0".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "embedding.timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

pub struct OpenAiEmbedder {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    normalize: bool,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            client: http::build_client(config.timeout_secs)?,
            url: http::endpoint(&config.base_url, "embeddings"),
            model: config.model.clone(),
            api_key: http::api_key(&config.api_key_env, &config.base_url)?,
            normalize: config.normalize,
            max_retries: config.max_retries,
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| Error::Embedding("empty embedding response".into()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = http::post_json(
            &self.client,
            &self.url,
            self.api_key.as_deref(),
            &body,
            self.max_retries,
            Error::Embedding,
        )?;
        let parsed: EmbeddingResponse = response
            .json()
            .map_err(|e| Error::Embedding(format!("bad response: {e}")))?;

        let mut vectors = order_by_index(parsed, texts.len())?;
        if self.normalize {
            vectors.iter_mut().for_each(|v| normalize(v));
        }

        debug!(model = %self.model, count = vectors.len(), "embedded texts");
        Ok(vectors)
    }
}

/// Responses carry an `index` per item; put vectors back in input order.
fn order_by_index(
    response: EmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>> {
    if response.data.len() != expected {
        return Err(Error::Embedding(format!(
            "requested {expected} embeddings, received {}",
            response.data.len()
        )));
    }

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for item in response.data {
        let slot = slots
            .get_mut(item.index)
            .filter(|slot| slot.is_none())
            .ok_or_else(|| {
                Error::Embedding(format!(
                    "unexpected embedding index {}",
                    item.index
                ))
            })?;
        *slot = Some(item.embedding);
    }
    Ok(slots.into_iter().flatten().collect())
}

/// Build the configured embedder.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    config.validate()?;
    Ok(Box::new(OpenAiEmbedder::new(config)?))
}
