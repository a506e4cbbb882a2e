//! The `Embedder` seam and a client for OpenAI-compatible `/embeddings`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::http;
use super::types::Attribution;
use super::usage::{ProviderCallRecord, UsageSink};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub const DEFAULT_EMBEDDINGS_TIMEOUT: Duration = Duration::from_secs(60);
const PROVIDER: &str = "openai";

/// Turns texts into dense vectors.
///
/// `embed_batch` returns exactly one vector per input, in input order, all of
/// one dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier; raters are cached per model.
    fn model(&self) -> &str;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError>;

    /// The same client on `model`; `None` when the embedder cannot switch.
    fn with_model(&self, _model: &str) -> Option<Arc<dyn Embedder>> {
        None
    }

    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| ProviderError::provider(PROVIDER, "empty embedding response", false))
    }
}

pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    url: String,
    model: String,
    usage_sink: Arc<dyn UsageSink>,
}

#[derive(Serialize)]
struct EmbeddingsBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsReply {
    data: Vec<EmbeddingRow>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f64>,
}

#[derive(Deserialize)]
struct EmbeddingUsage {
    #[serde(default)]
    prompt_tokens: u32,
}

impl OpenAiEmbeddings {
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
        usage_sink: Arc<dyn UsageSink>,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url.into();
        Ok(Self {
            client: http::json_client(&api_key.into(), timeout, &[])?,
            url: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.into(),
            usage_sink,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<(Vec<Vec<f64>>, u32), ProviderError> {
        let body = EmbeddingsBody {
            model: &self.model,
            input: texts,
        };
        let reply = http::post_json(&self.client, PROVIDER, &self.url, &body).await?;
        let mut parsed: EmbeddingsReply = serde_json::from_str(&reply.body).map_err(|e| {
            ProviderError::provider(PROVIDER, format!("unparseable embeddings: {e}"), false)
                .with_context(reply.context.clone())
        })?;

        if parsed.data.len() != texts.len() {
            return Err(ProviderError::provider(
                PROVIDER,
                format!("expected {} embeddings, got {}", texts.len(), parsed.data.len()),
                false,
            )
            .with_context(reply.context));
        }
        parsed.data.sort_by_key(|row| row.index);

        let dim = parsed.data[0].embedding.len();
        if parsed.data.iter().any(|row| row.embedding.len() != dim) {
            return Err(ProviderError::provider(
                PROVIDER,
                "embedding dimensions differ within one response",
                false,
            ));
        }

        let tokens = parsed.usage.map(|u| u.prompt_tokens).unwrap_or(0);
        Ok((parsed.data.into_iter().map(|row| row.embedding).collect(), tokens))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbeddings {
    fn model(&self) -> &str {
        &self.model
    }

    fn with_model(&self, model: &str) -> Option<Arc<dyn Embedder>> {
        Some(Arc::new(Self {
            client: self.client.clone(),
            url: self.url.clone(),
            model: model.to_string(),
            usage_sink: Arc::clone(&self.usage_sink),
        }))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let result = self.request(texts).await;
        let record = ProviderCallRecord::new(
            PROVIDER,
            "embeddings",
            self.model.as_str(),
            Attribution::new("embeddings::batch"),
        )
        .latency(started.elapsed());

        match result {
            Ok((vectors, tokens)) => {
                self.usage_sink.record(record.tokens(tokens, 0)).await;
                Ok(vectors)
            }
            Err(err) => {
                self.usage_sink.record(record.failed(err.code())).await;
                Err(err)
            }
        }
    }
}
