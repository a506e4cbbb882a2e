//! Rationale elicitation: asking personas for free-text reactions to a
//! concept, with bounded concurrency and a single retry per draw.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::cache::{CachedRationale, RationaleCache, RationaleCacheKey};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::persona::PersonaSpec;
use crate::prompts::{extract_json, render_rationale_prompt};

pub const DEFAULT_RATIONALE_TEMPERATURE: f32 = 1.0;
const RATIONALE_MAX_TOKENS: u32 = 400;

#[derive(Debug, Clone, PartialEq)]
pub struct RationaleResult {
    pub rationale: String,
    pub provider_name: String,
    pub model: String,
}

#[async_trait]
pub trait RationaleGenerator: Send + Sync {
    /// Provider label used in logs and errors.
    fn provider_name(&self) -> &str;

    async fn generate_rationale(
        &self,
        persona: &PersonaSpec,
        prompt_block: &str,
        question: &str,
        seed: Option<u64>,
        temperature: Option<f32>,
    ) -> Result<RationaleResult, ProviderError>;

    /// One draw of a persona's batch. Memoizing generators keep each draw
    /// index under its own entry so unseeded draws stay independent samples.
    async fn generate_draw(
        &self,
        persona: &PersonaSpec,
        prompt_block: &str,
        question: &str,
        seed: Option<u64>,
        temperature: Option<f32>,
        _draw: usize,
    ) -> Result<RationaleResult, ProviderError> {
        self.generate_rationale(persona, prompt_block, question, seed, temperature)
            .await
    }

    /// The same generator answering with `model`; `None` when it cannot switch.
    fn with_model(&self, _model: &str) -> Option<Arc<dyn RationaleGenerator>> {
        None
    }
}

#[derive(Debug, Error)]
pub enum ElicitationError {
    #[error("failed to elicit rationale for persona {persona:?} via {provider}: {source}")]
    Failed {
        persona: String,
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("no rationale generators configured")]
    NoGenerators,

    #[error("elicitation admission gate closed")]
    Closed,
}

// =============================================================================
// Gateway-backed generator
// =============================================================================

/// Roleplay prompts sent through a [`ChatGateway`], optionally memoized in a
/// [`RationaleCache`].
pub struct GatewayRationaleGenerator {
    gateway: Arc<dyn ChatGateway>,
    model: ChatModel,
    cache: Option<Arc<dyn RationaleCache>>,
}

impl GatewayRationaleGenerator {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: ChatModel::new(model),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn RationaleCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn model(&self) -> &str {
        self.model.model_id()
    }

    async fn cached(&self, key: &RationaleCacheKey) -> Option<String> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(hit) => hit.map(|c| c.rationale),
            Err(err) => {
                tracing::warn!(error = %err, "rationale cache read failed; calling provider");
                None
            }
        }
    }

    async fn store(&self, key: &RationaleCacheKey, value: &CachedRationale) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.put(key, value).await {
                tracing::warn!(error = %err, "rationale cache write failed");
            }
        }
    }
}

#[derive(Deserialize)]
struct RationaleReply {
    #[serde(default)]
    rationale: Option<String>,
}

/// The `rationale` field of a JSON reply, or the trimmed raw text when the
/// reply is not a JSON object carrying one.
pub fn parse_rationale_reply(raw: &str) -> String {
    let trimmed = raw.trim();
    let candidate = extract_json(trimmed);
    if candidate.starts_with('{') {
        if let Ok(RationaleReply {
            rationale: Some(text),
        }) = serde_json::from_str::<RationaleReply>(candidate)
        {
            if !text.trim().is_empty() {
                return text.trim().to_string();
            }
        }
    }
    trimmed.to_string()
}

impl GatewayRationaleGenerator {
    async fn elicit(
        &self,
        persona: &PersonaSpec,
        prompt_block: &str,
        question: &str,
        seed: Option<u64>,
        temperature: Option<f32>,
        draw: Option<usize>,
    ) -> Result<RationaleResult, ProviderError> {
        let prompt = render_rationale_prompt(persona, prompt_block, question, seed);
        let mut cache_text = prompt.cache_text();
        if let Some(draw) = draw {
            cache_text.push_str(&format!("\n[draw {draw}]"));
        }
        let key = RationaleCacheKey::new(self.model.model_id(), prompt.template_slug, &cache_text);

        if let Some(rationale) = self.cached(&key).await {
            tracing::debug!(persona = %persona.name, draw = ?draw, "rationale cache hit");
            return Ok(self.result(rationale));
        }

        let req = ChatRequest::new(
            self.model.clone(),
            prompt.to_messages(),
            Attribution::new("elicitation::rationale"),
        )
        .temperature(temperature.unwrap_or(DEFAULT_RATIONALE_TEMPERATURE))
        .max_tokens(RATIONALE_MAX_TOKENS)
        .seed(seed)
        .json();

        let resp = self.gateway.chat(req).await?;
        let rationale = parse_rationale_reply(&resp.content);
        if rationale.is_empty() {
            return Err(ProviderError::provider(
                self.provider_name(),
                "model returned empty rationale",
                false,
            ));
        }

        self.store(
            &key,
            &CachedRationale {
                rationale: rationale.clone(),
                input_tokens: Some(resp.input_tokens),
                output_tokens: Some(resp.output_tokens),
            },
        )
        .await;

        Ok(self.result(rationale))
    }

    fn result(&self, rationale: String) -> RationaleResult {
        RationaleResult {
            rationale,
            provider_name: self.model.provider_name().to_string(),
            model: self.model.model_id().to_string(),
        }
    }
}

#[async_trait]
impl RationaleGenerator for GatewayRationaleGenerator {
    fn provider_name(&self) -> &str {
        self.model.provider_name()
    }

    async fn generate_rationale(
        &self,
        persona: &PersonaSpec,
        prompt_block: &str,
        question: &str,
        seed: Option<u64>,
        temperature: Option<f32>,
    ) -> Result<RationaleResult, ProviderError> {
        self.elicit(persona, prompt_block, question, seed, temperature, None)
            .await
    }

    async fn generate_draw(
        &self,
        persona: &PersonaSpec,
        prompt_block: &str,
        question: &str,
        seed: Option<u64>,
        temperature: Option<f32>,
        draw: usize,
    ) -> Result<RationaleResult, ProviderError> {
        self.elicit(persona, prompt_block, question, seed, temperature, Some(draw))
            .await
    }

    fn with_model(&self, model: &str) -> Option<Arc<dyn RationaleGenerator>> {
        Some(Arc::new(Self {
            gateway: Arc::clone(&self.gateway),
            model: ChatModel::new(model),
            cache: self.cache.clone(),
        }))
    }
}

// =============================================================================
// Batch fan-out
// =============================================================================

/// One persona's draws for one question.
#[derive(Debug, Clone, Copy)]
pub struct DrawBatch<'a> {
    pub persona: &'a PersonaSpec,
    pub prompt_block: &'a str,
    pub question: &'a str,
    pub draws: usize,
    /// Draw `i` uses `seed + i`.
    pub seed: Option<u64>,
    pub temperature: Option<f32>,
}

async fn run_draw(
    generator: &dyn RationaleGenerator,
    gate: &Semaphore,
    batch: &DrawBatch<'_>,
    index: usize,
) -> Result<RationaleResult, ElicitationError> {
    let _permit = gate.acquire().await.map_err(|_| ElicitationError::Closed)?;
    let seed = batch.seed.map(|s| s.wrapping_add(index as u64));

    let first = generator
        .generate_draw(batch.persona, batch.prompt_block, batch.question, seed, batch.temperature, index)
        .await;
    let err = match first {
        Ok(result) => return Ok(result),
        Err(err) => err,
    };

    tracing::warn!(
        persona = %batch.persona.name,
        provider = generator.provider_name(),
        draw = index,
        error = %err,
        "rationale generation failed; retrying once"
    );
    generator
        .generate_draw(batch.persona, batch.prompt_block, batch.question, seed, batch.temperature, index)
        .await
        .map_err(|source| ElicitationError::Failed {
            persona: batch.persona.name.clone(),
            provider: generator.provider_name().to_string(),
            source,
        })
}

/// Runs every draw of `batch` concurrently, each admitted through `gate`.
/// Draw `i` goes to `generators[i % len]`. Results come back in draw order;
/// any draw failing twice fails the batch.
pub async fn generate_batch(
    generators: &[Arc<dyn RationaleGenerator>],
    gate: &Semaphore,
    batch: DrawBatch<'_>,
) -> Result<Vec<RationaleResult>, ElicitationError> {
    if generators.is_empty() {
        return Err(ElicitationError::NoGenerators);
    }

    let draws = (0..batch.draws).map(|index| {
        let generator = generators[index % generators.len()].as_ref();
        run_draw(generator, gate, &batch, index)
    });
    try_join_all(draws).await
}
