//! Provider access: OpenRouter chat completions and OpenAI-compatible
//! embeddings, with opt-in transport retries and usage records.

pub mod embeddings;
pub mod error;
mod http;
pub mod openrouter;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::ProviderCallRecord;

pub use embeddings::{Embedder, OpenAiEmbeddings};
pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// Chat completion seam used by elicitation and persona generation.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Transport retry policy. No retries unless a caller opts in; the
/// elicitation layer already retries each draw once.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<U: UsageSink> {
    openrouter: OpenRouterAdapter,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn with_config(
        openrouter: OpenRouterAdapter,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            openrouter,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let result = self.openrouter.chat(&req).await;
            self.record(&req, &result, started.elapsed()).await;

            match result {
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying chat completion"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn record(
        &self,
        req: &ChatRequest,
        result: &Result<ChatResponse, ProviderError>,
        latency: Duration,
    ) {
        let record = ProviderCallRecord::new(
            req.model.provider_name(),
            "chat/completions",
            req.model.model_id(),
            req.attribution,
        )
        .latency(latency);
        let record = match result {
            Ok(resp) => record.tokens(resp.input_tokens, resp.output_tokens),
            Err(err) => record.failed(err.code()),
        };
        self.usage_sink.record(record).await;
    }
}

#[async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

/// Doubles per attempt, capped at 32x the base.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.pow(attempt.min(5))
}
