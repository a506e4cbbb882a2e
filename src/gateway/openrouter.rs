//! Chat completions through OpenRouter's OpenAI-compatible API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::http::{self, ApiError};
use super::types::{ChatRequest, ChatResponse, FinishReason, Message};

pub const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

pub const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Prompts longer than this are rejected before any network call.
const MAX_PROMPT_CHARS: usize = 500_000;

const PROVIDER: &str = "openrouter";

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    completions_url: String,
}

impl OpenRouterAdapter {
    /// `referer` and `app_title` become OpenRouter's optional attribution
    /// headers.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        referer: Option<String>,
        app_title: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = http::json_client(
            &api_key.into(),
            timeout,
            &[
                ("http-referer", referer.as_deref()),
                ("x-title", app_title.as_deref()),
            ],
        )?;
        let base_url = base_url.into();
        Ok(Self {
            client,
            completions_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        })
    }
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct CompletionReply {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<TokenUsage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: Option<ReplyMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct TokenUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Refusals are recognized by how the first line opens.
fn looks_like_refusal(text: &str) -> bool {
    const OPENERS: [&str; 9] = [
        "refus",
        "i cannot",
        "i can't",
        "i won't",
        "i will not",
        "i am unable to",
        "i'm unable to",
        "unable to comply",
        "unable to assist",
    ];
    let lowered = text.trim_start().to_lowercase();
    let first_line = lowered.lines().next().unwrap_or_default();
    OPENERS.iter().any(|o| first_line.starts_with(o)) || lowered.contains("request was refused")
}

#[async_trait]
impl ChatProvider for OpenRouterAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let chars = req.prompt_chars();
        if chars > MAX_PROMPT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "prompt has {chars} chars, limit is {MAX_PROMPT_CHARS}"
            )));
        }

        let started = Instant::now();
        let body = CompletionBody {
            model: req.model.model_id(),
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            seed: req.seed,
            response_format: req
                .json_mode
                .then(|| serde_json::json!({ "type": "json_object" })),
        };
        let reply = http::post_json(&self.client, PROVIDER, &self.completions_url, &body).await?;

        let parsed: CompletionReply = serde_json::from_str(&reply.body).map_err(|e| {
            ProviderError::provider(PROVIDER, format!("unparseable completion: {e}"), false)
                .with_context(reply.context.clone())
        })?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            return Err(if looks_like_refusal(&message) {
                ProviderError::refused(message)
            } else {
                ProviderError::provider(PROVIDER, message, false).with_context(reply.context)
            });
        }

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(ProviderError::provider(PROVIDER, "completion had no choices", false)
                .with_context(reply.context));
        };
        let content = choice.message.and_then(|m| m.content).unwrap_or_default();
        if looks_like_refusal(&content) {
            return Err(ProviderError::refused(content));
        }

        let usage = parsed.usage.unwrap_or_default();
        Ok(ChatResponse {
            content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            latency: started.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason.as_deref()),
        })
    }
}
