//! Process settings loaded from the environment.
//!
//! `Settings` is read once at startup and passed down explicitly. The CLI
//! builds its provider adapters from it rather than from the environment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::gateway::embeddings::{DEFAULT_EMBEDDINGS_TIMEOUT, DEFAULT_OPENAI_BASE_URL};
use crate::gateway::openrouter::{
    OpenRouterAdapter, DEFAULT_CHAT_TIMEOUT, DEFAULT_OPENROUTER_BASE_URL,
};
use crate::gateway::{OpenAiEmbeddings, ProviderError, UsageSink};

pub const DEFAULT_RESEARCH_MODEL: &str = "openai/gpt-5-mini";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_MAX_CONCURRENCY: usize = 64;
pub const DEFAULT_SAMPLE_SIZE: usize = 200;

/// Upper bound on simultaneous outbound rationale calls, whatever the
/// configured value.
pub const CONCURRENCY_CEILING: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: Option<String>,
    pub openrouter_timeout: Duration,
    pub openrouter_referer: Option<String>,
    pub openrouter_app_title: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    /// Chat model used for rationale elicitation and LLM persona generation.
    pub research_model: String,
    pub embedding_model: String,
    pub max_concurrency: usize,
    pub default_sample_size: usize,
    pub anchor_bank_path: PathBuf,
    pub persona_library_path: PathBuf,
    pub log_level: String,
    pub cache_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openrouter_api_key: None,
            openrouter_base_url: None,
            openrouter_timeout: DEFAULT_CHAT_TIMEOUT,
            openrouter_referer: None,
            openrouter_app_title: None,
            openai_api_key: None,
            openai_base_url: None,
            research_model: DEFAULT_RESEARCH_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            default_sample_size: DEFAULT_SAMPLE_SIZE,
            anchor_bank_path: PathBuf::from("data/anchors"),
            persona_library_path: PathBuf::from("data/personas"),
            log_level: "info".to_string(),
            cache_path: PathBuf::from(".ssr_rationale_cache.sqlite"),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let max_concurrency = match get("SSR_MAX_CONCURRENCY") {
            Some(raw) => parse_bounded("SSR_MAX_CONCURRENCY", &raw, 1, 512)?,
            None => defaults.max_concurrency,
        };
        let openrouter_timeout = match get("OPENROUTER_TIMEOUT_SECONDS") {
            Some(raw) => Duration::from_secs(
                parse_bounded("OPENROUTER_TIMEOUT_SECONDS", &raw, 1, 3600)? as u64,
            ),
            None => defaults.openrouter_timeout,
        };
        let default_sample_size = match get("SSR_DEFAULT_SAMPLE_SIZE") {
            Some(raw) => parse_bounded("SSR_DEFAULT_SAMPLE_SIZE", &raw, 1, usize::MAX)?,
            None => defaults.default_sample_size,
        };

        Ok(Self {
            openrouter_api_key: get("OPENROUTER_API_KEY"),
            openrouter_base_url: get("OPENROUTER_BASE_URL"),
            openrouter_timeout,
            openrouter_referer: get("OPENROUTER_REFERER"),
            openrouter_app_title: get("OPENROUTER_APP_TITLE"),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL"),
            research_model: get("SSR_RESEARCH_MODEL").unwrap_or(defaults.research_model),
            embedding_model: get("SSR_EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            max_concurrency,
            default_sample_size,
            anchor_bank_path: get("SSR_ANCHOR_BANK_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.anchor_bank_path),
            persona_library_path: get("SSR_PERSONA_LIBRARY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.persona_library_path),
            log_level: get("SSR_LOG_LEVEL").unwrap_or(defaults.log_level),
            cache_path: get("SSR_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_path),
        })
    }

    /// OpenRouter chat adapter from these settings.
    pub fn openrouter_adapter(&self) -> Result<OpenRouterAdapter, ProviderError> {
        let api_key = self
            .openrouter_api_key
            .as_deref()
            .ok_or_else(|| ProviderError::config("OPENROUTER_API_KEY not set"))?;
        OpenRouterAdapter::with_config(
            api_key,
            self.openrouter_base_url
                .as_deref()
                .unwrap_or(DEFAULT_OPENROUTER_BASE_URL),
            self.openrouter_timeout,
            self.openrouter_referer.clone(),
            self.openrouter_app_title.clone(),
        )
    }

    /// Embedding client on `embedding_model`.
    pub fn embeddings(&self, usage_sink: Arc<dyn UsageSink>) -> Result<OpenAiEmbeddings, ProviderError> {
        let api_key = self
            .openai_api_key
            .as_deref()
            .ok_or_else(|| ProviderError::config("OPENAI_API_KEY not set"))?;
        OpenAiEmbeddings::with_config(
            api_key,
            self.openai_base_url.as_deref().unwrap_or(DEFAULT_OPENAI_BASE_URL),
            self.embedding_model.as_str(),
            DEFAULT_EMBEDDINGS_TIMEOUT,
            usage_sink,
        )
    }

    /// Effective elicitation concurrency: `min(max_concurrency, 64)`.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, CONCURRENCY_CEILING)
    }
}

fn parse_bounded(
    var: &'static str,
    raw: &str,
    min: usize,
    max: usize,
) -> Result<usize, ConfigError> {
    let invalid = || ConfigError::Invalid {
        var,
        expected: "a positive integer in range",
        value: raw.to_string(),
    };
    let value: usize = raw.trim().parse().map_err(|_| invalid())?;
    if value < min || value > max {
        return Err(invalid());
    }
    Ok(value)
}
