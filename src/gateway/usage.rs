//! Per-call usage records.
//!
//! The gateway reports every chat and embedding call to a [`UsageSink`]. The
//! CLI logs them with [`TracingUsageSink`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::Attribution;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    /// Carries [`ProviderError::code`](super::ProviderError::code).
    Failed(&'static str),
}

#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub provider: String,
    /// "chat/completions" or "embeddings".
    pub endpoint: &'static str,
    pub model: String,
    pub caller: &'static str,
    pub run_id: Option<Uuid>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency: Duration,
    pub outcome: CallOutcome,
    pub at: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(
        provider: impl Into<String>,
        endpoint: &'static str,
        model: impl Into<String>,
        attribution: Attribution,
    ) -> Self {
        Self {
            provider: provider.into(),
            endpoint,
            model: model.into(),
            caller: attribution.caller,
            run_id: attribution.run_id,
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::ZERO,
            outcome: CallOutcome::Ok,
            at: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failed(mut self, code: &'static str) -> Self {
        self.outcome = CallOutcome::Failed(code);
        self
    }
}

/// Receives one record per provider call. Recording never fails the call.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Successful calls at debug, failures at warn.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        let run_id = record.run_id.map(|id| id.to_string()).unwrap_or_default();
        match record.outcome {
            CallOutcome::Ok => tracing::debug!(
                provider = %record.provider,
                endpoint = record.endpoint,
                model = %record.model,
                caller = record.caller,
                run_id = %run_id,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                latency_ms = record.latency.as_millis() as u64,
                "provider call"
            ),
            CallOutcome::Failed(code) => tracing::warn!(
                provider = %record.provider,
                endpoint = record.endpoint,
                model = %record.model,
                caller = record.caller,
                run_id = %run_id,
                error = code,
                at = %record.at.to_rfc3339(),
                "provider call failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_takes_caller_and_run_from_attribution() {
        let run = Uuid::new_v4();
        let record = ProviderCallRecord::new(
            "openai",
            "embeddings",
            "text-embedding-3-small",
            Attribution::new("anchors::embed").for_run(run),
        )
        .tokens(12, 0)
        .failed("timeout");

        assert_eq!(record.caller, "anchors::embed");
        assert_eq!(record.run_id, Some(run));
        assert_eq!(record.input_tokens, 12);
        assert_eq!(record.outcome, CallOutcome::Failed("timeout"));
    }
}
