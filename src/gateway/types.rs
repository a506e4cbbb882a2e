//! Request and response shapes for chat completions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which code path issued a call, and for which simulation run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attribution {
    /// Static tag such as "elicitation::rationale".
    pub caller: &'static str,
    pub run_id: Option<Uuid>,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            run_id: None,
        }
    }

    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// OpenRouter model route, e.g. "openai/gpt-5-mini".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatModel(String);

impl ChatModel {
    pub fn new(route: impl Into<String>) -> Self {
        Self(route.into())
    }

    pub fn model_id(&self) -> &str {
        &self.0
    }

    /// Vendor prefix of the route; "openrouter" when the route has none.
    pub fn provider_name(&self) -> &str {
        self.0
            .split_once('/')
            .map(|(vendor, _)| vendor)
            .filter(|vendor| !vendor.is_empty())
            .unwrap_or("openrouter")
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: ChatModel,
    pub messages: Vec<Message>,
    /// 0.0 to 2.0.
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
    /// Ask for a JSON object response.
    pub json_mode: bool,
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            seed: None,
            json_mode: false,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }

    pub(crate) fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Other(String),
}

impl From<Option<&str>> for FinishReason {
    fn from(raw: Option<&str>) -> Self {
        match raw {
            Some("stop") => Self::Stop,
            Some("length") => Self::Length,
            Some("content_filter") => Self::ContentFilter,
            Some(other) => Self::Other(other.to_string()),
            None => Self::Other("unspecified".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency: Duration,
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    #[cfg(test)]
    pub(crate) fn empty() -> Self {
        Self {
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::ZERO,
            finish_reason: FinishReason::Other("none".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_name_is_the_route_prefix() {
        assert_eq!(ChatModel::new("openai/gpt-5-mini").provider_name(), "openai");
        assert_eq!(ChatModel::new("gpt-4o").provider_name(), "openrouter");
        assert_eq!(ChatModel::new("/odd").provider_name(), "openrouter");
    }

    #[test]
    fn request_builder_sets_sampling_options() {
        let req = ChatRequest::new(
            ChatModel::new("test/model"),
            vec![Message::system("be brief"), Message::user("héllo")],
            Attribution::new("test"),
        )
        .temperature(0.7)
        .max_tokens(200)
        .seed(Some(9))
        .json();

        assert!(req.json_mode);
        assert_eq!(req.max_tokens, Some(200));
        assert_eq!(req.seed, Some(9));
        assert_eq!(req.prompt_chars(), 13);
    }
}
