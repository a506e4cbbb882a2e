//! Persona synthesis from a free-text audience description.
//!
//! The heuristic generator is offline and deterministic. The LLM generator
//! asks a chat model for personas and falls back to the heuristic one on any
//! failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{PersonaError, PersonaField, PersonaSpec, PersonaTemplate};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::prompts::{extract_json, render_persona_generation_prompt};

pub const MAX_GENERATED_PERSONAS: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStrategy {
    #[default]
    Heuristic,
    #[serde(alias = "openai")]
    Llm,
}

impl std::str::FromStr for GenerationStrategy {
    type Err = PersonaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heuristic" => Ok(Self::Heuristic),
            "llm" | "openai" => Ok(Self::Llm),
            other => Err(PersonaError::invalid(
                "persona generation",
                format!("strategy must be 'heuristic' or 'llm', got {other:?}"),
            )),
        }
    }
}

fn default_count() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaGenerationTask {
    pub prompt: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub strategy: GenerationStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_share: Option<f64>,
    /// Field overrides applied to every generated persona.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<PersonaTemplate>,
}

impl PersonaGenerationTask {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            count: default_count(),
            strategy: GenerationStrategy::Heuristic,
            weight_share: None,
            attributes: BTreeMap::new(),
            templates: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), PersonaError> {
        if !(1..=MAX_GENERATED_PERSONAS).contains(&self.count) {
            return Err(PersonaError::invalid(
                "persona generation",
                format!(
                    "count must be within 1..={MAX_GENERATED_PERSONAS}, got {}",
                    self.count
                ),
            ));
        }
        if let Some(share) = self.weight_share {
            if !(0.0..=1.0).contains(&share) {
                return Err(PersonaError::invalid(
                    "persona generation",
                    format!("weight_share must be within [0, 1], got {share}"),
                ));
            }
        }
        self.parsed_attributes().map(|_| ())
    }

    fn parsed_attributes(&self) -> Result<Vec<(PersonaField, &str)>, PersonaError> {
        self.attributes
            .iter()
            .map(|(k, v)| Ok((k.parse::<PersonaField>()?, v.as_str())))
            .collect()
    }

    fn apply_attributes(&self, persona: &mut PersonaSpec) -> Result<(), PersonaError> {
        for (field, value) in self.parsed_attributes()? {
            field.apply(persona, value);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Persona(#[from] PersonaError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("persona generator returned unusable output: {0}")]
    BadOutput(String),
}

#[async_trait]
pub trait PersonaGenerator: Send + Sync {
    async fn generate(
        &self,
        task: &PersonaGenerationTask,
    ) -> Result<Vec<PersonaSpec>, GenerationError>;
}

// =============================================================================
// HEURISTIC
// =============================================================================

static KEYWORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z][A-Za-z\-']{2,}").expect("Invalid keyword regex"));

static NON_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9 ]+").expect("Invalid name regex"));

const AGE_KEYWORDS: &[(&str, &[&str])] = &[
    ("18-24", &["gen z", "student", "campus", "college", "youth", "teen"]),
    ("25-44", &["millennial", "parent", "young professional", "career"]),
    ("45-64", &["midlife", "caregiver", "manager", "established"]),
    ("65+", &["senior", "retiree", "older", "caregiver"]),
];

/// Lowercased words of three or more letters, deduplicated, first six.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut out: Vec<String> = Vec::new();
    for m in KEYWORD_RE.find_iter(&lowered) {
        let word = m.as_str().to_string();
        if !out.contains(&word) {
            out.push(word);
        }
        if out.len() == 6 {
            break;
        }
    }
    out
}

/// "<Title Cased Prompt>" truncated to 40 chars, suffixed with " #<index+1>".
pub fn fallback_name(prompt: &str, index: usize) -> String {
    let cleaned = NON_NAME_CHARS.replace_all(prompt.trim(), "");
    let mut titled = String::with_capacity(cleaned.len());
    let mut prev_alpha = false;
    for c in cleaned.trim().chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                titled.extend(c.to_lowercase());
            } else {
                titled.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            titled.push(c);
            prev_alpha = false;
        }
    }
    let base: String = titled.chars().take(40).collect();
    let base = if base.is_empty() {
        "Generated Persona".to_string()
    } else {
        base
    };
    format!("{base} #{}", index + 1)
}

fn infer_age(descriptors: &[String]) -> Option<&'static str> {
    let lowered: Vec<String> = descriptors.iter().map(|d| d.to_lowercase()).collect();
    AGE_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.iter().any(|d| d == k)))
        .map(|(band, _)| *band)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicPersonaGenerator;

impl HeuristicPersonaGenerator {
    pub fn generate_sync(
        &self,
        task: &PersonaGenerationTask,
    ) -> Result<Vec<PersonaSpec>, PersonaError> {
        let descriptors = extract_keywords(&task.prompt);
        let lead = descriptors
            .first()
            .cloned()
            .unwrap_or_else(|| match task.prompt.trim() {
                "" => "audience".to_string(),
                p => p.to_string(),
            });
        let mut personas = Vec::new();

        for (idx, template) in task.templates.iter().enumerate() {
            let mut persona = template.to_persona(&fallback_name(&task.prompt, idx));
            if !descriptors.is_empty() {
                if persona.descriptors.is_empty() {
                    persona.descriptors = descriptors.iter().take(3).cloned().collect();
                }
                if persona.motivations.is_empty() {
                    persona.motivations = vec![
                        format!("Seeks better {lead} solutions"),
                        format!("Values {lead}-driven benefits"),
                    ];
                }
                if persona.pain_points.is_empty() {
                    persona.pain_points = vec![format!("Frustrated by limited {lead} options")];
                }
            }
            if persona.age.is_none() {
                persona.age = infer_age(&persona.descriptors).map(str::to_string);
            }
            task.apply_attributes(&mut persona)?;
            personas.push(persona);
        }

        while personas.len() < task.count {
            let mut persona = PersonaSpec {
                descriptors: if descriptors.is_empty() {
                    vec![lead.clone()]
                } else {
                    descriptors.iter().take(3).cloned().collect()
                },
                habits: vec![
                    format!("Engages with {lead} content weekly"),
                    format!("Researches {lead} recommendations online"),
                ],
                motivations: vec![
                    format!("Wants trustworthy {lead} solutions"),
                    format!("Cares about authentic {lead} experiences"),
                ],
                pain_points: vec![format!("Overwhelmed by inconsistent {lead} messaging")],
                preferred_channels: vec!["social media".to_string(), "word of mouth".to_string()],
                age: infer_age(&descriptors).map(str::to_string),
                ..PersonaSpec::named(fallback_name(&task.prompt, personas.len()))
            };
            task.apply_attributes(&mut persona)?;
            personas.push(persona);
        }

        personas.truncate(task.count.max(1));
        Ok(personas)
    }
}

#[async_trait]
impl PersonaGenerator for HeuristicPersonaGenerator {
    async fn generate(
        &self,
        task: &PersonaGenerationTask,
    ) -> Result<Vec<PersonaSpec>, GenerationError> {
        Ok(self.generate_sync(task)?)
    }
}

// =============================================================================
// LLM
// =============================================================================

pub struct LlmPersonaGenerator {
    gateway: Arc<dyn ChatGateway>,
    model: ChatModel,
}

impl LlmPersonaGenerator {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: ChatModel::new(model),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GeneratedPayload {
    List(Vec<serde_json::Value>),
    Wrapped { personas: Vec<serde_json::Value> },
}

#[async_trait]
impl PersonaGenerator for LlmPersonaGenerator {
    async fn generate(
        &self,
        task: &PersonaGenerationTask,
    ) -> Result<Vec<PersonaSpec>, GenerationError> {
        let prompt = render_persona_generation_prompt(task);
        let req = ChatRequest::new(
            self.model.clone(),
            prompt.to_messages(),
            Attribution::new("persona::generate"),
        )
        .temperature(0.0)
        .json();

        let resp = self.gateway.chat(req).await?;
        let text = resp.content.trim();
        if text.is_empty() {
            return Err(GenerationError::BadOutput("empty persona payload".to_string()));
        }

        let payload: GeneratedPayload = serde_json::from_str(extract_json(text))
            .map_err(|e| GenerationError::BadOutput(format!("non-JSON output: {e}")))?;
        let entries = match payload {
            GeneratedPayload::List(items) => items,
            GeneratedPayload::Wrapped { personas } => personas,
        };

        let mut personas = Vec::new();
        for (idx, entry) in entries.into_iter().enumerate() {
            if !entry.is_object() {
                continue;
            }
            let has_name = entry
                .get("name")
                .and_then(|v| v.as_str())
                .is_some_and(|s| !s.trim().is_empty());
            let Ok(mut persona) = serde_json::from_value::<PersonaSpec>(entry) else {
                continue;
            };
            if !has_name {
                persona.name = fallback_name(&task.prompt, idx);
            }
            if persona.weight <= 0.0 {
                persona.weight = 1.0;
            }
            task.apply_attributes(&mut persona)?;
            personas.push(persona);
        }

        if personas.is_empty() {
            return Err(GenerationError::BadOutput(
                "no usable personas in reply".to_string(),
            ));
        }
        personas.truncate(task.count);
        Ok(personas)
    }
}

/// Runs `task` with its strategy. LLM failures (or a missing LLM generator)
/// fall back to the heuristic generator with a warning.
pub async fn synthesize_personas(
    task: &PersonaGenerationTask,
    llm: Option<&LlmPersonaGenerator>,
) -> Result<Vec<PersonaSpec>, PersonaError> {
    task.validate()?;
    let heuristic = HeuristicPersonaGenerator;

    let personas = match (task.strategy, llm) {
        (GenerationStrategy::Llm, Some(generator)) => match generator.generate(task).await {
            Ok(personas) => personas,
            Err(GenerationError::Persona(e)) => return Err(e),
            Err(err) => {
                tracing::warn!(error = %err, prompt = %task.prompt, "LLM persona generation failed, using heuristic");
                heuristic.generate_sync(task)?
            }
        },
        (GenerationStrategy::Llm, None) => {
            tracing::warn!(prompt = %task.prompt, "no LLM persona generator configured, using heuristic");
            heuristic.generate_sync(task)?
        }
        (GenerationStrategy::Heuristic, _) => heuristic.generate_sync(task)?,
    };

    Ok(personas.into_iter().take(task.count).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_deduplicated_and_capped() {
        let kw = extract_keywords("Eco eco-friendly college students who love eco travel and camping gear");
        assert_eq!(
            kw,
            vec!["eco", "eco-friendly", "college", "students", "who", "love"]
        );
    }

    #[test]
    fn fallback_names_are_title_cased() {
        assert_eq!(fallback_name("busy parents!", 0), "Busy Parents #1");
        assert_eq!(fallback_name("", 2), "Generated Persona #3");
    }

    #[test]
    fn heuristic_generation_fills_templates_and_count() {
        let mut task = PersonaGenerationTask::new("college coffee lovers");
        task.count = 2;
        task.attributes.insert("region".into(), "US".into());
        let personas = HeuristicPersonaGenerator.generate_sync(&task).unwrap();
        assert_eq!(personas.len(), 2);
        assert_eq!(personas[0].name, "College Coffee Lovers #1");
        assert_eq!(personas[0].age.as_deref(), Some("18-24"));
        assert_eq!(personas[0].region.as_deref(), Some("US"));
        assert_eq!(personas[0].habits[0], "Engages with college content weekly");
        assert_eq!(personas[1].name, "College Coffee Lovers #2");
    }

    #[test]
    fn strategy_accepts_openai_alias() {
        let task: PersonaGenerationTask =
            serde_json::from_str(r#"{"prompt":"x","strategy":"openai"}"#).unwrap();
        assert_eq!(task.strategy, GenerationStrategy::Llm);
        assert_eq!(task.count, 3);
    }

    #[test]
    fn count_out_of_range_is_rejected() {
        let mut task = PersonaGenerationTask::new("x");
        task.count = 21;
        assert!(task.validate().is_err());
    }
}
