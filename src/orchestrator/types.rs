//! Request and response shapes for a simulation run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::concept::ConceptInput;
use crate::panel_context::PanelContextSpec;
use crate::persona::{PersonaFilter, PersonaGenerationTask, PersonaSpec};
use crate::population::{PersonaInjection, PopulationSpec};

use super::SimulationError;

pub const DEFAULT_ANCHOR_BANK: &str = "purchase_intent_en.yml";
pub const DEFAULT_INTENT: &str = "purchase_intent";

fn default_anchor_bank() -> String {
    DEFAULT_ANCHOR_BANK.to_string()
}

fn default_intent() -> String {
    DEFAULT_INTENT.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationOptions {
    /// Draws per persona, or the stratified total. Falls back to the
    /// configured default sample size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_n: Option<usize>,
    #[serde(default)]
    pub stratified: bool,
    #[serde(default = "default_anchor_bank")]
    pub anchor_bank: String,
    #[serde(default = "default_intent")]
    pub intent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Chat model route for this run's rationales, replacing each
    /// generator's configured model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Embedding model used to score this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            n: None,
            total_n: None,
            stratified: false,
            anchor_bank: default_anchor_bank(),
            intent: default_intent(),
            intent_question: None,
            seed: None,
            temperature: None,
            model: None,
            embedding_model: None,
        }
    }
}

impl SimulationOptions {
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.n == Some(0) {
            return Err(SimulationError::Invalid("n must be at least 1".into()));
        }
        if self.total_n == Some(0) {
            return Err(SimulationError::Invalid("total_n must be at least 1".into()));
        }
        if self.anchor_bank.trim().is_empty() {
            return Err(SimulationError::Invalid("anchor_bank must not be empty".into()));
        }
        for (name, value) in [("model", &self.model), ("embedding_model", &self.embedding_model)] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(SimulationError::Invalid(format!("{name} must not be empty")));
            }
        }
        if let Some(t) = self.temperature {
            if !t.is_finite() || !(0.0..=2.0).contains(&t) {
                return Err(SimulationError::Invalid(format!(
                    "temperature must be within 0..=2, got {t}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationRequest {
    pub concept: ConceptInput,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub personas: Vec<PersonaSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_group: Option<String>,
    /// Raw CSV text defining personas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_csv: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub persona_filters: Vec<PersonaFilter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub persona_injections: Vec<PersonaInjection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub persona_generations: Vec<PersonaGenerationTask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub population_spec: Option<PopulationSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub panel_context: Option<PanelContextSpec>,
    /// Extra questions asked after the primary intent question.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_question: Option<String>,
    pub options: SimulationOptions,
}

impl SimulationRequest {
    pub fn new(concept: ConceptInput) -> Self {
        Self {
            concept,
            ..Default::default()
        }
    }

    pub fn resolved_intent(&self) -> &str {
        self.intent
            .as_deref()
            .filter(|i| !i.trim().is_empty())
            .unwrap_or(&self.options.intent)
    }

    /// The primary question: explicit override, then the options' override,
    /// then the intent's default wording.
    pub fn primary_question(&self) -> String {
        self.intent_question
            .as_deref()
            .or(self.options.intent_question.as_deref())
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_question(self.resolved_intent()).to_string())
    }

    /// Primary question followed by the extra questions, blanks and repeats
    /// removed.
    pub fn all_questions(&self) -> Vec<String> {
        let mut out = vec![self.primary_question()];
        for q in &self.questions {
            let q = q.trim();
            if !q.is_empty() && !out.iter().any(|existing| existing == q) {
                out.push(q.to_string());
            }
        }
        out
    }
}

pub fn default_question(intent: &str) -> &'static str {
    match intent {
        "purchase_intent" => "How likely would you be to purchase this product?",
        "relevance" => "How relevant is this concept to your needs?",
        _ => "How do you feel about this offering?",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikertDistribution {
    pub ratings: Vec<i32>,
    pub pmf: Vec<f64>,
    pub mean: f64,
    pub top2box: f64,
    pub sample_n: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaQuestionResult {
    pub question: String,
    pub distribution: LikertDistribution,
    pub rationales: Vec<String>,
    pub themes: Vec<String>,
}

/// One persona's answers. The top-level fields repeat the primary question's
/// result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaResult {
    pub persona: PersonaSpec,
    pub distribution: LikertDistribution,
    pub rationales: Vec<String>,
    pub themes: Vec<String>,
    #[serde(default)]
    pub question_results: Vec<PersonaQuestionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionAggregate {
    pub question: String,
    pub aggregate: LikertDistribution,
    /// Bootstrap bounds on the mean rating; `None` when no draws were scored.
    pub ci_mean_lower: Option<f64>,
    pub ci_mean_upper: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResponse {
    pub aggregate: LikertDistribution,
    pub personas: Vec<PersonaResult>,
    pub questions: Vec<QuestionAggregate>,
    pub metadata: BTreeMap<String, String>,
}
