//! Simulation orchestration.
//!
//! A run resolves the concept, assembles and rakes the persona population,
//! allocates draws, then asks every question in turn. Each question fans out
//! across personas and their draws behind one shared admission gate; all
//! draws finish before that question is aggregated.

pub mod aggregate;
pub mod allocation;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::anchors::{AnchorBankCache, AnchorError};
use crate::concept::{ingest_concept, ConceptError};
use crate::config::Settings;
use crate::elicitation::{generate_batch, DrawBatch, ElicitationError, RationaleGenerator};
use crate::gateway::Embedder;
use crate::panel_context::apply_panel_context;
use crate::persona::csv::personas_from_csv_str;
use crate::persona::{
    filter_personas, synthesize_personas, LlmPersonaGenerator, PersonaError, PersonaLibrary,
    PersonaLibraryCache, PersonaSpec,
};
use crate::population::{
    buckets_from_population_spec, compose_buckets, describe_filter, rake_personas, PersonaBucket,
    PopulationError,
};
use crate::ssr::{expected_rating, RaterCache, RaterError, SemanticSimilarityRater};

pub use aggregate::{bootstrap_ci, clean_rationale, make_distribution, top_themes};
pub use allocation::allocate_draws;
pub use types::{
    default_question, LikertDistribution, PersonaQuestionResult, PersonaResult, QuestionAggregate,
    SimulationOptions, SimulationRequest, SimulationResponse,
};

use aggregate::{default_bootstrap_ci, mean_pmf, weighted_pmf, THEME_COUNT};

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Concept(#[from] ConceptError),

    #[error(transparent)]
    Anchor(#[from] AnchorError),

    #[error(transparent)]
    Rater(#[from] RaterError),

    #[error(transparent)]
    Persona(#[from] PersonaError),

    #[error(transparent)]
    Population(#[from] PopulationError),

    #[error(transparent)]
    Elicitation(#[from] ElicitationError),

    #[error("invalid simulation request: {0}")]
    Invalid(String),
}

/// The weighted personas a run will question.
#[derive(Debug, Clone, PartialEq)]
pub struct Population {
    pub personas: Vec<PersonaSpec>,
    /// Unspecified buckets dropped because explicit shares used everything.
    pub dropped_buckets: usize,
    /// Panel context chunks available to hand out.
    pub context_chunks: usize,
    pub persona_group_source: Option<String>,
}

/// Runs simulations against shared caches, an embedder and one or more
/// rationale generators.
pub struct Simulator {
    settings: Settings,
    anchors: Arc<AnchorBankCache>,
    raters: Arc<RaterCache>,
    libraries: Arc<PersonaLibraryCache>,
    embedder: Arc<dyn Embedder>,
    generators: Vec<Arc<dyn RationaleGenerator>>,
    persona_llm: Option<Arc<LlmPersonaGenerator>>,
    http: reqwest::Client,
}

impl Simulator {
    pub fn new(
        settings: Settings,
        embedder: Arc<dyn Embedder>,
        generators: Vec<Arc<dyn RationaleGenerator>>,
    ) -> Self {
        let anchors = Arc::new(AnchorBankCache::new(settings.anchor_bank_path.clone()));
        Self {
            settings,
            anchors,
            raters: Arc::new(RaterCache::new()),
            libraries: Arc::new(PersonaLibraryCache::new()),
            embedder,
            generators,
            persona_llm: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_anchor_cache(mut self, anchors: Arc<AnchorBankCache>) -> Self {
        self.anchors = anchors;
        self
    }

    pub fn with_rater_cache(mut self, raters: Arc<RaterCache>) -> Self {
        self.raters = raters;
        self
    }

    pub fn with_library_cache(mut self, libraries: Arc<PersonaLibraryCache>) -> Self {
        self.libraries = libraries;
        self
    }

    /// Enables the `llm` persona generation strategy.
    pub fn with_persona_generator(mut self, generator: Arc<LlmPersonaGenerator>) -> Self {
        self.persona_llm = Some(generator);
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn anchors(&self) -> &Arc<AnchorBankCache> {
        &self.anchors
    }

    pub fn raters(&self) -> &Arc<RaterCache> {
        &self.raters
    }

    pub fn libraries(&self) -> &Arc<PersonaLibraryCache> {
        &self.libraries
    }

    fn library(&self) -> Result<Arc<PersonaLibrary>, PersonaError> {
        self.libraries.get(&self.settings.persona_library_path)
    }

    // =========================================================================
    // Population
    // =========================================================================

    /// Blends every persona source on the request into one normalized,
    /// raked population with panel context applied.
    pub async fn assemble_population(
        &self,
        request: &SimulationRequest,
    ) -> Result<Population, SimulationError> {
        let llm = self.persona_llm.as_deref();
        let mut buckets: Vec<PersonaBucket> = Vec::new();
        let mut persona_group_source = None;

        if !request.personas.is_empty() {
            buckets.push(PersonaBucket::unspecified(request.personas.clone()));
        }

        if let Some(name) = request.persona_group.as_deref().filter(|g| !g.trim().is_empty()) {
            let group = self.library()?.get_group(name)?;
            persona_group_source = group.source.clone();
            buckets.push(PersonaBucket::unspecified(group.personas.clone()));
        }

        if let Some(csv) = request.persona_csv.as_deref().filter(|c| !c.trim().is_empty()) {
            buckets.push(PersonaBucket::unspecified(personas_from_csv_str(csv)?));
        }

        if !request.persona_filters.is_empty() {
            let library = self.library()?;
            for filter in &request.persona_filters {
                let personas = filter_personas(&library, filter)?;
                if personas.is_empty() {
                    return Err(PopulationError::EmptyFilter {
                        filter: describe_filter(filter),
                    }
                    .into());
                }
                buckets.push(PersonaBucket::new(personas, filter.weight_share));
            }
        }

        for task in &request.persona_generations {
            let personas = synthesize_personas(task, llm).await?;
            if !personas.is_empty() {
                buckets.push(PersonaBucket::new(personas, task.weight_share));
            }
        }

        for injection in &request.persona_injections {
            injection.validate()?;
            buckets.push(PersonaBucket::new(
                vec![injection.persona.clone()],
                injection.weight_share,
            ));
        }

        if let Some(spec) = &request.population_spec {
            let library = self.library()?;
            buckets.extend(buckets_from_population_spec(spec, &library, llm).await?);
        }

        let composition = compose_buckets(&buckets)?;
        let mut personas = composition.personas;

        if let Some(spec) = &request.population_spec {
            if !personas.is_empty() && !spec.marginals.is_empty() {
                personas = rake_personas(&personas, &spec.marginals, &spec.raking)?;
            }
        }

        if personas.is_empty() {
            tracing::info!("no persona sources yielded anyone; using a general consumer");
            personas = vec![PersonaSpec::general_consumer()];
        }

        let context_chunks = match &request.panel_context {
            Some(spec) => apply_panel_context(&mut personas, spec, request.options.seed.unwrap_or(0)),
            None => 0,
        };

        tracing::debug!(
            personas = personas.len(),
            buckets = buckets.len(),
            dropped_buckets = composition.dropped_buckets,
            context_chunks,
            "assembled population"
        );

        Ok(Population {
            personas,
            dropped_buckets: composition.dropped_buckets,
            context_chunks,
            persona_group_source,
        })
    }

    // =========================================================================
    // Simulation
    // =========================================================================

    pub async fn run_simulation(
        &self,
        request: &SimulationRequest,
    ) -> Result<SimulationResponse, SimulationError> {
        let options = &request.options;
        options.validate()?;

        let artifact = ingest_concept(&self.http, &request.concept).await?;
        let population = self.assemble_population(request).await?;
        let embedder = self.run_embedder(options.embedding_model.as_deref())?;
        let generators = self.run_generators(options.model.as_deref())?;
        let rater = self
            .raters
            .get(&options.anchor_bank, &self.anchors, embedder)
            .await?;

        let personas = &population.personas;
        let weights: Vec<f64> = personas.iter().map(|p| p.weight).collect();
        let n = options.n.unwrap_or(self.settings.default_sample_size);
        let draws = allocate_draws(&weights, n, options.total_n, options.stratified);
        let questions = request.all_questions();
        let prompt_block = artifact.as_prompt_block();
        let gate = Semaphore::new(self.settings.effective_concurrency());
        let run_id = Uuid::new_v4();

        tracing::info!(
            %run_id,
            personas = personas.len(),
            questions = questions.len(),
            draws = draws.iter().sum::<usize>(),
            anchor_bank = %options.anchor_bank,
            embedding_model = rater.embedding_model(),
            "starting simulation"
        );

        let round = RoundInputs {
            personas,
            weights: &weights,
            draws: &draws,
            prompt_block: &prompt_block,
            rater: &rater,
            generators: &generators,
            gate: &gate,
            seed: options.seed,
            temperature: options.temperature,
        };

        let mut question_aggregates = Vec::with_capacity(questions.len());
        let mut per_persona: Vec<Vec<PersonaQuestionResult>> = vec![Vec::new(); personas.len()];
        for question in &questions {
            let outcome = self.run_question(question, &round).await?;
            for (slot, result) in per_persona.iter_mut().zip(outcome.persona_results) {
                slot.push(result);
            }
            question_aggregates.push(outcome.aggregate);
        }

        let persona_results: Vec<PersonaResult> = personas
            .iter()
            .zip(per_persona)
            .filter_map(|(persona, question_results)| {
                let primary = question_results.first()?.clone();
                Some(PersonaResult {
                    persona: persona.clone(),
                    distribution: primary.distribution,
                    rationales: primary.rationales,
                    themes: primary.themes,
                    question_results,
                })
            })
            .collect();

        let primary = question_aggregates
            .first()
            .cloned()
            .ok_or_else(|| SimulationError::Invalid("no questions to ask".into()))?;

        let mut metadata = BTreeMap::new();
        metadata.insert("run_id".to_string(), run_id.to_string());
        metadata.insert("question".to_string(), primary.question.clone());
        metadata.insert("anchor_bank".to_string(), options.anchor_bank.clone());
        metadata.insert("embedding_model".to_string(), rater.embedding_model().to_string());
        if let Some(model) = &options.model {
            metadata.insert("model".to_string(), model.clone());
        }
        metadata.insert("intent".to_string(), request.resolved_intent().to_string());
        metadata.insert(
            "description_length".to_string(),
            artifact.description.chars().count().to_string(),
        );
        metadata.insert(
            "draw_allocation".to_string(),
            draws.iter().map(usize::to_string).collect::<Vec<_>>().join(","),
        );
        metadata.insert("ci_mean_lower".to_string(), format_bound(primary.ci_mean_lower));
        metadata.insert("ci_mean_upper".to_string(), format_bound(primary.ci_mean_upper));
        metadata.insert("persona_summary".to_string(), summarize_personas(&persona_results));
        metadata.insert("persona_total".to_string(), personas.len().to_string());
        metadata.insert("question_count".to_string(), questions.len().to_string());
        metadata.insert(
            "dropped_buckets".to_string(),
            population.dropped_buckets.to_string(),
        );
        if population.context_chunks > 0 {
            metadata.insert(
                "context_chunks".to_string(),
                population.context_chunks.to_string(),
            );
        }
        if let Some(spec) = &request.population_spec {
            metadata.insert("population_spec".to_string(), spec.summary());
        }
        if let Some(group) = &request.persona_group {
            metadata.insert("persona_group".to_string(), group.clone());
        }
        if let Some(source) = &population.persona_group_source {
            metadata.insert("persona_group_source".to_string(), source.clone());
        }

        tracing::info!(
            mean = primary.aggregate.mean,
            top2box = primary.aggregate.top2box,
            sample_n = primary.aggregate.sample_n,
            "simulation complete"
        );

        Ok(SimulationResponse {
            aggregate: primary.aggregate,
            personas: persona_results,
            questions: question_aggregates,
            metadata,
        })
    }

    /// One question across every persona, awaited as a whole.
    async fn run_question(
        &self,
        question: &str,
        round: &RoundInputs<'_>,
    ) -> Result<QuestionOutcome, SimulationError> {
        let tasks = round
            .personas
            .iter()
            .zip(round.draws)
            .map(|(persona, &draws)| {
                let batch = DrawBatch {
                    persona,
                    prompt_block: round.prompt_block,
                    question,
                    draws,
                    seed: round.seed,
                    temperature: round.temperature,
                };
                elicit_persona(round, batch)
            });
        let scored = try_join_all(tasks).await?;

        let ratings = round.rater.ratings();
        let mut parts = Vec::with_capacity(scored.len());
        let mut pooled = Vec::new();
        let mut sample_n = 0;
        let mut persona_results = Vec::with_capacity(scored.len());

        for (weight, draw) in round.weights.iter().zip(scored) {
            let pmf = mean_pmf(&draw.pmfs, ratings.len());
            pooled.extend(draw.pmfs.iter().map(|p| expected_rating(p, ratings)));
            sample_n += draw.pmfs.len();
            persona_results.push(PersonaQuestionResult {
                question: question.to_string(),
                distribution: make_distribution(ratings, &pmf, draw.pmfs.len()),
                themes: top_themes(&draw.rationales, THEME_COUNT),
                rationales: draw.rationales,
            });
            parts.push((*weight, pmf));
        }

        let total_weight: f64 = parts.iter().map(|(w, _)| w.max(0.0)).sum();
        for (weight, _) in parts.iter_mut() {
            *weight = if total_weight > 0.0 {
                weight.max(0.0) / total_weight
            } else {
                1.0 / round.personas.len() as f64
            };
        }

        let aggregate_pmf = weighted_pmf(&parts, ratings.len());
        let (lower, upper) = default_bootstrap_ci(&pooled);
        tracing::debug!(question, sample_n, ci_lower = lower, ci_upper = upper, "aggregated question");

        Ok(QuestionOutcome {
            persona_results,
            aggregate: QuestionAggregate {
                question: question.to_string(),
                aggregate: make_distribution(ratings, &aggregate_pmf, sample_n),
                ci_mean_lower: lower.is_finite().then_some(lower),
                ci_mean_upper: upper.is_finite().then_some(upper),
            },
        })
    }

    /// The configured embedder, or a copy of it on `model`.
    fn run_embedder(&self, model: Option<&str>) -> Result<Arc<dyn Embedder>, SimulationError> {
        match model {
            Some(model) if model != self.embedder.model() => {
                self.embedder.with_model(model).ok_or_else(|| {
                    SimulationError::Invalid(format!(
                        "embedder {} cannot switch to model {model}",
                        self.embedder.model()
                    ))
                })
            }
            _ => Ok(Arc::clone(&self.embedder)),
        }
    }

    /// The configured generators, each switched to `model` when one is given.
    fn run_generators(
        &self,
        model: Option<&str>,
    ) -> Result<Vec<Arc<dyn RationaleGenerator>>, SimulationError> {
        let Some(model) = model else {
            return Ok(self.generators.clone());
        };
        self.generators
            .iter()
            .map(|generator| {
                generator.with_model(model).ok_or_else(|| {
                    SimulationError::Invalid(format!(
                        "rationale generator {} cannot switch to model {model}",
                        generator.provider_name()
                    ))
                })
            })
            .collect()
    }
}

async fn elicit_persona(
    round: &RoundInputs<'_>,
    batch: DrawBatch<'_>,
) -> Result<ScoredDraws, SimulationError> {
    let results = generate_batch(round.generators, round.gate, batch).await?;
    let rationales: Vec<String> = results
        .iter()
        .map(|r| clean_rationale(&r.rationale))
        .collect();
    let pmfs = if rationales.is_empty() {
        Vec::new()
    } else {
        round.rater.score_many(&rationales).await?
    };
    tracing::debug!(persona = %batch.persona.name, draws = pmfs.len(), "scored persona draws");
    Ok(ScoredDraws { rationales, pmfs })
}

struct RoundInputs<'a> {
    personas: &'a [PersonaSpec],
    weights: &'a [f64],
    draws: &'a [usize],
    prompt_block: &'a str,
    rater: &'a SemanticSimilarityRater,
    generators: &'a [Arc<dyn RationaleGenerator>],
    gate: &'a Semaphore,
    seed: Option<u64>,
    temperature: Option<f32>,
}

struct ScoredDraws {
    rationales: Vec<String>,
    pmfs: Vec<Vec<f64>>,
}

struct QuestionOutcome {
    persona_results: Vec<PersonaQuestionResult>,
    aggregate: QuestionAggregate,
}

fn format_bound(bound: Option<f64>) -> String {
    format!("{:.3}", bound.unwrap_or(f64::NAN))
}

/// `"name: h1; h2 | name2"` over every persona result.
pub fn summarize_personas(results: &[PersonaResult]) -> String {
    results
        .iter()
        .map(|r| {
            let highlights = r.persona.highlights();
            if highlights.is_empty() {
                r.persona.name.clone()
            } else {
                format!("{}: {}", r.persona.name, highlights.join("; "))
            }
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_for(persona: PersonaSpec) -> PersonaResult {
        let dist = make_distribution(&[1, 2], &[0.5, 0.5], 1);
        PersonaResult {
            persona,
            distribution: dist,
            rationales: Vec::new(),
            themes: Vec::new(),
            question_results: Vec::new(),
        }
    }

    #[test]
    fn persona_summary_joins_highlights() {
        let mut shopper = PersonaSpec::named("Shopper");
        shopper.age = Some("25-44".into());
        shopper.region = Some("US".into());
        let summary = summarize_personas(&[
            result_for(shopper),
            result_for(PersonaSpec::named("Plain")),
        ]);
        assert_eq!(summary, "Shopper: age 25-44; US | Plain");
    }

    #[test]
    fn bounds_format_to_three_places() {
        assert_eq!(format_bound(Some(3.14159)), "3.142");
        assert_eq!(format_bound(None), "NaN");
    }
}
