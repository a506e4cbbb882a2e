use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ssr_harness::concept::ConceptInput;
use ssr_harness::config::Settings;
use ssr_harness::elicitation::{ElicitationError, RationaleGenerator, RationaleResult};
use ssr_harness::gateway::{Embedder, ProviderError};
use ssr_harness::orchestrator::{SimulationError, SimulationRequest, Simulator};
use ssr_harness::persona::PersonaSpec;
use tempfile::tempdir;

const WORDS: [&str; 5] = ["one", "two", "three", "four", "five"];

/// Counts the rating words in a text; anchors and rationales share the
/// vocabulary so similarity is exact.
struct WordEmbedder {
    model: String,
}

impl WordEmbedder {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for WordEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn with_model(&self, model: &str) -> Option<Arc<dyn Embedder>> {
        Some(Arc::new(WordEmbedder::new(model)))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError> {
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                let tokens: Vec<&str> = lower
                    .split_whitespace()
                    .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
                    .collect();
                WORDS
                    .iter()
                    .map(|w| tokens.iter().filter(|t| *t == w).count() as f64)
                    .collect()
            })
            .collect())
    }
}

/// Answers by persona name and records the seeds it was given.
#[derive(Default)]
struct ScriptedGenerator {
    calls: AtomicUsize,
    seeds: Mutex<Vec<Option<u64>>>,
}

#[async_trait]
impl RationaleGenerator for ScriptedGenerator {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn generate_rationale(
        &self,
        persona: &PersonaSpec,
        _prompt_block: &str,
        question: &str,
        seed: Option<u64>,
        _temperature: Option<f32>,
    ) -> Result<RationaleResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seeds.lock().unwrap().push(seed);
        let rationale = match (persona.name.as_str(), question.contains("recommend")) {
            (_, true) => "I would say three\nfor a friend",
            ("Skeptic", _) => "Honestly two, the price worries me",
            _ => "Definitely five, refills are convenient",
        };
        Ok(RationaleResult {
            rationale: rationale.to_string(),
            provider_name: "scripted".to_string(),
            model: "scripted/v1".to_string(),
        })
    }
}

struct BrokenGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl RationaleGenerator for BrokenGenerator {
    fn provider_name(&self) -> &str {
        "broken"
    }

    async fn generate_rationale(
        &self,
        _persona: &PersonaSpec,
        _prompt_block: &str,
        _question: &str,
        _seed: Option<u64>,
        _temperature: Option<f32>,
    ) -> Result<RationaleResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::provider("broken", "upstream unavailable", true))
    }
}

/// Upbeat on "upbeat/*" routes, lukewarm otherwise.
struct RoutedGenerator {
    model: String,
}

#[async_trait]
impl RationaleGenerator for RoutedGenerator {
    fn provider_name(&self) -> &str {
        "routed"
    }

    async fn generate_rationale(
        &self,
        _persona: &PersonaSpec,
        _prompt_block: &str,
        _question: &str,
        _seed: Option<u64>,
        _temperature: Option<f32>,
    ) -> Result<RationaleResult, ProviderError> {
        let rationale = if self.model.starts_with("upbeat/") {
            "five, easily"
        } else {
            "maybe two"
        };
        Ok(RationaleResult {
            rationale: rationale.to_string(),
            provider_name: "routed".to_string(),
            model: self.model.clone(),
        })
    }

    fn with_model(&self, model: &str) -> Option<Arc<dyn RationaleGenerator>> {
        Some(Arc::new(RoutedGenerator {
            model: model.to_string(),
        }))
    }
}

fn write_anchor_bank(dir: &Path) {
    std::fs::write(
        dir.join("purchase_intent_en.yml"),
        "version: \"1.0\"\nintent: purchase_intent\nanchor_sets:\n  - id: words\n    anchors:\n      1: one\n      2: two\n      3: three\n      4: four\n      5: five\n",
    )
    .unwrap();
}

fn simulator(dir: &Path, generator: Arc<dyn RationaleGenerator>) -> Simulator {
    write_anchor_bank(dir);
    let settings = Settings {
        anchor_bank_path: dir.to_path_buf(),
        persona_library_path: dir.join("personas"),
        max_concurrency: 4,
        ..Default::default()
    };
    Simulator::new(settings, Arc::new(WordEmbedder::new("word-count")), vec![generator])
}

fn request(personas: Vec<PersonaSpec>) -> SimulationRequest {
    let mut req = SimulationRequest::new(ConceptInput::from_text("Refillable toothpaste tablets"));
    req.personas = personas;
    req
}

#[tokio::test]
async fn single_persona_five_draws() {
    let dir = tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::default());
    let sim = simulator(dir.path(), generator.clone());

    let mut req = request(vec![PersonaSpec::named("Fan")]);
    req.options.n = Some(5);
    let resp = sim.run_simulation(&req).await.unwrap();

    assert_eq!(resp.aggregate.sample_n, 5);
    assert_eq!(resp.aggregate.ratings, vec![1, 2, 3, 4, 5]);
    let total: f64 = resp.aggregate.pmf.iter().sum();
    assert!((total - 1.0).abs() < 1e-5);
    assert!(resp.aggregate.mean > 4.99);
    assert!(resp.aggregate.top2box > 0.99);

    assert_eq!(resp.personas.len(), 1);
    let fan = &resp.personas[0];
    assert_eq!(fan.rationales.len(), 5);
    assert_eq!(fan.themes[0], "definitely");
    assert_eq!(fan.question_results.len(), 1);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 5);

    assert_eq!(resp.metadata["run_id"].len(), 36);
    assert_eq!(resp.metadata["draw_allocation"], "5");
    assert_eq!(resp.metadata["persona_total"], "1");
    assert_eq!(resp.metadata["question_count"], "1");
    assert_eq!(resp.metadata["dropped_buckets"], "0");
    assert_eq!(resp.metadata["intent"], "purchase_intent");
    assert_eq!(
        resp.metadata["question"],
        "How likely would you be to purchase this product?"
    );
    assert_eq!(resp.metadata["ci_mean_lower"], resp.metadata["ci_mean_upper"]);
}

#[tokio::test]
async fn stratified_allocation_and_weighted_aggregate() {
    let dir = tempdir().unwrap();
    let sim = simulator(dir.path(), Arc::new(ScriptedGenerator::default()));

    let mut req = request(vec![
        PersonaSpec::named("Fan").with_weight(3.0),
        PersonaSpec::named("Skeptic").with_weight(1.0),
    ]);
    req.options.total_n = Some(10);
    req.options.stratified = true;
    let resp = sim.run_simulation(&req).await.unwrap();

    assert_eq!(resp.metadata["draw_allocation"], "8,2");
    assert_eq!(resp.aggregate.sample_n, 10);
    assert!((resp.aggregate.mean - 4.25).abs() < 1e-3);

    let lower: f64 = resp.metadata["ci_mean_lower"].parse().unwrap();
    let upper: f64 = resp.metadata["ci_mean_upper"].parse().unwrap();
    assert!(lower <= upper);
    assert!(lower >= 1.99 && upper <= 5.01);

    let skeptic = &resp.personas[1];
    assert_eq!(skeptic.distribution.sample_n, 2);
    assert!((skeptic.persona.weight - 0.25).abs() < 1e-9);
}

#[tokio::test]
async fn extra_questions_run_as_separate_rounds() {
    let dir = tempdir().unwrap();
    let sim = simulator(dir.path(), Arc::new(ScriptedGenerator::default()));

    let mut req = request(vec![PersonaSpec::named("Fan")]);
    req.options.n = Some(2);
    req.questions = vec!["Would you recommend it to a friend?".into()];
    let resp = sim.run_simulation(&req).await.unwrap();

    assert_eq!(resp.questions.len(), 2);
    assert_eq!(resp.questions[1].question, "Would you recommend it to a friend?");
    assert!((resp.questions[1].aggregate.mean - 3.0).abs() < 1e-3);
    assert!(resp.aggregate.mean > 4.99);

    let fan = &resp.personas[0];
    assert_eq!(fan.question_results.len(), 2);
    assert_eq!(fan.question_results[1].rationales[0], "I would say three for a friend");
}

#[tokio::test]
async fn seeds_advance_per_draw() {
    let dir = tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::default());
    let sim = simulator(dir.path(), generator.clone());

    let mut req = request(vec![PersonaSpec::named("Fan")]);
    req.options.n = Some(3);
    req.options.seed = Some(100);
    sim.run_simulation(&req).await.unwrap();

    let mut seeds = generator.seeds.lock().unwrap().clone();
    seeds.sort();
    assert_eq!(seeds, vec![Some(100), Some(101), Some(102)]);
}

#[tokio::test]
async fn empty_population_falls_back_to_general_consumer() {
    let dir = tempdir().unwrap();
    let sim = simulator(dir.path(), Arc::new(ScriptedGenerator::default()));

    let mut req = request(Vec::new());
    req.options.n = Some(1);
    let resp = sim.run_simulation(&req).await.unwrap();

    assert_eq!(resp.personas.len(), 1);
    assert_eq!(resp.personas[0].persona.name, "General Consumer");
    assert_eq!(resp.metadata["persona_summary"], "General Consumer");
}

#[tokio::test]
async fn second_failure_aborts_the_request() {
    let dir = tempdir().unwrap();
    let broken = Arc::new(BrokenGenerator {
        calls: AtomicUsize::new(0),
    });
    let sim = simulator(dir.path(), broken.clone());

    let mut req = request(vec![PersonaSpec::named("Fan")]);
    req.options.n = Some(1);
    let err = sim.run_simulation(&req).await.unwrap_err();

    match err {
        SimulationError::Elicitation(ElicitationError::Failed {
            persona, provider, ..
        }) => {
            assert_eq!(persona, "Fan");
            assert_eq!(provider, "broken");
        }
        other => panic!("expected elicitation failure, got {other:?}"),
    }
    assert_eq!(broken.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn missing_anchor_bank_is_reported() {
    let dir = tempdir().unwrap();
    let sim = simulator(dir.path(), Arc::new(ScriptedGenerator::default()));

    let mut req = request(vec![PersonaSpec::named("Fan")]);
    req.options.n = Some(1);
    req.options.anchor_bank = "does_not_exist.yml".into();
    let err = sim.run_simulation(&req).await.unwrap_err();
    assert!(matches!(err, SimulationError::Rater(_)));
}

#[tokio::test]
async fn request_picks_the_rationale_model() {
    let dir = tempdir().unwrap();
    let sim = simulator(
        dir.path(),
        Arc::new(RoutedGenerator {
            model: "plain/v1".into(),
        }),
    );

    let mut req = request(vec![PersonaSpec::named("Fan")]);
    req.options.n = Some(2);
    let default_run = sim.run_simulation(&req).await.unwrap();
    assert!((default_run.aggregate.mean - 2.0).abs() < 1e-3);
    assert!(!default_run.metadata.contains_key("model"));

    req.options.model = Some("upbeat/v2".into());
    let routed = sim.run_simulation(&req).await.unwrap();
    assert!(routed.aggregate.mean > 4.99);
    assert_eq!(routed.metadata["model"], "upbeat/v2");
}

#[tokio::test]
async fn model_override_needs_a_switchable_generator() {
    let dir = tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::default());
    let sim = simulator(dir.path(), generator.clone());

    let mut req = request(vec![PersonaSpec::named("Fan")]);
    req.options.n = Some(1);
    req.options.model = Some("openai/gpt-5".into());
    let err = sim.run_simulation(&req).await.unwrap_err();
    assert!(matches!(err, SimulationError::Invalid(_)), "{err:?}");
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn request_picks_the_embedding_model() {
    let dir = tempdir().unwrap();
    let sim = simulator(dir.path(), Arc::new(ScriptedGenerator::default()));

    let mut req = request(vec![PersonaSpec::named("Fan")]);
    req.options.n = Some(1);
    let default_run = sim.run_simulation(&req).await.unwrap();
    assert_eq!(default_run.metadata["embedding_model"], "word-count");

    req.options.embedding_model = Some("word-count-large".into());
    let resp = sim.run_simulation(&req).await.unwrap();
    assert_eq!(resp.metadata["embedding_model"], "word-count-large");
    assert!(resp.aggregate.mean > 4.99);
    assert_eq!(sim.raters().len(), 2);
}
