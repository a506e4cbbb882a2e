#![forbid(unsafe_code)]

//! # ssr-harness
//!
//! Synthetic consumer panels scored by semantic similarity.
//!
//! Personas drawn from libraries, CSV tables, filters, generators and direct
//! injections are blended into one weighted population and raked to target
//! marginals. Each persona is asked for free-text rationales about a product
//! concept; every rationale is embedded and compared with calibrated anchor
//! statements to give a probability mass function over a Likert scale. The
//! per-persona pmfs are weighted into a population answer with bootstrap
//! bounds on the mean rating.

pub mod anchors;
pub mod cache;
pub mod concept;
pub mod config;
pub mod elicitation;
pub mod gateway;
pub mod orchestrator;
pub mod panel_context;
pub mod persona;
pub mod population;
pub mod prompts;
pub mod ssr;

pub use anchors::{AnchorBank, AnchorBankCache, AnchorError, AnchorSet};
pub use cache::{RationaleCache, RationaleCacheKey, SqliteRationaleCache};
pub use concept::{ingest_concept, ConceptArtifact, ConceptError, ConceptInput};
pub use config::Settings;
pub use elicitation::{
    generate_batch, ElicitationError, GatewayRationaleGenerator, RationaleGenerator,
    RationaleResult,
};
pub use gateway::{Attribution, ChatGateway, Embedder, ProviderGateway, UsageSink};
pub use orchestrator::{
    allocate_draws, LikertDistribution, Population, SimulationError, SimulationOptions,
    SimulationRequest, SimulationResponse, Simulator,
};
pub use persona::{PersonaError, PersonaLibrary, PersonaSpec};
pub use population::{
    combine_persona_buckets, ensure_weights, rake_personas, PersonaBucket, PopulationError,
    PopulationSpec, RakingConfig, RakingMode,
};
pub use ssr::{likert_metrics, RaterCache, RaterError, SemanticSimilarityRater};
