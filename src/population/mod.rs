//! Population recipes: expanding a [`PopulationSpec`] into weighted persona
//! buckets, blending buckets into one population, and raking it to
//! demographic marginals.

pub mod compose;
pub mod raking;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persona::csv::personas_from_csv_path;
use crate::persona::{
    filter_personas, synthesize_personas, LlmPersonaGenerator, PersonaError, PersonaFilter,
    PersonaGenerationTask, PersonaLibrary, PersonaSpec,
};

pub use compose::{combine_persona_buckets, compose_buckets, ensure_weights, Composition, PersonaBucket};
pub use raking::rake_personas;

pub const DEFAULT_RAKING_ITERATIONS: usize = 20;
pub const MAX_RAKING_ITERATIONS: usize = 200;

#[derive(Debug, Error)]
pub enum PopulationError {
    #[error(transparent)]
    Persona(#[from] PersonaError),

    #[error("explicit weight shares sum to {total:.6}, which exceeds 1.0")]
    ShareOverflow { total: f64 },

    #[error("persona filter {filter} matched no personas")]
    EmptyFilter { filter: String },

    #[error("raking failed: field {field:?} missing categories {categories:?}")]
    MissingCategories { field: String, categories: Vec<String> },

    #[error("raking failed: category {category:?} for field {field:?} has no personas")]
    EmptyCategory { field: String, category: String },

    #[error("invalid population spec: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RakingMode {
    #[default]
    Lenient,
    Strict,
}

fn default_iterations() -> usize {
    DEFAULT_RAKING_ITERATIONS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RakingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: RakingMode,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
}

impl Default for RakingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: RakingMode::Lenient,
            iterations: DEFAULT_RAKING_ITERATIONS,
        }
    }
}

impl RakingConfig {
    pub fn enabled(mode: RakingMode) -> Self {
        Self {
            enabled: true,
            mode,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), PopulationError> {
        if !(1..=MAX_RAKING_ITERATIONS).contains(&self.iterations) {
            return Err(PopulationError::Invalid(format!(
                "raking iterations must be within 1..={MAX_RAKING_ITERATIONS}, got {}",
                self.iterations
            )));
        }
        Ok(())
    }
}

/// A single persona added directly to the population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaInjection {
    pub persona: PersonaSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_share: Option<f64>,
}

impl PersonaInjection {
    pub fn validate(&self) -> Result<(), PersonaError> {
        if let Some(share) = self.weight_share {
            if !(0.0..=1.0).contains(&share) {
                return Err(PersonaError::invalid(
                    format!("persona injection {:?}", self.persona.name),
                    format!("weight_share must be within [0, 1], got {share}"),
                ));
            }
        }
        Ok(())
    }
}

/// Declarative population recipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulationSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_csv_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<PersonaFilter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub generations: Vec<PersonaGenerationTask>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub injections: Vec<PersonaInjection>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub marginals: BTreeMap<String, BTreeMap<String, f64>>,
    pub raking: RakingConfig,
}

impl PopulationSpec {
    pub fn validate(&self) -> Result<(), PopulationError> {
        self.raking.validate()?;
        for filter in &self.filters {
            filter.validate()?;
        }
        for task in &self.generations {
            task.validate()?;
        }
        for injection in &self.injections {
            injection.validate()?;
        }
        for (field, targets) in &self.marginals {
            field.parse::<crate::persona::PersonaField>()?;
            if let Some((category, share)) = targets
                .iter()
                .find(|(_, share)| !share.is_finite() || **share < 0.0)
            {
                return Err(PopulationError::Invalid(format!(
                    "marginal {field}.{category} must be finite and >= 0, got {share}"
                )));
            }
        }
        Ok(())
    }

    /// Short label used in run metadata.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(group) = &self.base_group {
            parts.push(format!("base_group={group}"));
        }
        if let Some(path) = &self.persona_csv_path {
            parts.push(format!("csv={}", path.display()));
        }
        if !self.filters.is_empty() {
            parts.push(format!("filters={}", self.filters.len()));
        }
        if !self.generations.is_empty() {
            parts.push(format!("generations={}", self.generations.len()));
        }
        if !self.injections.is_empty() {
            parts.push(format!("injections={}", self.injections.len()));
        }
        if !self.marginals.is_empty() {
            let fields: Vec<&str> = self.marginals.keys().map(String::as_str).collect();
            parts.push(format!("marginals={}", fields.join(",")));
        }
        if self.raking.enabled {
            parts.push(format!(
                "raking={:?}x{}",
                self.raking.mode, self.raking.iterations
            ));
        }
        if parts.is_empty() {
            "empty".to_string()
        } else {
            parts.join(" ")
        }
    }
}

/// Label for a filter in error messages.
pub(crate) fn describe_filter(filter: &PersonaFilter) -> String {
    serde_json::to_string(filter).unwrap_or_else(|_| format!("{filter:?}"))
}

/// Expands `spec` into buckets in recipe order: base group and CSV with no
/// share, then filters, generations and injections with their own shares.
pub async fn buckets_from_population_spec(
    spec: &PopulationSpec,
    library: &PersonaLibrary,
    llm: Option<&LlmPersonaGenerator>,
) -> Result<Vec<PersonaBucket>, PopulationError> {
    spec.validate()?;
    let mut buckets = Vec::new();

    if let Some(group) = &spec.base_group {
        let personas = library.list_personas(Some(group))?;
        buckets.push(PersonaBucket::unspecified(personas));
    }

    if let Some(path) = &spec.persona_csv_path {
        buckets.push(PersonaBucket::unspecified(personas_from_csv_path(path)?));
    }

    for filter in &spec.filters {
        let personas = filter_personas(library, filter)?;
        if personas.is_empty() {
            return Err(PopulationError::EmptyFilter {
                filter: describe_filter(filter),
            });
        }
        buckets.push(PersonaBucket::new(personas, filter.weight_share));
    }

    for task in &spec.generations {
        let personas = synthesize_personas(task, llm).await?;
        if !personas.is_empty() {
            buckets.push(PersonaBucket::new(personas, task.weight_share));
        }
    }

    for injection in &spec.injections {
        buckets.push(PersonaBucket::new(
            vec![injection.persona.clone()],
            injection.weight_share,
        ));
    }

    tracing::debug!(buckets = buckets.len(), spec = %spec.summary(), "expanded population spec");
    Ok(buckets)
}

/// Expands, blends and rakes `spec` into a normalized population.
pub async fn build_population(
    spec: &PopulationSpec,
    library: &PersonaLibrary,
    llm: Option<&LlmPersonaGenerator>,
) -> Result<Composition, PopulationError> {
    let buckets = buckets_from_population_spec(spec, library, llm).await?;
    if buckets.is_empty() {
        return Err(PopulationError::Invalid(
            "population spec produced no personas; add base_group, filters, generations or injections"
                .into(),
        ));
    }
    let mut composition = compose_buckets(&buckets)?;
    composition.personas = rake_personas(&composition.personas, &spec.marginals, &spec.raking)?;
    Ok(composition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::PersonaField;

    #[test]
    fn raking_config_defaults_and_bounds() {
        let cfg: RakingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RakingConfig::default());
        assert_eq!(cfg.iterations, 20);
        assert!(!cfg.enabled);

        let cfg: RakingConfig =
            serde_json::from_str(r#"{"enabled": true, "mode": "strict", "iterations": 0}"#).unwrap();
        assert_eq!(cfg.mode, RakingMode::Strict);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn spec_validation_rejects_unknown_marginal_field() {
        let spec = PopulationSpec {
            marginals: BTreeMap::from([(
                "shoe_size".to_string(),
                BTreeMap::from([("9".to_string(), 1.0)]),
            )]),
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(PopulationError::Persona(PersonaError::UnknownField(_)))
        ));
    }

    #[tokio::test]
    async fn buckets_follow_recipe_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("shoppers.yml"),
            "group: shoppers\npersonas:\n  - name: Ana\n    age: 25-44\n  - name: Ben\n    age: 18-24\n",
        )
        .unwrap();
        let library = PersonaLibrary::load(dir.path()).unwrap();

        let spec = PopulationSpec {
            base_group: Some("shoppers".into()),
            filters: vec![PersonaFilter {
                include: BTreeMap::from([("age".to_string(), vec!["18-24".to_string()])]),
                weight_share: Some(0.3),
                ..Default::default()
            }],
            injections: vec![PersonaInjection {
                persona: PersonaSpec::named("Cleo"),
                weight_share: Some(0.2),
            }],
            ..Default::default()
        };
        let buckets = buckets_from_population_spec(&spec, &library, None)
            .await
            .unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].weight_share, None);
        assert_eq!(buckets[0].personas.len(), 2);
        assert_eq!(buckets[1].weight_share, Some(0.3));
        assert_eq!(buckets[1].personas[0].name, "Ben");
        assert_eq!(buckets[2].personas[0].name, "Cleo");
    }

    #[tokio::test]
    async fn empty_filter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("g.yml"),
            "personas:\n  - name: Ana\n    region: US\n",
        )
        .unwrap();
        let library = PersonaLibrary::load(dir.path()).unwrap();
        let spec = PopulationSpec {
            filters: vec![PersonaFilter {
                keywords: vec!["astronaut".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = buckets_from_population_spec(&spec, &library, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PopulationError::EmptyFilter { .. }));
    }

    #[tokio::test]
    async fn build_population_rakes_after_blending() {
        let spec = PopulationSpec {
            injections: vec![
                PersonaInjection {
                    persona: PersonaSpec::named("Young").with_field(PersonaField::Age, "18-24"),
                    weight_share: Some(0.5),
                },
                PersonaInjection {
                    persona: PersonaSpec::named("Mid").with_field(PersonaField::Age, "25-44"),
                    weight_share: Some(0.5),
                },
            ],
            marginals: BTreeMap::from([(
                "age".to_string(),
                BTreeMap::from([("18-24".to_string(), 0.25), ("25-44".to_string(), 0.75)]),
            )]),
            raking: RakingConfig::enabled(RakingMode::Lenient),
            ..Default::default()
        };
        let library = PersonaLibrary::empty("unused");
        let composition = build_population(&spec, &library, None).await.unwrap();
        let weights: Vec<f64> = composition.personas.iter().map(|p| p.weight).collect();
        assert!((weights[0] - 0.25).abs() < 1e-6);
        assert!((weights[1] - 0.75).abs() < 1e-6);

        let empty = build_population(&PopulationSpec::default(), &library, None).await;
        assert!(matches!(empty, Err(PopulationError::Invalid(_))));
    }
}
