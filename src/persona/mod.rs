//! Persona records, field addressing, and persona sources (library, CSV,
//! filters, generation, expression parsing).

pub mod csv;
pub mod filter;
pub mod generation;
pub mod inputs;
pub mod library;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub use filter::{filter_personas, PersonaFilter};
pub use generation::{
    synthesize_personas, GenerationStrategy, HeuristicPersonaGenerator, LlmPersonaGenerator,
    PersonaGenerationTask, PersonaGenerator,
};
pub use library::{PersonaGroup, PersonaLibrary, PersonaLibraryCache};

#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("unknown persona field {0:?}")]
    UnknownField(String),

    #[error("persona group {name:?} not found in {directory}")]
    NotFound { name: String, directory: PathBuf },

    #[error("duplicate persona group {name:?} in {path}")]
    DuplicateGroup { name: String, path: PathBuf },

    #[error("{source_name}: {message}")]
    Invalid { source_name: String, message: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {source_name}: {source}")]
    Yaml {
        source_name: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to parse {source_name}: {source}")]
    Json {
        source_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse {source_name}: {source}")]
    Csv {
        source_name: String,
        #[source]
        source: ::csv::Error,
    },
}

impl PersonaError {
    pub(crate) fn invalid(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

/// A synthetic respondent. Weight is relative until normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaSpec {
    #[serde(deserialize_with = "de_name")]
    pub name: String,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub income: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub occupation: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub education: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub household: Option<String>,
    #[serde(
        alias = "purchase_freq",
        deserialize_with = "de_opt_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub purchase_frequency: Option<String>,
    #[serde(
        alias = "usage",
        deserialize_with = "de_opt_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub usage_context: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(deserialize_with = "de_list")]
    pub habits: Vec<String>,
    #[serde(deserialize_with = "de_list")]
    pub motivations: Vec<String>,
    #[serde(deserialize_with = "de_list")]
    pub pain_points: Vec<String>,
    #[serde(deserialize_with = "de_list")]
    pub preferred_channels: Vec<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(
        alias = "persona_source",
        deserialize_with = "de_opt_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub source: Option<String>,
    #[serde(alias = "traits", deserialize_with = "de_list")]
    pub descriptors: Vec<String>,
    #[serde(deserialize_with = "de_weight")]
    pub weight: f64,
    /// Context snippets appended by panel context allocation.
    #[serde(deserialize_with = "de_list", skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
}

impl Default for PersonaSpec {
    fn default() -> Self {
        Self {
            name: "persona".to_string(),
            age: None,
            gender: None,
            income: None,
            region: None,
            occupation: None,
            education: None,
            household: None,
            purchase_frequency: None,
            usage_context: None,
            background: None,
            habits: Vec::new(),
            motivations: Vec::new(),
            pain_points: Vec::new(),
            preferred_channels: Vec::new(),
            notes: None,
            source: None,
            descriptors: Vec::new(),
            weight: 1.0,
            context: Vec::new(),
        }
    }
}

impl PersonaSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_field(mut self, field: PersonaField, value: &str) -> Self {
        field.apply(&mut self, value);
        self
    }

    /// The fallback persona injected when no source yields anyone.
    pub fn general_consumer() -> Self {
        Self {
            name: "General Consumer".to_string(),
            descriptors: vec!["broad audience".to_string()],
            ..Default::default()
        }
    }

    /// Comma-joined natural-language description used in prompts.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(age) = &self.age {
            parts.push(format!("age {age}"));
        }
        if let Some(gender) = &self.gender {
            parts.push(gender.clone());
        }
        if let Some(region) = &self.region {
            parts.push(format!("based in {region}"));
        }
        if let Some(income) = &self.income {
            parts.push(format!("income: {income}"));
        }
        if let Some(usage) = &self.usage_context {
            parts.push(format!("usage context: {usage}"));
        }
        if let Some(occupation) = &self.occupation {
            parts.push(format!("occupation: {occupation}"));
        }
        if let Some(education) = &self.education {
            parts.push(format!("education: {education}"));
        }
        if let Some(household) = &self.household {
            parts.push(format!("household: {household}"));
        }
        if let Some(cadence) = &self.purchase_frequency {
            parts.push(format!("purchase cadence: {cadence}"));
        }
        if let Some(background) = &self.background {
            parts.push(background.clone());
        }

        for (label, values) in [
            ("habits", &self.habits),
            ("motivations", &self.motivations),
            ("pain points", &self.pain_points),
            ("preferred channels", &self.preferred_channels),
            ("additional traits", &self.descriptors),
        ] {
            if !values.is_empty() {
                let head: Vec<&str> = values.iter().take(3).map(String::as_str).collect();
                parts.push(format!("{label}: {}", head.join(", ")));
            }
        }

        if let Some(notes) = &self.notes {
            parts.push(notes.clone());
        }

        if parts.is_empty() {
            "a representative consumer".to_string()
        } else {
            parts.join(", ")
        }
    }

    /// Lowercased text that keyword filters search.
    pub fn search_blob(&self) -> String {
        let parts = [
            self.name.clone(),
            self.background.clone().unwrap_or_default(),
            self.notes.clone().unwrap_or_default(),
            self.describe(),
            self.descriptors.join(" "),
            self.habits.join(" "),
            self.motivations.join(" "),
            self.pain_points.join(" "),
            self.preferred_channels.join(" "),
        ];
        parts
            .iter()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    /// Up to four short highlights for run summaries.
    pub fn highlights(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(age) = &self.age {
            out.push(format!("age {age}"));
        }
        if let Some(gender) = &self.gender {
            out.push(gender.clone());
        }
        if let Some(region) = &self.region {
            out.push(region.clone());
        }
        if let Some(income) = &self.income {
            out.push(format!("income {income}"));
        }
        if let Some(occupation) = &self.occupation {
            out.push(occupation.clone());
        }
        for (label, values) in [
            ("habits", &self.habits),
            ("motivations", &self.motivations),
            ("channels", &self.preferred_channels),
        ] {
            if !values.is_empty() {
                let head: Vec<&str> = values.iter().take(2).map(String::as_str).collect();
                out.push(format!("{label}: {}", head.join(", ")));
            }
        }
        out.truncate(4);
        out
    }
}

/// Every persona attribute that filters, raking and attribute overrides can
/// address by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersonaField {
    Name,
    Age,
    Gender,
    Income,
    Region,
    Occupation,
    Education,
    Household,
    PurchaseFrequency,
    UsageContext,
    Background,
    Notes,
    Source,
    Habits,
    Motivations,
    PainPoints,
    PreferredChannels,
    Descriptors,
    Context,
}

impl PersonaField {
    pub const ALL: [PersonaField; 19] = [
        PersonaField::Name,
        PersonaField::Age,
        PersonaField::Gender,
        PersonaField::Income,
        PersonaField::Region,
        PersonaField::Occupation,
        PersonaField::Education,
        PersonaField::Household,
        PersonaField::PurchaseFrequency,
        PersonaField::UsageContext,
        PersonaField::Background,
        PersonaField::Notes,
        PersonaField::Source,
        PersonaField::Habits,
        PersonaField::Motivations,
        PersonaField::PainPoints,
        PersonaField::PreferredChannels,
        PersonaField::Descriptors,
        PersonaField::Context,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PersonaField::Name => "name",
            PersonaField::Age => "age",
            PersonaField::Gender => "gender",
            PersonaField::Income => "income",
            PersonaField::Region => "region",
            PersonaField::Occupation => "occupation",
            PersonaField::Education => "education",
            PersonaField::Household => "household",
            PersonaField::PurchaseFrequency => "purchase_frequency",
            PersonaField::UsageContext => "usage_context",
            PersonaField::Background => "background",
            PersonaField::Notes => "notes",
            PersonaField::Source => "source",
            PersonaField::Habits => "habits",
            PersonaField::Motivations => "motivations",
            PersonaField::PainPoints => "pain_points",
            PersonaField::PreferredChannels => "preferred_channels",
            PersonaField::Descriptors => "descriptors",
            PersonaField::Context => "context",
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(
            self,
            PersonaField::Habits
                | PersonaField::Motivations
                | PersonaField::PainPoints
                | PersonaField::PreferredChannels
                | PersonaField::Descriptors
                | PersonaField::Context
        )
    }

    fn scalar_ref<'a>(&self, persona: &'a PersonaSpec) -> Option<&'a Option<String>> {
        match self {
            PersonaField::Age => Some(&persona.age),
            PersonaField::Gender => Some(&persona.gender),
            PersonaField::Income => Some(&persona.income),
            PersonaField::Region => Some(&persona.region),
            PersonaField::Occupation => Some(&persona.occupation),
            PersonaField::Education => Some(&persona.education),
            PersonaField::Household => Some(&persona.household),
            PersonaField::PurchaseFrequency => Some(&persona.purchase_frequency),
            PersonaField::UsageContext => Some(&persona.usage_context),
            PersonaField::Background => Some(&persona.background),
            PersonaField::Notes => Some(&persona.notes),
            PersonaField::Source => Some(&persona.source),
            _ => None,
        }
    }

    fn list_ref<'a>(&self, persona: &'a PersonaSpec) -> Option<&'a Vec<String>> {
        match self {
            PersonaField::Habits => Some(&persona.habits),
            PersonaField::Motivations => Some(&persona.motivations),
            PersonaField::PainPoints => Some(&persona.pain_points),
            PersonaField::PreferredChannels => Some(&persona.preferred_channels),
            PersonaField::Descriptors => Some(&persona.descriptors),
            PersonaField::Context => Some(&persona.context),
            _ => None,
        }
    }

    /// Raking category: the trimmed scalar value, or `None` for list fields and
    /// missing or blank values.
    pub fn category<'a>(&self, persona: &'a PersonaSpec) -> Option<&'a str> {
        let raw = match self {
            PersonaField::Name => Some(persona.name.as_str()),
            _ => self.scalar_ref(persona)?.as_deref(),
        }?;
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Lowercased, trimmed, non-empty values for filter matching.
    pub fn normalized_values(&self, persona: &PersonaSpec) -> Vec<String> {
        let raw: Vec<&str> = match self.list_ref(persona) {
            Some(list) => list.iter().map(String::as_str).collect(),
            None => self.category(persona).into_iter().collect(),
        };
        normalize_values(raw)
    }

    /// Applies an override: list fields merge the `;`/`,`-separated values
    /// without duplicates, scalar fields take the first value.
    pub fn apply(&self, persona: &mut PersonaSpec, raw: &str) {
        let values = split_values(raw);
        if self.is_list() {
            if values.is_empty() {
                return;
            }
            let target = match self {
                PersonaField::Habits => &mut persona.habits,
                PersonaField::Motivations => &mut persona.motivations,
                PersonaField::PainPoints => &mut persona.pain_points,
                PersonaField::PreferredChannels => &mut persona.preferred_channels,
                PersonaField::Descriptors => &mut persona.descriptors,
                _ => &mut persona.context,
            };
            for value in values {
                if !target.contains(&value) {
                    target.push(value);
                }
            }
            return;
        }

        if let Some(value) = values.into_iter().next() {
            self.set_scalar(persona, value);
        }
    }

    /// Stores `value` verbatim in a scalar field. No-op for list fields.
    pub fn set_scalar(&self, persona: &mut PersonaSpec, value: String) {
        match self {
            PersonaField::Name => persona.name = value,
            PersonaField::Age => persona.age = Some(value),
            PersonaField::Gender => persona.gender = Some(value),
            PersonaField::Income => persona.income = Some(value),
            PersonaField::Region => persona.region = Some(value),
            PersonaField::Occupation => persona.occupation = Some(value),
            PersonaField::Education => persona.education = Some(value),
            PersonaField::Household => persona.household = Some(value),
            PersonaField::PurchaseFrequency => persona.purchase_frequency = Some(value),
            PersonaField::UsageContext => persona.usage_context = Some(value),
            PersonaField::Background => persona.background = Some(value),
            PersonaField::Notes => persona.notes = Some(value),
            PersonaField::Source => persona.source = Some(value),
            _ => {}
        }
    }
}

impl fmt::Display for PersonaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersonaField {
    type Err = PersonaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        let field = match key.as_str() {
            "purchase_freq" => PersonaField::PurchaseFrequency,
            "usage" => PersonaField::UsageContext,
            "persona_source" => PersonaField::Source,
            "traits" => PersonaField::Descriptors,
            other => PersonaField::ALL
                .into_iter()
                .find(|f| f.as_str() == other)
                .ok_or_else(|| PersonaError::UnknownField(s.to_string()))?,
        };
        Ok(field)
    }
}

/// Partial persona used to seed generation; gaps are filled heuristically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaTemplate {
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub income: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub occupation: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub education: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub household: Option<String>,
    #[serde(
        alias = "purchase_freq",
        deserialize_with = "de_opt_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub purchase_frequency: Option<String>,
    #[serde(
        alias = "usage",
        deserialize_with = "de_opt_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub usage_context: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(deserialize_with = "de_list")]
    pub habits: Vec<String>,
    #[serde(deserialize_with = "de_list")]
    pub motivations: Vec<String>,
    #[serde(deserialize_with = "de_list")]
    pub pain_points: Vec<String>,
    #[serde(deserialize_with = "de_list")]
    pub preferred_channels: Vec<String>,
    #[serde(deserialize_with = "de_list")]
    pub descriptors: Vec<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(deserialize_with = "de_opt_scalar", skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl PersonaTemplate {
    pub fn to_persona(&self, fallback_name: &str) -> PersonaSpec {
        PersonaSpec {
            name: self
                .name
                .clone()
                .unwrap_or_else(|| fallback_name.to_string()),
            age: self.age.clone(),
            gender: self.gender.clone(),
            income: self.income.clone(),
            region: self.region.clone(),
            occupation: self.occupation.clone(),
            education: self.education.clone(),
            household: self.household.clone(),
            purchase_frequency: self.purchase_frequency.clone(),
            usage_context: self.usage_context.clone(),
            background: self.background.clone(),
            habits: self.habits.clone(),
            motivations: self.motivations.clone(),
            pain_points: self.pain_points.clone(),
            preferred_channels: self.preferred_channels.clone(),
            notes: self.notes.clone(),
            source: self.source.clone(),
            descriptors: self.descriptors.clone(),
            weight: self
                .weight
                .filter(|w| w.is_finite() && *w > 0.0)
                .unwrap_or(1.0),
            context: Vec::new(),
        }
    }
}

/// Lowercases and trims, dropping blanks.
pub fn normalize_values<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| v.as_ref().trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Splits on `;` or `,`, trimming and dropping blanks.
pub fn split_values(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Splits on `;` only, trimming and dropping blanks.
pub fn split_semicolons(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// LENIENT DESERIALIZERS
// =============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Str(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrString {
    List(Vec<Option<Scalar>>),
    One(Scalar),
}

fn de_opt_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Scalar> = Option::deserialize(deserializer)?;
    Ok(value
        .map(|s| s.into_string().trim().to_string())
        .filter(|s| !s.is_empty()))
}

fn de_name<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(de_opt_scalar(deserializer)?.unwrap_or_else(|| "persona".to_string()))
}

fn de_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<ListOrString> = Option::deserialize(deserializer)?;
    Ok(match value {
        None => Vec::new(),
        Some(ListOrString::One(s)) => split_semicolons(&s.into_string()),
        Some(ListOrString::List(items)) => items
            .into_iter()
            .flatten()
            .map(|s| s.into_string().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    })
}

/// Numbers must be finite and non-negative; unparseable strings and null
/// fall back to 1.0.
fn de_weight<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Scalar> = Option::deserialize(deserializer)?;
    let weight = match value {
        None => 1.0,
        Some(Scalar::Int(i)) => i as f64,
        Some(Scalar::Float(f)) => f,
        Some(Scalar::Str(s)) => s.trim().parse::<f64>().unwrap_or(1.0),
        Some(Scalar::Bool(_)) => 1.0,
    };
    if !weight.is_finite() || weight < 0.0 {
        return Err(serde::de::Error::custom(format!(
            "persona weight must be finite and >= 0, got {weight}"
        )));
    }
    Ok(weight)
}
