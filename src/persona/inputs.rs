//! Compact `key=value;key=value` expressions for filters, generation tasks
//! and injections, and loading population specs from text or files.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use super::{
    GenerationStrategy, PersonaError, PersonaField, PersonaFilter, PersonaGenerationTask,
    PersonaSpec,
};
use crate::population::{PersonaInjection, PopulationSpec};

fn split_commas(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `(key, value)` pairs from a `;`-separated expression. Tokens without `=`
/// are ignored.
fn tokens(expr: &str) -> impl Iterator<Item = (&str, &str)> {
    expr.split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter_map(|t| t.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
}

fn parse_number<T: std::str::FromStr>(what: &str, key: &str, raw: &str) -> Result<T, PersonaError> {
    raw.parse::<T>()
        .map_err(|_| PersonaError::invalid(what, format!("{key} must be a number, got {raw:?}")))
}

/// `group=g;include.age=25-44,18-24;exclude.region=UK;keywords=family;limit=3;share=0.4`
pub fn parse_filter_expression(expr: &str) -> Result<PersonaFilter, PersonaError> {
    const WHAT: &str = "persona-filter expression";
    if expr.trim().is_empty() {
        return Err(PersonaError::invalid(WHAT, "expression cannot be empty"));
    }

    let mut filter = PersonaFilter::default();
    for (key, value) in tokens(expr) {
        if let Some(field) = key.strip_prefix("include.") {
            filter
                .include
                .entry(field.to_string())
                .or_default()
                .extend(split_commas(value));
        } else if let Some(field) = key.strip_prefix("exclude.") {
            filter
                .exclude
                .entry(field.to_string())
                .or_default()
                .extend(split_commas(value));
        } else {
            match key {
                "group" => filter.group = (!value.is_empty()).then(|| value.to_string()),
                "keyword" | "keywords" => {
                    let values = split_commas(value);
                    if values.is_empty() && !value.is_empty() {
                        filter.keywords.push(value.to_string());
                    } else {
                        filter.keywords.extend(values);
                    }
                }
                "limit" => filter.limit = Some(parse_number(WHAT, key, value)?),
                "share" | "weight_share" => {
                    filter.weight_share = Some(parse_number(WHAT, key, value)?)
                }
                _ => {}
            }
        }
    }

    filter.validate()?;
    Ok(filter)
}

/// `prompt=<text>;count=2;strategy=heuristic|llm;share=0.3;attr.region=US`
pub fn parse_generation_expression(expr: &str) -> Result<PersonaGenerationTask, PersonaError> {
    const WHAT: &str = "persona-generation expression";
    if expr.trim().is_empty() {
        return Err(PersonaError::invalid(WHAT, "expression cannot be empty"));
    }

    let mut prompt: Option<String> = None;
    let mut count: Option<usize> = None;
    let mut strategy = GenerationStrategy::Heuristic;
    let mut weight_share = None;
    let mut attributes = BTreeMap::new();

    for (key, value) in tokens(expr) {
        if let Some(field) = key.strip_prefix("attr.") {
            attributes.insert(field.to_string(), value.to_string());
            continue;
        }
        match key {
            "prompt" => prompt = Some(value.to_string()),
            "count" => count = Some(parse_number(WHAT, key, value)?),
            "strategy" | "backend" => strategy = value.parse()?,
            "share" | "weight_share" => weight_share = Some(parse_number(WHAT, key, value)?),
            _ => {}
        }
    }

    let prompt = prompt
        .filter(|p| !p.is_empty())
        .ok_or_else(|| PersonaError::invalid(WHAT, "requires prompt=<text>"))?;

    let task = PersonaGenerationTask {
        prompt,
        count: count.unwrap_or(1),
        strategy,
        weight_share,
        attributes,
        templates: Vec::new(),
    };
    task.validate()?;
    Ok(task)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InjectionPayload {
    Wrapped {
        persona: PersonaSpec,
        #[serde(default)]
        weight_share: Option<f64>,
    },
    Bare(PersonaSpec),
}

/// An injection from a JSON file path, inline JSON (`{"persona": {...},
/// "weight_share": 0.2}` or a bare persona), or `name=X;age=25-44;habits=a,b;share=0.2`.
pub fn parse_injection_payload(expr: &str) -> Result<PersonaInjection, PersonaError> {
    const WHAT: &str = "persona-injection payload";
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(PersonaError::invalid(WHAT, "payload cannot be empty"));
    }

    let path = Path::new(trimmed);
    let json_text = if path.is_file() {
        Some(std::fs::read_to_string(path).map_err(|source| PersonaError::Io {
            path: path.to_path_buf(),
            source,
        })?)
    } else if trimmed.starts_with('{') {
        Some(trimmed.to_string())
    } else {
        None
    };

    let injection = match json_text {
        Some(text) => {
            let payload: InjectionPayload =
                serde_json::from_str(&text).map_err(|source| PersonaError::Json {
                    source_name: WHAT.to_string(),
                    source,
                })?;
            match payload {
                InjectionPayload::Wrapped {
                    persona,
                    weight_share,
                } => PersonaInjection {
                    persona,
                    weight_share,
                },
                InjectionPayload::Bare(persona) => PersonaInjection {
                    persona,
                    weight_share: None,
                },
            }
        }
        None => {
            let mut persona = PersonaSpec::default();
            let mut weight_share = None;
            for (key, value) in tokens(trimmed) {
                match key {
                    "share" | "weight_share" => {
                        weight_share = Some(parse_number(WHAT, key, value)?)
                    }
                    "weight" => {
                        let weight: f64 = parse_number(WHAT, key, value)?;
                        if !weight.is_finite() || weight < 0.0 {
                            return Err(PersonaError::invalid(
                                WHAT,
                                format!("weight must be finite and >= 0, got {weight}"),
                            ));
                        }
                        persona.weight = weight;
                    }
                    _ => {
                        let field: PersonaField = key.parse()?;
                        if field.is_list() {
                            for item in split_commas(value) {
                                field.apply(&mut persona, &item);
                            }
                        } else if !value.is_empty() {
                            // Scalars keep the whole value, commas included.
                            field.set_scalar(&mut persona, value.to_string());
                        }
                    }
                }
            }
            PersonaInjection {
                persona,
                weight_share,
            }
        }
    };

    injection.validate()?;
    Ok(injection)
}

/// A population spec from a file path or inline YAML/JSON text.
pub fn parse_population_spec_input(expr: &str) -> Result<PopulationSpec, PersonaError> {
    const WHAT: &str = "population spec";
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(PersonaError::invalid(WHAT, "input cannot be empty"));
    }

    let path = Path::new(trimmed);
    let (text, source_name) = if path.is_file() {
        let text = std::fs::read_to_string(path).map_err(|source| PersonaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        (text, path.display().to_string())
    } else {
        (expr.to_string(), WHAT.to_string())
    };

    if text.trim().is_empty() {
        return Err(PersonaError::invalid(source_name, "did not contain data"));
    }

    // YAML is a superset of JSON, so one parser covers both.
    let spec: PopulationSpec =
        serde_yaml::from_str(&text).map_err(|source| PersonaError::Yaml {
            source_name: source_name.clone(),
            source,
        })?;
    spec.validate().map_err(|e| PersonaError::invalid(source_name, e.to_string()))?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_expression_fields() {
        let filter = parse_filter_expression(
            "group=shoppers;include.age=25-44, 18-24;keywords=family,budget;limit=3;share=0.4",
        )
        .unwrap();
        assert_eq!(filter.group.as_deref(), Some("shoppers"));
        assert_eq!(filter.include["age"], vec!["25-44", "18-24"]);
        assert_eq!(filter.keywords, vec!["family", "budget"]);
        assert_eq!(filter.limit, Some(3));
        assert_eq!(filter.weight_share, Some(0.4));
    }

    #[test]
    fn filter_include_and_exclude_same_field_fails() {
        let err = parse_filter_expression("include.age=18-24;exclude.age=65+").unwrap_err();
        assert!(err.to_string().contains("include and exclude"));
    }

    #[test]
    fn generation_expression_defaults_count_to_one() {
        let task =
            parse_generation_expression("prompt=eco parents;strategy=openai;attr.region=US;share=0.3")
                .unwrap();
        assert_eq!(task.prompt, "eco parents");
        assert_eq!(task.count, 1);
        assert_eq!(task.strategy, GenerationStrategy::Llm);
        assert_eq!(task.attributes["region"], "US");
        assert_eq!(task.weight_share, Some(0.3));

        assert!(parse_generation_expression("count=2").is_err());
        assert!(parse_generation_expression("prompt=x;strategy=magic").is_err());
    }

    #[test]
    fn injection_from_expression_and_json() {
        let inj = parse_injection_payload("name=Dana;age=25-44;habits=a,b;share=0.2").unwrap();
        assert_eq!(inj.persona.name, "Dana");
        assert_eq!(inj.persona.age.as_deref(), Some("25-44"));
        assert_eq!(inj.persona.habits, vec!["a", "b"]);
        assert_eq!(inj.weight_share, Some(0.2));

        let inj = parse_injection_payload(r#"{"persona": {"name": "Eli"}, "weight_share": 0.1}"#)
            .unwrap();
        assert_eq!(inj.persona.name, "Eli");
        assert_eq!(inj.weight_share, Some(0.1));

        let bare = parse_injection_payload(r#"{"name": "Fay", "region": "US"}"#).unwrap();
        assert_eq!(bare.persona.region.as_deref(), Some("US"));
        assert_eq!(bare.weight_share, None);
    }

    #[test]
    fn population_spec_from_inline_yaml_and_json() {
        let spec = parse_population_spec_input(
            "base_group: shoppers\nmarginals:\n  age:\n    18-24: 0.5\n    25-44: 0.5\nraking:\n  enabled: true\n",
        )
        .unwrap();
        assert_eq!(spec.base_group.as_deref(), Some("shoppers"));
        assert!(spec.raking.enabled);
        assert_eq!(spec.raking.iterations, 20);

        let spec = parse_population_spec_input(r#"{"injections": [{"persona": {"name": "Gus"}}]}"#)
            .unwrap();
        assert_eq!(spec.injections.len(), 1);
    }
}
