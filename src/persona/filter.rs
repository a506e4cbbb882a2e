//! Selecting personas from a library by field values and keywords.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{normalize_values, PersonaError, PersonaField, PersonaLibrary, PersonaSpec};

/// Field values are matched case-insensitively: OR within a field, AND across
/// fields. Every keyword must appear in the persona's search blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub include: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub exclude: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_share: Option<f64>,
}

impl PersonaFilter {
    pub fn validate(&self) -> Result<(), PersonaError> {
        if let Some(limit) = self.limit {
            if limit == 0 {
                return Err(PersonaError::invalid("persona filter", "limit must be >= 1"));
            }
        }
        if let Some(share) = self.weight_share {
            if !(0.0..=1.0).contains(&share) {
                return Err(PersonaError::invalid(
                    "persona filter",
                    format!("weight_share must be within [0, 1], got {share}"),
                ));
            }
        }
        for field in self.include.keys() {
            let field: PersonaField = field.parse()?;
            if self
                .exclude
                .keys()
                .filter_map(|k| k.parse::<PersonaField>().ok())
                .any(|f| f == field)
            {
                return Err(PersonaError::invalid(
                    "persona filter",
                    format!("cannot include and exclude the same field {field}"),
                ));
            }
        }
        for field in self.exclude.keys() {
            field.parse::<PersonaField>()?;
        }
        Ok(())
    }
}

struct CompiledRule {
    field: PersonaField,
    values: HashSet<String>,
}

fn compile(rules: &BTreeMap<String, Vec<String>>) -> Result<Vec<CompiledRule>, PersonaError> {
    rules
        .iter()
        .map(|(field, values)| {
            Ok(CompiledRule {
                field: field.parse()?,
                values: normalize_values(values).into_iter().collect(),
            })
        })
        .collect()
}

/// Personas from `library` (restricted to `filter.group` when set) that pass
/// the filter, in library order, capped at `filter.limit`.
pub fn filter_personas(
    library: &PersonaLibrary,
    filter: &PersonaFilter,
) -> Result<Vec<PersonaSpec>, PersonaError> {
    filter.validate()?;
    let candidates = library.list_personas(filter.group.as_deref())?;
    let include = compile(&filter.include)?;
    let exclude = compile(&filter.exclude)?;
    let keywords: Vec<String> = filter
        .keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();

    let mut matches: Vec<PersonaSpec> = candidates
        .into_iter()
        .filter(|persona| {
            include.iter().all(|rule| {
                rule.field
                    .normalized_values(persona)
                    .iter()
                    .any(|v| rule.values.contains(v))
            })
        })
        .filter(|persona| {
            !exclude.iter().any(|rule| {
                rule.field
                    .normalized_values(persona)
                    .iter()
                    .any(|v| rule.values.contains(v))
            })
        })
        .filter(|persona| {
            if keywords.is_empty() {
                return true;
            }
            let blob = persona.search_blob();
            keywords.iter().all(|k| blob.contains(k.as_str()))
        })
        .collect();

    if let Some(limit) = filter.limit {
        matches.truncate(limit);
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: &str = r#"
group: shoppers
personas:
  - name: Ana
    age: 25-44
    region: US
    habits: [coupons, bulk buys]
  - name: Ben
    age: 18-24
    region: US
    background: College student who loves energy drinks
  - name: Cleo
    age: 65+
    region: UK
"#;

    fn library() -> (tempfile::TempDir, PersonaLibrary) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shoppers.yml"), GROUP).unwrap();
        let lib = PersonaLibrary::load(dir.path()).unwrap();
        (dir, lib)
    }

    #[test]
    fn include_is_or_within_field_and_across_fields() {
        let (_dir, lib) = library();
        let filter = PersonaFilter {
            include: BTreeMap::from([
                ("age".to_string(), vec!["25-44".to_string(), "18-24".to_string()]),
                ("region".to_string(), vec!["us".to_string()]),
            ]),
            ..Default::default()
        };
        let names: Vec<String> = filter_personas(&lib, &filter)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Ana", "Ben"]);
    }

    #[test]
    fn exclude_keywords_and_limit() {
        let (_dir, lib) = library();
        let filter = PersonaFilter {
            exclude: BTreeMap::from([("region".to_string(), vec!["UK".to_string()])]),
            keywords: vec!["Student".to_string()],
            ..Default::default()
        };
        let found = filter_personas(&lib, &filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Ben");

        let capped = PersonaFilter {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(filter_personas(&lib, &capped).unwrap().len(), 1);
    }

    #[test]
    fn list_fields_match_any_item() {
        let (_dir, lib) = library();
        let filter = PersonaFilter {
            include: BTreeMap::from([("habits".to_string(), vec!["Coupons".to_string()])]),
            ..Default::default()
        };
        let found = filter_personas(&lib, &filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Ana");
    }

    #[test]
    fn unknown_field_is_rejected() {
        let (_dir, lib) = library();
        let filter = PersonaFilter {
            include: BTreeMap::from([("shoe_size".to_string(), vec!["9".to_string()])]),
            ..Default::default()
        };
        assert!(matches!(
            filter_personas(&lib, &filter),
            Err(PersonaError::UnknownField(_))
        ));
    }
}
