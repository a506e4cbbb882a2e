//! Iterative proportional fitting over persona weights.

use std::collections::{BTreeMap, HashMap};

use super::{PopulationError, RakingConfig, RakingMode};
use crate::persona::{PersonaField, PersonaSpec};

fn normalize(personas: &mut [PersonaSpec]) {
    let total: f64 = personas.iter().map(|p| p.weight.max(0.0)).sum();
    let total = if total > 0.0 { total } else { 1.0 };
    for p in personas {
        p.weight = p.weight.max(0.0) / total;
    }
}

/// Rakes copies of `personas` toward `marginals` (`field -> category ->
/// target share`), one field at a time for `config.iterations` rounds.
///
/// Personas without a value for a field are left out of that field's
/// totals. Categories in the data but absent from a field's targets keep
/// their weight; a category targeted at 0 is zeroed. Strict mode fails when
/// a positively targeted category has no personas.
pub fn rake_personas(
    personas: &[PersonaSpec],
    marginals: &BTreeMap<String, BTreeMap<String, f64>>,
    config: &RakingConfig,
) -> Result<Vec<PersonaSpec>, PopulationError> {
    let mut out: Vec<PersonaSpec> = personas.to_vec();
    normalize(&mut out);
    if !config.enabled || marginals.is_empty() {
        return Ok(out);
    }
    config.validate()?;

    let targets: Vec<(PersonaField, &BTreeMap<String, f64>)> = marginals
        .iter()
        .map(|(field, cats)| Ok((field.parse::<PersonaField>()?, cats)))
        .collect::<Result<_, PopulationError>>()?;
    let strict = config.mode == RakingMode::Strict;

    for _ in 0..config.iterations {
        for (field, target) in &targets {
            let mut current: HashMap<String, f64> = HashMap::new();
            let mut field_total = 0.0;
            for p in &out {
                if let Some(cat) = field.category(p) {
                    *current.entry(cat.to_string()).or_default() += p.weight;
                    field_total += p.weight;
                }
            }
            if field_total <= 0.0 {
                continue;
            }

            let present: Vec<&String> = current
                .iter()
                .filter(|(_, w)| **w > 0.0)
                .map(|(cat, _)| cat)
                .collect();
            if present.is_empty() {
                continue;
            }

            if strict {
                let missing: Vec<String> = target
                    .iter()
                    .filter(|(cat, share)| **share > 0.0 && !current.get(*cat).is_some_and(|w| *w > 0.0))
                    .map(|(cat, _)| cat.clone())
                    .collect();
                if !missing.is_empty() {
                    return Err(PopulationError::MissingCategories {
                        field: field.to_string(),
                        categories: missing,
                    });
                }
            }

            let target_sum: f64 = present
                .iter()
                .map(|cat| target.get(*cat).copied().unwrap_or(0.0))
                .sum();
            if target_sum <= 0.0 {
                continue;
            }

            let mut adjustments: HashMap<&str, f64> = HashMap::new();
            for cat in &present {
                let Some(share) = target.get(*cat) else {
                    continue;
                };
                let target_share = share / target_sum;
                let current_share = current[*cat] / field_total;
                let factor = if current_share <= 0.0 {
                    if strict && target_share > 0.0 {
                        return Err(PopulationError::EmptyCategory {
                            field: field.to_string(),
                            category: (*cat).clone(),
                        });
                    }
                    1.0
                } else {
                    target_share / current_share
                };
                adjustments.insert(cat.as_str(), factor);
            }

            for p in &mut out {
                let factor = field
                    .category(p)
                    .and_then(|cat| adjustments.get(cat))
                    .copied();
                if let Some(factor) = factor {
                    p.weight *= factor;
                }
            }
            normalize(&mut out);
        }
    }

    normalize(&mut out);
    tracing::debug!(
        personas = out.len(),
        fields = targets.len(),
        iterations = config.iterations,
        "raked persona weights"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aged(name: &str, age: &str, weight: f64) -> PersonaSpec {
        PersonaSpec::named(name)
            .with_field(PersonaField::Age, age)
            .with_weight(weight)
    }

    fn age_targets() -> BTreeMap<String, BTreeMap<String, f64>> {
        BTreeMap::from([(
            "age".to_string(),
            BTreeMap::from([
                ("18-24".to_string(), 0.2),
                ("25-44".to_string(), 0.8),
                ("45-64".to_string(), 0.0),
            ]),
        )])
    }

    #[test]
    fn lenient_raking_hits_targets() {
        let personas = vec![aged("young", "18-24", 0.4), aged("mid", "25-44", 0.6)];
        let out = rake_personas(&personas, &age_targets(), &RakingConfig::enabled(RakingMode::Lenient))
            .unwrap();
        assert!((out[0].weight - 0.2).abs() < 1e-9);
        assert!((out[1].weight - 0.8).abs() < 1e-9);
    }

    #[test]
    fn strict_raking_fails_on_missing_category() {
        let personas = vec![aged("young", "18-24", 0.4), aged("young2", "18-24", 0.6)];
        let err = rake_personas(&personas, &age_targets(), &RakingConfig::enabled(RakingMode::Strict))
            .unwrap_err();
        match err {
            PopulationError::MissingCategories { field, categories } => {
                assert_eq!(field, "age");
                assert_eq!(categories, vec!["25-44"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn disabled_raking_only_normalizes() {
        let personas = vec![aged("a", "18-24", 2.0), aged("b", "25-44", 6.0)];
        let out = rake_personas(&personas, &age_targets(), &RakingConfig::default()).unwrap();
        assert!((out[0].weight - 0.25).abs() < 1e-12);
        assert!((out[1].weight - 0.75).abs() < 1e-12);
    }

    #[test]
    fn personas_without_the_field_keep_relative_weight() {
        let personas = vec![
            aged("young", "18-24", 0.25),
            aged("mid", "25-44", 0.25),
            PersonaSpec::named("unknown").with_weight(0.5),
        ];
        let targets = BTreeMap::from([(
            "age".to_string(),
            BTreeMap::from([("18-24".to_string(), 0.5), ("25-44".to_string(), 0.5)]),
        )]);
        let out = rake_personas(&personas, &targets, &RakingConfig::enabled(RakingMode::Lenient))
            .unwrap();
        assert!((out[2].weight - 0.5).abs() < 1e-9);
        assert!((out[0].weight - out[1].weight).abs() < 1e-9);
    }

    #[test]
    fn two_field_raking_converges() {
        let personas = vec![
            aged("a", "18-24", 1.0).with_field(PersonaField::Region, "US"),
            aged("b", "18-24", 1.0).with_field(PersonaField::Region, "UK"),
            aged("c", "25-44", 1.0).with_field(PersonaField::Region, "US"),
            aged("d", "25-44", 1.0).with_field(PersonaField::Region, "UK"),
        ];
        let targets = BTreeMap::from([
            (
                "age".to_string(),
                BTreeMap::from([("18-24".to_string(), 0.3), ("25-44".to_string(), 0.7)]),
            ),
            (
                "region".to_string(),
                BTreeMap::from([("US".to_string(), 0.6), ("UK".to_string(), 0.4)]),
            ),
        ]);
        let out = rake_personas(&personas, &targets, &RakingConfig::enabled(RakingMode::Lenient))
            .unwrap();
        let young: f64 = out[0].weight + out[1].weight;
        let us: f64 = out[0].weight + out[2].weight;
        assert!((young - 0.3).abs() < 1e-6);
        assert!((us - 0.6).abs() < 1e-6);
    }

    #[test]
    fn unknown_marginal_field_is_rejected() {
        let targets = BTreeMap::from([(
            "shoe_size".to_string(),
            BTreeMap::from([("9".to_string(), 1.0)]),
        )]);
        let err = rake_personas(
            &[PersonaSpec::named("a")],
            &targets,
            &RakingConfig::enabled(RakingMode::Lenient),
        )
        .unwrap_err();
        assert!(matches!(err, PopulationError::Persona(_)));
    }
}
