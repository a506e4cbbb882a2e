//! Blending weighted persona buckets into a single population.

use std::collections::HashMap;

use super::PopulationError;
use crate::persona::PersonaSpec;

const SHARE_TOLERANCE: f64 = 1e-6;

/// Personas from one source plus the share of the population they should
/// hold. `None` takes a proportional part of whatever explicit shares leave.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonaBucket {
    pub personas: Vec<PersonaSpec>,
    pub weight_share: Option<f64>,
}

impl PersonaBucket {
    pub fn new(personas: Vec<PersonaSpec>, weight_share: Option<f64>) -> Self {
        Self {
            personas,
            weight_share,
        }
    }

    pub fn unspecified(personas: Vec<PersonaSpec>) -> Self {
        Self::new(personas, None)
    }

    pub fn with_share(personas: Vec<PersonaSpec>, share: f64) -> Self {
        Self::new(personas, Some(share))
    }

    fn raw_weight(&self) -> f64 {
        self.personas.iter().map(|p| p.weight.max(0.0)).sum()
    }
}

/// Result of blending: the population and how many unspecified buckets had
/// no share left to take.
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub personas: Vec<PersonaSpec>,
    pub dropped_buckets: usize,
}

/// Copies of `personas` rescaled so their weights sum to `target_total`.
/// Negative weights count as zero; an all-zero input splits the target
/// equally.
pub fn ensure_weights(personas: &[PersonaSpec], target_total: f64) -> Vec<PersonaSpec> {
    let mut out: Vec<PersonaSpec> = personas.to_vec();
    if out.is_empty() {
        return out;
    }

    let total: f64 = out.iter().map(|p| p.weight.max(0.0)).sum();
    if total <= 0.0 {
        let each = target_total / out.len() as f64;
        for p in &mut out {
            p.weight = each;
        }
    } else if target_total <= 0.0 {
        for p in &mut out {
            p.weight = 0.0;
        }
    } else {
        let scale = target_total / total;
        for p in &mut out {
            p.weight = p.weight.max(0.0) * scale;
        }
    }
    out
}

/// Name-keyed accumulator that keeps first-seen order.
#[derive(Default)]
struct Combined {
    personas: Vec<PersonaSpec>,
    index: HashMap<String, usize>,
}

impl Combined {
    fn add(&mut self, personas: Vec<PersonaSpec>) {
        for persona in personas {
            match self.index.get(&persona.name) {
                Some(&i) => self.personas[i].weight += persona.weight,
                None => {
                    self.index.insert(persona.name.clone(), self.personas.len());
                    self.personas.push(persona);
                }
            }
        }
    }
}

/// Blends `buckets` and reports dropped buckets.
///
/// Explicit shares are honored exactly and must not sum above 1. Unspecified
/// buckets split the remainder in proportion to their raw weight; if nothing
/// remains they are dropped. Personas with the same name merge by adding
/// weights. The result is rescaled to sum to 1.
pub fn compose_buckets(buckets: &[PersonaBucket]) -> Result<Composition, PopulationError> {
    let (explicit, unspecified): (Vec<&PersonaBucket>, Vec<&PersonaBucket>) =
        buckets.iter().partition(|b| b.weight_share.is_some());

    let explicit_total: f64 = explicit.iter().filter_map(|b| b.weight_share).sum();
    if explicit_total > 1.0 + SHARE_TOLERANCE {
        return Err(PopulationError::ShareOverflow {
            total: explicit_total,
        });
    }

    let mut combined = Combined::default();
    for bucket in &explicit {
        if bucket.personas.is_empty() {
            continue;
        }
        let share = bucket.weight_share.unwrap_or_default();
        combined.add(ensure_weights(&bucket.personas, share));
    }

    let mut dropped_buckets = 0;
    if !unspecified.is_empty() {
        let remaining = (1.0 - explicit_total).max(0.0);
        let raw_total: f64 = unspecified.iter().map(|b| b.raw_weight()).sum();
        if remaining > 0.0 && raw_total > 0.0 {
            for bucket in &unspecified {
                if bucket.personas.is_empty() {
                    continue;
                }
                let share = remaining * bucket.raw_weight() / raw_total;
                combined.add(ensure_weights(&bucket.personas, share));
            }
        } else {
            dropped_buckets = unspecified.len();
            tracing::warn!(
                dropped_buckets,
                explicit_total,
                "no share left for unspecified persona buckets; dropping them"
            );
        }
    }

    let mut personas = combined.personas;
    let total: f64 = personas.iter().map(|p| p.weight).sum();
    if total > 0.0 {
        for p in &mut personas {
            p.weight /= total;
        }
    }

    Ok(Composition {
        personas,
        dropped_buckets,
    })
}

pub fn combine_persona_buckets(
    buckets: &[PersonaBucket],
) -> Result<Vec<PersonaSpec>, PopulationError> {
    compose_buckets(buckets).map(|c| c.personas)
}
