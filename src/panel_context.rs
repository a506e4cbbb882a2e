//! Panel context: splitting briefing text into snippets and handing them out
//! to personas before elicitation.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::persona::PersonaSpec;

static BULLET_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([-*•]|\d+[.)])\s+").expect("Invalid bullet regex"));
static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n+").expect("Invalid paragraph regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelContextMode {
    /// Every persona gets the first `chunks_per_persona` chunks.
    #[default]
    Shared,
    /// Personas take consecutive chunks, wrapping around.
    RoundRobin,
    /// Each persona draws its own seeded sample.
    Sample,
}

fn default_chunks_per_persona() -> usize {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelContextSpec {
    #[serde(default)]
    pub chunks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub mode: PanelContextMode,
    #[serde(default = "default_chunks_per_persona")]
    pub chunks_per_persona: usize,
}

impl Default for PanelContextSpec {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            text: None,
            mode: PanelContextMode::Shared,
            chunks_per_persona: default_chunks_per_persona(),
        }
    }
}

/// Whitespace-collapsed, non-blank chunks with case-insensitive duplicates
/// removed, first occurrence wins.
fn dedupe_chunks<I, S>(chunks: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for chunk in chunks {
        let text = WHITESPACE.replace_all(chunk.as_ref(), " ").trim().to_string();
        if text.is_empty() {
            continue;
        }
        if seen.insert(text.to_lowercase()) {
            out.push(text);
        }
    }
    out
}

fn json_list_items(text: &str) -> Vec<String> {
    if !text.starts_with('[') {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<serde_json::Value>>(text) {
        Ok(items) => dedupe_chunks(items.into_iter().map(|item| match item {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })),
        Err(_) => Vec::new(),
    }
}

/// Splits free-form text into context chunks. Tries, in order: a JSON list,
/// blank-line separated paragraphs, bullet or numbered lines, `;` parts,
/// and finally the whole text.
pub fn chunk_context_text(text: &str) -> Vec<String> {
    let candidate = text.trim();
    if candidate.is_empty() {
        return Vec::new();
    }

    let parsed = json_list_items(candidate);
    if !parsed.is_empty() {
        return parsed;
    }

    let paragraphs: Vec<&str> = PARAGRAPH_BREAK
        .split(candidate)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.len() > 1 {
        return dedupe_chunks(paragraphs);
    }

    let lines: Vec<&str> = candidate
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.iter().any(|l| BULLET_PREFIX.is_match(l)) {
        return dedupe_chunks(
            lines
                .iter()
                .map(|l| BULLET_PREFIX.replace(l, "").trim().to_string()),
        );
    }

    if candidate.contains(';') {
        return dedupe_chunks(candidate.split(';'));
    }

    dedupe_chunks([candidate])
}

/// Explicit chunks followed by chunks parsed from `text`, deduplicated.
pub fn panel_context_chunks(spec: &PanelContextSpec) -> Vec<String> {
    let mut chunks = spec.chunks.clone();
    if let Some(text) = &spec.text {
        chunks.extend(chunk_context_text(text));
    }
    dedupe_chunks(chunks)
}

fn stable_seed(value: &str) -> u64 {
    let hash = blake3::hash(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(bytes)
}

/// Appends allocated chunks to each persona's context and returns how many
/// chunks were available. Nothing changes when there are no chunks or
/// `chunks_per_persona` is 0.
pub fn apply_panel_context(personas: &mut [PersonaSpec], spec: &PanelContextSpec, seed: u64) -> usize {
    let chunks = panel_context_chunks(spec);
    let per_persona = spec.chunks_per_persona;
    if chunks.is_empty() || per_persona == 0 {
        return chunks.len();
    }

    let extend = |persona: &mut PersonaSpec, picks: &[String]| {
        let merged = persona.context.iter().chain(picks.iter());
        persona.context = dedupe_chunks(merged);
    };

    match spec.mode {
        PanelContextMode::Shared => {
            let assigned = &chunks[..per_persona.min(chunks.len())];
            for persona in personas.iter_mut() {
                extend(persona, assigned);
            }
        }
        PanelContextMode::RoundRobin => {
            let mut cursor = 0;
            for persona in personas.iter_mut() {
                let picks: Vec<String> = (0..per_persona)
                    .map(|i| chunks[(cursor + i) % chunks.len()].clone())
                    .collect();
                cursor += per_persona;
                extend(persona, &picks);
            }
        }
        PanelContextMode::Sample => {
            for (idx, persona) in personas.iter_mut().enumerate() {
                let picks: Vec<String> = if chunks.len() <= per_persona {
                    chunks.clone()
                } else {
                    let mut rng =
                        StdRng::seed_from_u64(stable_seed(&format!("{seed}|{idx}|{}", persona.name)));
                    chunks
                        .choose_multiple(&mut rng, per_persona)
                        .cloned()
                        .collect()
                };
                extend(persona, &picks);
            }
        }
    }

    tracing::debug!(
        chunks = chunks.len(),
        personas = personas.len(),
        mode = ?spec.mode,
        "applied panel context"
    );
    chunks.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_prefers_json_then_paragraphs_then_bullets() {
        assert_eq!(chunk_context_text(r#"["a", "b", "A", 3]"#), vec!["a", "b", "3"]);
        assert_eq!(
            chunk_context_text("First para\nstill first.\n\n  Second   para."),
            vec!["First para still first.", "Second para."]
        );
        assert_eq!(
            chunk_context_text("- price is high\n2) refill packs\n* travel size"),
            vec!["price is high", "refill packs", "travel size"]
        );
        assert_eq!(chunk_context_text("a; b ;a"), vec!["a", "b"]);
        assert_eq!(chunk_context_text("  just one  "), vec!["just one"]);
        assert!(chunk_context_text("   ").is_empty());
    }

    #[test]
    fn shared_mode_gives_everyone_the_head() {
        let mut personas = vec![PersonaSpec::named("a"), PersonaSpec::named("b")];
        let spec = PanelContextSpec {
            chunks: vec!["one".into(), "two".into(), "three".into()],
            ..Default::default()
        };
        assert_eq!(apply_panel_context(&mut personas, &spec, 0), 3);
        assert_eq!(personas[0].context, vec!["one", "two"]);
        assert_eq!(personas[1].context, vec!["one", "two"]);
    }

    #[test]
    fn round_robin_wraps_around() {
        let mut personas = vec![
            PersonaSpec::named("a"),
            PersonaSpec::named("b"),
            PersonaSpec::named("c"),
        ];
        let spec = PanelContextSpec {
            text: Some("x; y; z".into()),
            mode: PanelContextMode::RoundRobin,
            ..Default::default()
        };
        apply_panel_context(&mut personas, &spec, 0);
        assert_eq!(personas[0].context, vec!["x", "y"]);
        assert_eq!(personas[1].context, vec!["z", "x"]);
        assert_eq!(personas[2].context, vec!["y", "z"]);
    }

    #[test]
    fn sample_mode_is_deterministic_per_seed() {
        let spec = PanelContextSpec {
            chunks: (0..10).map(|i| format!("chunk {i}")).collect(),
            mode: PanelContextMode::Sample,
            chunks_per_persona: 3,
            ..Default::default()
        };
        let mut first = vec![PersonaSpec::named("a"), PersonaSpec::named("b")];
        let mut second = first.clone();
        apply_panel_context(&mut first, &spec, 42);
        apply_panel_context(&mut second, &spec, 42);
        assert_eq!(first, second);
        assert_eq!(first[0].context.len(), 3);
    }

    #[test]
    fn zero_per_persona_leaves_personas_alone() {
        let mut personas = vec![PersonaSpec::named("a")];
        let spec = PanelContextSpec {
            chunks: vec!["one".into()],
            chunks_per_persona: 0,
            ..Default::default()
        };
        assert_eq!(apply_panel_context(&mut personas, &spec, 0), 1);
        assert!(personas[0].context.is_empty());
    }
}
