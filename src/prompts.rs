//! Prompt rendering for rationale elicitation and persona synthesis, plus
//! lenient JSON extraction from model replies.

use serde::de::IgnoredAny;

use crate::gateway::Message;
use crate::persona::{PersonaGenerationTask, PersonaSpec};

/// Rendered prompt ready for a chat model.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: Option<String>,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(&self.user));
        messages
    }

    /// Text that identifies this prompt for caching.
    pub fn cache_text(&self) -> String {
        match &self.system {
            Some(system) => format!("{system}\n\n{}", self.user),
            None => self.user.clone(),
        }
    }
}

const RATIONALE_PREAMBLE: &str = "You are roleplaying as a consumer in a concept test. \
Answer concisely in 1-2 sentences. Be realistic and grounded. \
Avoid numerical ratings or Likert numbers. \
Always respond with valid JSON of the form {\"rationale\": \"...\"}.";

/// Roleplay prompt asking `persona` to react to a stimulus. A seed adds a
/// `Response ID` line so repeated draws are distinct prompts.
pub fn render_rationale_prompt(
    persona: &PersonaSpec,
    prompt_block: &str,
    question: &str,
    seed: Option<u64>,
) -> PromptInstance {
    let mut user = String::new();
    user.push_str(RATIONALE_PREAMBLE);
    user.push_str("\n\n");
    user.push_str(&format!(
        "Persona: {} ({}).\n",
        persona.name,
        persona.describe()
    ));
    if !persona.context.is_empty() {
        user.push_str("Context:\n");
        for chunk in &persona.context {
            user.push_str(&format!("- {chunk}\n"));
        }
    }
    user.push_str(&format!("Stimulus:\n{}\n\n", prompt_block.trim()));
    user.push_str(&format!("Question: {question}\n"));
    if let Some(seed) = seed {
        user.push_str(&format!("Response ID: {seed}\n"));
    }
    user.push_str("Return only the JSON object.");

    PromptInstance {
        template_slug: "concept_rationale_v1",
        system: None,
        user,
    }
}

const PERSONA_SYSTEM: &str =
    "You are a senior insights researcher crafting richly detailed personas.";

pub fn render_persona_generation_prompt(task: &PersonaGenerationTask) -> PromptInstance {
    let templates: Vec<serde_json::Value> = task
        .templates
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name.clone().unwrap_or_default(),
                "age": t.age.clone().unwrap_or_default(),
                "region": t.region.clone().unwrap_or_default(),
                "descriptors": t.descriptors,
                "habits": t.habits,
                "motivations": t.motivations,
                "pain_points": t.pain_points,
                "preferred_channels": t.preferred_channels,
                "weight": t.weight,
            })
        })
        .collect();
    let payload = serde_json::json!({
        "prompt": task.prompt,
        "count": task.count,
        "templates": templates,
        "attributes": task.attributes,
    });

    let user = format!(
        "Synthesize realistic consumer personas for the described audience. \
Return a JSON object with a \"personas\" array where each persona is an object with keys \
name, age, gender, income, region, occupation, education, household, \
purchase_frequency, usage_context, background, habits, motivations, \
pain_points, preferred_channels, descriptors, notes, source, weight. \
Weights should be proportional but do not need to sum to one. \
Use the provided prompt, attribute hints, and optional templates. \
Ensure the output is valid JSON only. Input context:\n{payload}"
    );

    PromptInstance {
        template_slug: "persona_synthesis_v1",
        system: Some(PERSONA_SYSTEM.to_string()),
        user,
    }
}

/// First complete JSON object or array in `raw`, or the trimmed input when
/// none parses. Models often wrap JSON in prose or code fences.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    for (start, _) in trimmed.match_indices(['{', '[']) {
        let tail = &trimmed[start..];
        let mut values = serde_json::Deserializer::from_str(tail).into_iter::<IgnoredAny>();
        if let Some(Ok(_)) = values.next() {
            return &tail[..values.byte_offset()];
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rationale_prompt_layout() {
        let persona = PersonaSpec {
            age: Some("25-44".into()),
            context: vec!["Prefers refills".into()],
            ..PersonaSpec::named("Ana")
        };
        let prompt = render_rationale_prompt(&persona, "Product: Mint Paste", "Would you buy?", Some(7));
        assert!(prompt.system.is_none());
        assert!(prompt.user.starts_with("You are roleplaying as a consumer"));
        assert!(prompt.user.contains("Persona: Ana (age 25-44).\n"));
        assert!(prompt.user.contains("Context:\n- Prefers refills\n"));
        assert!(prompt.user.contains("Stimulus:\nProduct: Mint Paste\n\nQuestion: Would you buy?\n"));
        assert!(prompt.user.contains("Response ID: 7\n"));
        assert!(prompt.user.ends_with("Return only the JSON object."));
        assert_eq!(prompt.to_messages().len(), 1);
    }

    #[test]
    fn seedless_prompt_has_no_response_id() {
        let prompt = render_rationale_prompt(&PersonaSpec::named("Ben"), "x", "q", None);
        assert!(!prompt.user.contains("Response ID"));
    }

    #[test]
    fn extract_json_skips_prose_and_braces_in_strings() {
        assert_eq!(
            extract_json("Sure! {\"rationale\": \"a {b} c\"} thanks"),
            "{\"rationale\": \"a {b} c\"}"
        );
        assert_eq!(extract_json("```json\n[1, [2]]\n```"), "[1, [2]]");
        assert_eq!(extract_json("  plain text "), "plain text");
        assert_eq!(extract_json("{broken [\"ok\"]"), "[\"ok\"]");
    }
}
