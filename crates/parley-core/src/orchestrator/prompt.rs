//! Generation context composition.
//!
//! Persona and situation are rendered generically: object keys become
//! labelled lines, arrays are joined, and nothing is interpreted.

use parley_traits::{
    BehaviorDirective, ComposedContext, Emotion, MAX_EVENTS, MAX_KEY_CHARS, MAX_MEMORY_KEYS,
    MAX_MEMORY_TEXT_CHARS, MAX_MEMORY_WRITES, MAX_SALIENCE, MAX_STYLE_TAGS,
    MAX_UTTERANCE_CHARS, MemoryEntry, SamplingParams, StyleTag,
};
use serde_json::{Map, Value, json};
use std::fmt::Write;

use crate::models::ConversationContext;

pub const SYSTEM_INSTRUCTION: &str = "\
You are the dialogue brain of a character living inside a medieval-fantasy world.

HARD RULES:
- Stay in-world. Never mention models, prompts, APIs or the real world.
- Speak in 1-3 sentences, at most 320 characters of spoken text.
- Use the situation only when it is relevant and never invent past events.
- No slurs, sexual content or self-harm advice.
- Reply with JSON matching the response schema and nothing else.

PERSONALITY:
- Follow the persona's values, quirks and backstory.
- Let the chosen emotion shape the wording (angry is curt, happy is warm).
- Keep continuity with the retrieved memories.

ACTIONS:
- Negative reputation calls for a guarded or hostile stance.
- Reputation above 10 calls for a warm and helpful stance.
- Wrongdoing maps to call_guard or step_back, kindness to open_shop or give_item.

MEMORY:
- Write at most one memory_writes entry per turn.
- Only record notable interactions (salience 1 or higher).
";

const STYLE_HINTS: &str = "\
- Pick the emotion that fits the subtext.
- Match tone to reputation: guarded below 0, warm above 10.
- Severe wrongdoing: call_guard or step_back. Kindness: open_shop or give_item.
- Add at most one memory_writes entry, only if something notable happened.
- voice_hint: prefer a calm delivery unless the moment calls for more.";

/// Response schema in the OpenAPI subset the generation endpoint accepts.
pub fn response_schema() -> Value {
    let emotions: Vec<&str> = Emotion::ALL.iter().map(|e| e.as_str()).collect();
    let directives: Vec<&str> = BehaviorDirective::ALL.iter().map(|d| d.as_str()).collect();
    let styles: Vec<&str> = StyleTag::ALL.iter().map(|t| t.as_str()).collect();

    json!({
        "type": "OBJECT",
        "required": ["utterance", "emotion", "behavior_directive"],
        "properties": {
            "utterance": {
                "type": "STRING",
                "description": format!("Spoken reply, 1-3 sentences, at most {MAX_UTTERANCE_CHARS} characters")
            },
            "emotion": { "type": "STRING", "enum": emotions },
            "style_tags": {
                "type": "ARRAY",
                "maxItems": MAX_STYLE_TAGS,
                "items": { "type": "STRING", "enum": styles }
            },
            "behavior_directive": { "type": "STRING", "enum": directives },
            "memory_writes": {
                "type": "ARRAY",
                "maxItems": MAX_MEMORY_WRITES,
                "items": {
                    "type": "OBJECT",
                    "required": ["salience", "text"],
                    "properties": {
                        "salience": {
                            "type": "INTEGER",
                            "minimum": 0,
                            "maximum": MAX_SALIENCE,
                            "description": "0 = trivial, 3 = critical"
                        },
                        "text": {
                            "type": "STRING",
                            "description": format!("What to remember, at most {MAX_MEMORY_TEXT_CHARS} characters")
                        },
                        "keys": {
                            "type": "ARRAY",
                            "maxItems": MAX_MEMORY_KEYS,
                            "items": {
                                "type": "STRING",
                                "description": format!("Search keyword, at most {MAX_KEY_CHARS} characters")
                            }
                        },
                        "private": { "type": "BOOLEAN" }
                    }
                }
            },
            "public_events": {
                "type": "ARRAY",
                "maxItems": MAX_EVENTS,
                "items": {
                    "type": "OBJECT",
                    "required": ["event_type"],
                    "properties": {
                        "event_type": { "type": "STRING" }
                    }
                }
            },
            "voice_hint": {
                "type": "OBJECT",
                "properties": {
                    "voice_preset": { "type": "STRING" },
                    "ssml_style": { "type": "STRING" }
                }
            }
        }
    })
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(render_scalar)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null => "none".to_string(),
        other => other.to_string(),
    }
}

fn render_object(map: &Map<String, Value>, separator: &str, out: &mut String) {
    for (key, value) in map {
        let _ = writeln!(out, "{key}{separator}{}", render_scalar(value));
    }
}

fn render_persona(persona: &Value, out: &mut String) {
    match persona {
        Value::Object(map) if !map.is_empty() => render_object(map, ": ", out),
        Value::Null | Value::Object(_) => out.push_str("(unspecified)\n"),
        other => {
            let _ = writeln!(out, "{}", render_scalar(other));
        }
    }
}

/// Build the user prompt with its fixed section order.
pub fn render_prompt(context: &ConversationContext, memories: &[MemoryEntry]) -> String {
    let mut out = String::new();

    out.push_str("[PERSONA]\n");
    render_persona(&context.persona, &mut out);

    out.push_str("\n[CONTEXT]\n");
    if context.situation.is_empty() {
        out.push_str("(no situational details)\n");
    } else {
        render_object(&context.situation, "=", &mut out);
    }

    out.push_str("\n[RETRIEVED_MEMORY]\n");
    if memories.is_empty() {
        out.push_str("- (No prior memories)\n");
    }
    for memory in memories {
        let _ = writeln!(out, "- (salience {}) {}", memory.salience, memory.text);
    }

    out.push_str("\n[PLAYER_TEXT]\n");
    let _ = writeln!(out, "\"{}\"", context.input_text);

    out.push_str("\n[STYLE & ACTION HINTS]\n");
    out.push_str(STYLE_HINTS);
    out.push('\n');

    out
}

pub fn compose(
    context: &ConversationContext,
    memories: &[MemoryEntry],
    sampling: SamplingParams,
) -> ComposedContext {
    ComposedContext {
        subject: context.subject.clone(),
        counterpart: context.counterpart.clone(),
        system_instruction: SYSTEM_INSTRUCTION.to_string(),
        prompt: render_prompt(context, memories),
        response_schema: Some(response_schema()),
        sampling,
        memory_count: memories.len(),
    }
}
