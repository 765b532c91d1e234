//! Terminal payload validation.
//!
//! The generation capability is external, so its payload is checked field by
//! field before anything acts on it. Every check runs even when an earlier
//! one failed; the resulting `SchemaError` lists all violations with paths
//! such as `memory_writes[1].salience`. Unknown top-level fields are dropped
//! during normalization.

use parley_traits::{
    BehaviorDirective, Emotion, MAX_EVENTS, MAX_KEY_CHARS, MAX_MEMORY_KEYS, MAX_MEMORY_TEXT_CHARS,
    MAX_MEMORY_WRITES, MAX_SALIENCE, MAX_STYLE_TAGS, MAX_UTTERANCE_CHARS, MemoryWrite,
    PublicEvent, StyleTag, TurnResult, ValidationError, char_len, describe,
};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("terminal payload failed validation: {}", describe(.violations))]
pub struct SchemaError {
    pub violations: Vec<ValidationError>,
}

impl SchemaError {
    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

/// Stateless validator and normalizer for terminal payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseValidator;

impl ResponseValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, raw: &Value) -> Result<TurnResult, SchemaError> {
        let Some(payload) = raw.as_object() else {
            return Err(SchemaError {
                violations: vec![ValidationError::new("$", "payload must be a JSON object")],
            });
        };

        let mut errors = Vec::new();

        let utterance = check_utterance(field(payload, "utterance"), &mut errors);
        let emotion = check_enum(
            field(payload, "emotion"),
            "emotion",
            Emotion::from_name,
            &Emotion::ALL.map(|e| e.as_str()),
            &mut errors,
        );
        let style_tags = check_style_tags(field(payload, "style_tags"), &mut errors);
        let behavior_directive = check_enum(
            field(payload, "behavior_directive"),
            "behavior_directive",
            BehaviorDirective::from_name,
            &BehaviorDirective::ALL.map(|d| d.as_str()),
            &mut errors,
        );
        let memory_writes = check_memory_writes(field(payload, "memory_writes"), &mut errors);
        let public_events = check_public_events(field(payload, "public_events"), &mut errors);
        let voice_hint = check_voice_hint(field(payload, "voice_hint"), &mut errors);

        match (utterance, emotion, behavior_directive) {
            (Some(utterance), Some(emotion), Some(behavior_directive)) if errors.is_empty() => {
                Ok(TurnResult {
                    utterance,
                    emotion,
                    style_tags,
                    behavior_directive,
                    memory_writes,
                    public_events,
                    voice_hint,
                })
            }
            _ => Err(SchemaError { violations: errors }),
        }
    }
}

/// Field lookup where an explicit `null` counts as absent.
fn field<'a>(payload: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    payload.get(name).filter(|v| !v.is_null())
}

fn check_utterance(value: Option<&Value>, errors: &mut Vec<ValidationError>) -> Option<String> {
    let Some(value) = value else {
        errors.push(ValidationError::new("utterance", "is required"));
        return None;
    };
    let Some(text) = value.as_str() else {
        errors.push(ValidationError::new("utterance", "must be a string"));
        return None;
    };

    let trimmed = text.trim();
    let len = char_len(trimmed);
    if trimmed.is_empty() {
        errors.push(ValidationError::new("utterance", "must not be empty"));
        None
    } else if len > MAX_UTTERANCE_CHARS {
        errors.push(ValidationError::new(
            "utterance",
            format!("must be at most {MAX_UTTERANCE_CHARS} characters, got {len}"),
        ));
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn check_enum<T>(
    value: Option<&Value>,
    name: &str,
    parse: fn(&str) -> Option<T>,
    allowed: &[&str],
    errors: &mut Vec<ValidationError>,
) -> Option<T> {
    let Some(value) = value else {
        errors.push(ValidationError::new(name, "is required"));
        return None;
    };
    let Some(text) = value.as_str() else {
        errors.push(ValidationError::new(name, "must be a string"));
        return None;
    };

    let parsed = parse(text);
    if parsed.is_none() {
        errors.push(ValidationError::new(
            name,
            format!("unknown value '{}', expected one of: {}", text, allowed.join(", ")),
        ));
    }
    parsed
}

/// Optional list field: absent means empty, anything but an array is a violation.
fn as_list<'a>(
    value: Option<&'a Value>,
    name: &str,
    max: usize,
    errors: &mut Vec<ValidationError>,
) -> &'a [Value] {
    let Some(value) = value else {
        return &[];
    };
    let Some(items) = value.as_array() else {
        errors.push(ValidationError::new(name, "must be an array"));
        return &[];
    };
    if items.len() > max {
        errors.push(ValidationError::new(
            name,
            format!("at most {max} items allowed, got {}", items.len()),
        ));
    }
    items
}

fn check_token(
    value: &Value,
    path: &str,
    max_chars: usize,
    errors: &mut Vec<ValidationError>,
) -> Option<String> {
    let Some(text) = value.as_str() else {
        errors.push(ValidationError::new(path, "must be a string"));
        return None;
    };
    let token = text.trim();
    if token.is_empty() {
        errors.push(ValidationError::new(path, "must not be empty"));
        None
    } else if token.chars().any(char::is_whitespace) {
        errors.push(ValidationError::new(path, "must be a single token"));
        None
    } else if char_len(token) > max_chars {
        errors.push(ValidationError::new(
            path,
            format!("must be at most {max_chars} characters"),
        ));
        None
    } else {
        Some(token.to_string())
    }
}

fn check_style_tags(value: Option<&Value>, errors: &mut Vec<ValidationError>) -> Vec<StyleTag> {
    let allowed = StyleTag::ALL.map(|t| t.as_str());
    as_list(value, "style_tags", MAX_STYLE_TAGS, errors)
        .iter()
        .enumerate()
        .filter_map(|(idx, tag)| {
            check_enum(
                Some(tag),
                &format!("style_tags[{idx}]"),
                StyleTag::from_name,
                &allowed,
                errors,
            )
        })
        .collect()
}

fn check_memory_writes(value: Option<&Value>, errors: &mut Vec<ValidationError>) -> Vec<MemoryWrite> {
    let items = as_list(value, "memory_writes", MAX_MEMORY_WRITES, errors);
    let mut writes = Vec::with_capacity(items.len());

    for (idx, item) in items.iter().enumerate() {
        let path = format!("memory_writes[{idx}]");
        let Some(write) = item.as_object() else {
            errors.push(ValidationError::new(path, "must be an object"));
            continue;
        };
        let before = errors.len();

        let salience = match field(write, "salience") {
            None => {
                errors.push(ValidationError::new(format!("{path}.salience"), "is required"));
                None
            }
            Some(v) => match v.as_u64() {
                Some(s) if s <= MAX_SALIENCE as u64 => Some(s as u8),
                Some(s) => {
                    errors.push(ValidationError::new(
                        format!("{path}.salience"),
                        format!("must be between 0 and {MAX_SALIENCE}, got {s}"),
                    ));
                    None
                }
                None => {
                    errors.push(ValidationError::new(
                        format!("{path}.salience"),
                        format!("must be an integer between 0 and {MAX_SALIENCE}"),
                    ));
                    None
                }
            },
        };

        let text = match field(write, "text").map(|v| v.as_str()) {
            None => {
                errors.push(ValidationError::new(format!("{path}.text"), "is required"));
                None
            }
            Some(None) => {
                errors.push(ValidationError::new(format!("{path}.text"), "must be a string"));
                None
            }
            Some(Some(text)) => {
                let text = text.trim();
                let len = char_len(text);
                if text.is_empty() {
                    errors.push(ValidationError::new(format!("{path}.text"), "must not be empty"));
                    None
                } else if len > MAX_MEMORY_TEXT_CHARS {
                    errors.push(ValidationError::new(
                        format!("{path}.text"),
                        format!("must be at most {MAX_MEMORY_TEXT_CHARS} characters, got {len}"),
                    ));
                    None
                } else {
                    Some(text.to_string())
                }
            }
        };

        let keys: Vec<String> = as_list(field(write, "keys"), &format!("{path}.keys"), MAX_MEMORY_KEYS, errors)
            .iter()
            .enumerate()
            .filter_map(|(key_idx, key)| {
                check_token(key, &format!("{path}.keys[{key_idx}]"), MAX_KEY_CHARS, errors)
            })
            .collect();

        let private = match field(write, "private") {
            None => true,
            Some(Value::Bool(flag)) => *flag,
            Some(_) => {
                errors.push(ValidationError::new(format!("{path}.private"), "must be a boolean"));
                true
            }
        };

        if let (Some(salience), Some(text)) = (salience, text)
            && errors.len() == before
        {
            writes.push(MemoryWrite {
                salience,
                text,
                keys,
                private,
            });
        }
    }

    writes
}

fn check_public_events(value: Option<&Value>, errors: &mut Vec<ValidationError>) -> Vec<PublicEvent> {
    let items = as_list(value, "public_events", MAX_EVENTS, errors);
    let mut events = Vec::with_capacity(items.len());

    for (idx, item) in items.iter().enumerate() {
        let path = format!("public_events[{idx}]");
        let Some(event) = item.as_object() else {
            errors.push(ValidationError::new(path, "must be an object"));
            continue;
        };

        let event_type = match field(event, "event_type").map(|v| v.as_str()) {
            Some(Some(t)) if !t.trim().is_empty() => Some(t.trim().to_string()),
            Some(Some(_)) => {
                errors.push(ValidationError::new(format!("{path}.event_type"), "must not be empty"));
                None
            }
            Some(None) => {
                errors.push(ValidationError::new(format!("{path}.event_type"), "must be a string"));
                None
            }
            None => {
                errors.push(ValidationError::new(format!("{path}.event_type"), "is required"));
                None
            }
        };

        let payload = match field(event, "payload") {
            None => Some(None),
            Some(Value::Object(map)) => Some(Some(map.clone())),
            Some(_) => {
                errors.push(ValidationError::new(format!("{path}.payload"), "must be an object"));
                None
            }
        };

        if let (Some(event_type), Some(payload)) = (event_type, payload) {
            events.push(PublicEvent {
                event_type,
                payload,
            });
        }
    }

    events
}

/// The hint is opaque apart from its shape: an object whose known
/// fields, when present, are strings.
fn check_voice_hint(value: Option<&Value>, errors: &mut Vec<ValidationError>) -> Option<Value> {
    let value = value?;
    let Some(hint) = value.as_object() else {
        errors.push(ValidationError::new("voice_hint", "must be an object"));
        return None;
    };

    let mut ok = true;
    for known in ["voice_preset", "ssml_style"] {
        if let Some(v) = field(hint, known)
            && !v.is_string()
        {
            errors.push(ValidationError::new(
                format!("voice_hint.{known}"),
                "must be a string",
            ));
            ok = false;
        }
    }

    ok.then(|| value.clone())
}
