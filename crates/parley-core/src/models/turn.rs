use parley_traits::{PartitionKey, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Inbound turn request as it arrives on the wire.
///
/// Every field is optional at this level so a missing one can be reported
/// by name instead of failing deserialization as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    #[serde(default, alias = "subject_id")]
    pub npc_id: Option<String>,
    #[serde(default, alias = "counterpart_id")]
    pub player_id: Option<String>,
    #[serde(default, alias = "input_text")]
    pub player_text: Option<String>,
    /// Opaque persona descriptor
    #[serde(default)]
    pub persona: Value,
    /// Opaque situational key/value snapshot
    #[serde(default, alias = "situation")]
    pub context: Value,
}

impl TurnRequest {
    pub fn new(
        npc_id: impl Into<String>,
        player_id: impl Into<String>,
        player_text: impl Into<String>,
    ) -> Self {
        Self {
            npc_id: Some(npc_id.into()),
            player_id: Some(player_id.into()),
            player_text: Some(player_text.into()),
            persona: Value::Null,
            context: Value::Null,
        }
    }

    pub fn with_persona(mut self, persona: Value) -> Self {
        self.persona = persona;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Assemble the per-turn context, naming every missing mandatory field.
    pub fn into_context(self) -> Result<ConversationContext, Vec<ValidationError>> {
        let mut errors = Vec::new();

        let subject = required(self.npc_id, "npc_id", &mut errors);
        let counterpart = required(self.player_id, "player_id", &mut errors);
        let input_text = required(self.player_text, "player_text", &mut errors);

        let situation = match self.context {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            _ => {
                errors.push(ValidationError::new("context", "must be a JSON object"));
                Map::new()
            }
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(ConversationContext {
            subject: subject.unwrap_or_default(),
            counterpart: counterpart.unwrap_or_default(),
            input_text: input_text.unwrap_or_default(),
            persona: self.persona,
            situation,
        })
    }
}

fn required(
    value: Option<String>,
    field: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Some(v),
        Some(_) => {
            errors.push(ValidationError::new(field, "must not be blank"));
            None
        }
        None => {
            errors.push(ValidationError::new(field, "is required"));
            None
        }
    }
}

/// Ephemeral per-turn input snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    pub subject: String,
    pub counterpart: String,
    pub input_text: String,
    pub persona: Value,
    pub situation: Map<String, Value>,
}

impl ConversationContext {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.subject.clone(), self.counterpart.clone())
    }
}
