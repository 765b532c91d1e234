//! Dialogue payload types.
//!
//! `TurnResult` is the normalized terminal payload a turn hands to the client
//! once validation has passed. The raw payload produced by the generation
//! capability is plain JSON until the core validator turns it into one of
//! these.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Upper bound for the spoken utterance, in characters.
pub const MAX_UTTERANCE_CHARS: usize = 320;
/// Maximum number of style tags on one result.
pub const MAX_STYLE_TAGS: usize = 3;
/// Maximum number of memory writes requested by one turn.
pub const MAX_MEMORY_WRITES: usize = 2;
/// Maximum number of broadcast events on one result.
pub const MAX_EVENTS: usize = 1;

/// Emotional state attached to an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    Neutral,
    Happy,
    Angry,
    Fear,
    Sad,
    Surprised,
    Disgust,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Angry,
        Emotion::Fear,
        Emotion::Sad,
        Emotion::Surprised,
        Emotion::Disgust,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Angry => "angry",
            Emotion::Fear => "fear",
            Emotion::Sad => "sad",
            Emotion::Surprised => "surprised",
            Emotion::Disgust => "disgust",
        }
    }

    /// Resolve a wire value. Only the exact lower-case name matches.
    pub fn from_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|emotion| emotion.as_str() == value)
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action the speaking party should perform after the utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorDirective {
    None,
    Approach,
    StepBack,
    Flee,
    Attack,
    CallGuard,
    GiveItem,
    StartQuest,
    OpenShop,
    HealPlayer,
}

impl BehaviorDirective {
    pub const ALL: [BehaviorDirective; 10] = [
        BehaviorDirective::None,
        BehaviorDirective::Approach,
        BehaviorDirective::StepBack,
        BehaviorDirective::Flee,
        BehaviorDirective::Attack,
        BehaviorDirective::CallGuard,
        BehaviorDirective::GiveItem,
        BehaviorDirective::StartQuest,
        BehaviorDirective::OpenShop,
        BehaviorDirective::HealPlayer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BehaviorDirective::None => "none",
            BehaviorDirective::Approach => "approach",
            BehaviorDirective::StepBack => "step_back",
            BehaviorDirective::Flee => "flee",
            BehaviorDirective::Attack => "attack",
            BehaviorDirective::CallGuard => "call_guard",
            BehaviorDirective::GiveItem => "give_item",
            BehaviorDirective::StartQuest => "start_quest",
            BehaviorDirective::OpenShop => "open_shop",
            BehaviorDirective::HealPlayer => "heal_player",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|directive| directive.as_str() == value)
    }
}

impl fmt::Display for BehaviorDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery modifier for the spoken line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StyleTag {
    Formal,
    Casual,
    Whisper,
    Shout,
    Mystical,
    Guarded,
    Teasing,
    Urgent,
}

impl StyleTag {
    pub const ALL: [StyleTag; 8] = [
        StyleTag::Formal,
        StyleTag::Casual,
        StyleTag::Whisper,
        StyleTag::Shout,
        StyleTag::Mystical,
        StyleTag::Guarded,
        StyleTag::Teasing,
        StyleTag::Urgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StyleTag::Formal => "formal",
            StyleTag::Casual => "casual",
            StyleTag::Whisper => "whisper",
            StyleTag::Shout => "shout",
            StyleTag::Mystical => "mystical",
            StyleTag::Guarded => "guarded",
            StyleTag::Teasing => "teasing",
            StyleTag::Urgent => "urgent",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == value)
    }
}

impl fmt::Display for StyleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_private() -> bool {
    true
}

/// A memory the turn asks to persist for the (subject, counterpart) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryWrite {
    pub salience: u8,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    /// Whether only the subject knows this
    #[serde(default = "default_private")]
    pub private: bool,
}

/// A world event other parties may observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicEvent {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

/// Validated terminal payload of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub utterance: String,
    pub emotion: Emotion,
    #[serde(default)]
    pub style_tags: Vec<StyleTag>,
    pub behavior_directive: BehaviorDirective,
    #[serde(default)]
    pub memory_writes: Vec<MemoryWrite>,
    #[serde(default)]
    pub public_events: Vec<PublicEvent>,
    /// Opaque voice-delivery hint, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_hint: Option<Value>,
}
