//! Generation capability contract.
//!
//! An adapter turns a composed context into a lazy, single-use stream of
//! token events closed by exactly one terminal payload, or by a failure.

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;

/// Sampling parameters forwarded to the capability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_output_tokens: 220,
        }
    }
}

/// Everything the capability needs for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedContext {
    pub subject: String,
    pub counterpart: String,
    pub system_instruction: String,
    pub prompt: String,
    /// JSON schema the terminal payload is asked to follow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(default)]
    pub sampling: SamplingParams,
    /// Number of memories rendered into `prompt`
    #[serde(default)]
    pub memory_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// Partial text, forwarded to the client as-is
    Token(String),
    /// Raw structured payload closing the stream
    Terminal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    IncompleteStream,
    Upstream,
    MalformedPayload,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::IncompleteStream => "incomplete_stream",
            FailureReason::Upstream => "upstream",
            FailureReason::MalformedPayload => "malformed_payload",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("generation failed ({reason}): {detail}")]
pub struct GenerationFailure {
    pub reason: FailureReason,
    pub detail: String,
}

impl GenerationFailure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn incomplete_stream() -> Self {
        Self::new(
            FailureReason::IncompleteStream,
            "stream ended without a terminal payload",
        )
    }

    pub fn upstream(detail: impl Into<String>) -> Self {
        Self::new(FailureReason::Upstream, detail)
    }

    pub fn malformed_payload(detail: impl Into<String>) -> Self {
        Self::new(FailureReason::MalformedPayload, detail)
    }
}

/// Lazy event sequence returned by an adapter.
pub type GenerationStream =
    Pin<Box<dyn Stream<Item = Result<GenerationEvent, GenerationFailure>> + Send>>;

/// External token-producing capability.
///
/// Streams are consumed once. A stream that ends without yielding either a
/// terminal payload or a failure is treated by the caller as
/// `incomplete_stream`.
pub trait GenerationAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn generate(&self, context: ComposedContext) -> GenerationStream;
}
