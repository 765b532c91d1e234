//! Client-facing stream sink.

use crate::dialogue::TurnResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error category reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedRequest,
    TurnInProgress,
    GenerationFailure,
    SchemaError,
    StorageError,
    /// Transport-side fault, such as a frame that could not be encoded
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedRequest => "malformed_request",
            ErrorKind::TurnInProgress => "turn_in_progress",
            ErrorKind::GenerationFailure => "generation_failure",
            ErrorKind::SchemaError => "schema_error",
            ErrorKind::StorageError => "storage_error",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The receiving side is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream sink closed")]
pub struct SinkClosed;

/// A memory write that could not be committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryWriteFailure {
    /// Position in the payload's `memory_writes`
    pub index: usize,
    pub message: String,
}

/// Transport-agnostic delivery of a turn to its client.
///
/// `emit_token` may suspend when the client applies backpressure. Any method
/// returning `SinkClosed` means the client is gone.
#[async_trait]
pub trait StreamSink: Send {
    async fn emit_token(&mut self, text: &str) -> Result<(), SinkClosed>;

    async fn emit_error(&mut self, kind: ErrorKind, detail: &str) -> Result<(), SinkClosed>;

    async fn emit_complete(
        &mut self,
        result: &TurnResult,
        memory_failures: &[MemoryWriteFailure],
    ) -> Result<(), SinkClosed>;
}
