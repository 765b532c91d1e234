//! Parley Traits - Shared contracts between the dialogue core and its
//! collaborators.
//!
//! This crate provides the narrow interfaces the turn orchestrator talks to:
//! - Dialogue payload types (`TurnResult`, `Emotion`, `StyleTag`, ...)
//! - `MemoryStore` for ranked, partitioned memory retrieval and appends
//! - `GenerationAdapter` for the external token-producing capability
//! - `StreamSink` for transport-agnostic delivery to the client
//! - `ValidationError` field violations shared by every validator

pub mod dialogue;
pub mod generation;
pub mod memory;
pub mod sink;
pub mod validation;

// ── Top-level re-exports ─────────────────────────────────────────────

pub use dialogue::{
    BehaviorDirective, Emotion, MAX_EVENTS, MAX_MEMORY_WRITES, MAX_STYLE_TAGS,
    MAX_UTTERANCE_CHARS, MemoryWrite, PublicEvent, StyleTag, TurnResult,
};
pub use generation::{
    ComposedContext, FailureReason, GenerationAdapter, GenerationEvent, GenerationFailure,
    GenerationStream, SamplingParams,
};
pub use memory::{
    MAX_KEY_CHARS, MAX_MEMORY_KEYS, MAX_MEMORY_TEXT_CHARS, MAX_SALIENCE, MAX_TIMESTAMP_MS,
    MemoryEntry, MemoryStore, NewMemory, PartitionKey, StoreError,
};
pub use sink::{ErrorKind, MemoryWriteFailure, SinkClosed, StreamSink};
pub use validation::{ValidationError, char_len, describe};
