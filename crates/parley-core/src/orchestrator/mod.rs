//! Turn orchestration.
//!
//! One call to [`TurnOrchestrator::run_turn`] drives a single conversational
//! exchange through an explicit state machine:
//!
//! ```text
//! Init -> ContextBuilt -> MemoryRetrieved -> Streaming -> TerminalReceived
//!      -> Validated -> Committed -> Complete
//! ```
//!
//! `Failed` is reachable from every non-terminal state and `Aborted` only
//! from `Streaming`. Every failure is reported to the sink with
//! `emit_error`; failures before `Streaming` leave no side effects behind.
//! Memory commit failures are not turn failures: they travel with the
//! completion signal instead.

pub mod guard;
pub mod prompt;

use futures::StreamExt;
use parley_traits::{
    ErrorKind, GenerationAdapter, GenerationEvent, GenerationFailure, MemoryStore,
    MemoryWriteFailure, NewMemory, PartitionKey, SamplingParams, StoreError, StreamSink,
    TurnResult, ValidationError, describe,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::TurnRequest;
use crate::validator::{ResponseValidator, SchemaError};

pub use guard::{InFlightRegistry, TurnGuard};

/// Number of memories retrieved per turn.
pub const MEMORY_RETRIEVAL_LIMIT: usize = 3;

/// Longest slice of player input that reaches the logs.
const INPUT_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnState {
    Init,
    ContextBuilt,
    MemoryRetrieved,
    Streaming,
    TerminalReceived,
    Validated,
    Committed,
    Complete,
    Failed,
    Aborted,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnState::Complete | TurnState::Failed | TurnState::Aborted
        )
    }

    pub fn can_transition_to(&self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (Init, ContextBuilt)
            | (ContextBuilt, MemoryRetrieved)
            | (MemoryRetrieved, Streaming)
            | (Streaming, TerminalReceived)
            | (Streaming, Aborted)
            | (TerminalReceived, Validated)
            | (Validated, Committed)
            | (Committed, Complete) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Init => "INIT",
            TurnState::ContextBuilt => "CONTEXT_BUILT",
            TurnState::MemoryRetrieved => "MEMORY_RETRIEVED",
            TurnState::Streaming => "STREAMING",
            TurnState::TerminalReceived => "TERMINAL_RECEIVED",
            TurnState::Validated => "VALIDATED",
            TurnState::Committed => "COMMITTED",
            TurnState::Complete => "COMPLETE",
            TurnState::Failed => "FAILED",
            TurnState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum TurnError {
    #[error("malformed request: {}", describe(.0))]
    MalformedRequest(Vec<ValidationError>),

    #[error("a turn is already in progress for {0}")]
    TurnInProgress(PartitionKey),

    #[error(transparent)]
    Generation(#[from] GenerationFailure),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("memory retrieval failed: {0}")]
    Storage(StoreError),
}

impl TurnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TurnError::MalformedRequest(_) => ErrorKind::MalformedRequest,
            TurnError::TurnInProgress(_) => ErrorKind::TurnInProgress,
            TurnError::Generation(_) => ErrorKind::GenerationFailure,
            TurnError::Schema(_) => ErrorKind::SchemaError,
            TurnError::Storage(_) => ErrorKind::StorageError,
        }
    }
}

/// Policy switches for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnPolicy {
    /// Continue with an empty memory set when retrieval fails, instead of
    /// failing the turn before streaming.
    pub degrade_on_retrieval_failure: bool,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self {
            degrade_on_retrieval_failure: true,
        }
    }
}

/// Everything observable about a finished turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn_id: String,
    pub partition: Option<PartitionKey>,
    pub state: TurnState,
    /// Every state the turn passed through, starting with `Init`
    pub transitions: Vec<TurnState>,
    pub result: Option<TurnResult>,
    /// Ids of memories committed by this turn, in payload order
    pub committed: Vec<String>,
    pub memory_failures: Vec<MemoryWriteFailure>,
    pub failure: Option<TurnError>,
    pub tokens_forwarded: usize,
    pub memories_used: usize,
    pub degraded_retrieval: bool,
}

impl TurnOutcome {
    fn new(turn_id: String) -> Self {
        Self {
            turn_id,
            partition: None,
            state: TurnState::Init,
            transitions: vec![TurnState::Init],
            result: None,
            committed: Vec::new(),
            memory_failures: Vec::new(),
            failure: None,
            tokens_forwarded: 0,
            memories_used: 0,
            degraded_retrieval: false,
        }
    }

    fn advance(&mut self, next: TurnState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal turn transition {} -> {}",
            self.state,
            next
        );
        debug!(turn_id = %self.turn_id, from = %self.state, to = %next, "Turn transition");
        self.state = next;
        self.transitions.push(next);
    }

    pub fn is_complete(&self) -> bool {
        self.state == TurnState::Complete
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > INPUT_PREVIEW_CHARS {
        let head: String = text.chars().take(INPUT_PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

/// Drives single turns against a memory store and a generation adapter.
#[derive(Clone)]
pub struct TurnOrchestrator {
    store: Arc<dyn MemoryStore>,
    adapter: Arc<dyn GenerationAdapter>,
    validator: ResponseValidator,
    in_flight: InFlightRegistry,
    policy: TurnPolicy,
    sampling: SamplingParams,
}

impl TurnOrchestrator {
    pub fn new(store: Arc<dyn MemoryStore>, adapter: Arc<dyn GenerationAdapter>) -> Self {
        Self {
            store,
            adapter,
            validator: ResponseValidator::new(),
            in_flight: InFlightRegistry::new(),
            policy: TurnPolicy::default(),
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_policy(mut self, policy: TurnPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn policy(&self) -> TurnPolicy {
        self.policy
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    /// Run one turn to a terminal state.
    ///
    /// `cancel` signals that the client went away. It is honored while
    /// streaming only; once the terminal payload has arrived the turn runs to
    /// `Complete` or `Failed`.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        sink: &mut dyn StreamSink,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let mut outcome = TurnOutcome::new(format!("turn-{}", uuid::Uuid::new_v4()));

        // INIT -> CONTEXT_BUILT
        let context = match request.into_context() {
            Ok(context) => context,
            Err(errors) => {
                return self
                    .fail(outcome, sink, TurnError::MalformedRequest(errors))
                    .await;
            }
        };
        let partition = context.partition();
        outcome.partition = Some(partition.clone());
        outcome.advance(TurnState::ContextBuilt);

        let Some(_guard) = self.in_flight.try_acquire(partition.clone(), &outcome.turn_id) else {
            warn!(
                subject = %partition.subject,
                counterpart = %partition.counterpart,
                "Rejecting turn, another one is in flight"
            );
            return self
                .fail(outcome, sink, TurnError::TurnInProgress(partition))
                .await;
        };

        info!(
            turn_id = %outcome.turn_id,
            subject = %partition.subject,
            counterpart = %partition.counterpart,
            input = %preview(&context.input_text),
            "Turn started"
        );

        // CONTEXT_BUILT -> MEMORY_RETRIEVED
        let memories = match self
            .store
            .retrieve_top(&partition, MEMORY_RETRIEVAL_LIMIT)
            .await
        {
            Ok(memories) => memories,
            Err(err) if self.policy.degrade_on_retrieval_failure => {
                warn!(
                    turn_id = %outcome.turn_id,
                    error = %err,
                    "Memory retrieval failed, continuing without memories"
                );
                outcome.degraded_retrieval = true;
                Vec::new()
            }
            Err(err) => return self.fail(outcome, sink, TurnError::Storage(err)).await,
        };
        outcome.memories_used = memories.len();
        outcome.advance(TurnState::MemoryRetrieved);

        // MEMORY_RETRIEVED -> STREAMING
        let composed = prompt::compose(&context, &memories, self.sampling);
        let mut stream = self.adapter.generate(composed);
        outcome.advance(TurnState::Streaming);

        let raw = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return abort(outcome, "client disconnected"),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(GenerationEvent::Token(text))) => {
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return abort(outcome, "client disconnected"),
                        sent = sink.emit_token(&text) => sent,
                    };
                    if sent.is_err() {
                        return abort(outcome, "stream sink closed");
                    }
                    outcome.tokens_forwarded += 1;
                }
                Some(Ok(GenerationEvent::Terminal(raw))) => break raw,
                Some(Err(failure)) => {
                    return self.fail(outcome, sink, TurnError::Generation(failure)).await;
                }
                None => {
                    let failure = GenerationFailure::incomplete_stream();
                    return self.fail(outcome, sink, TurnError::Generation(failure)).await;
                }
            }
        };
        drop(stream);
        outcome.advance(TurnState::TerminalReceived);

        // TERMINAL_RECEIVED -> VALIDATED
        let result = match self.validator.validate(&raw) {
            Ok(result) => result,
            Err(err) => return self.fail(outcome, sink, TurnError::Schema(err)).await,
        };
        outcome.advance(TurnState::Validated);

        // VALIDATED -> COMMITTED
        for (index, write) in result.memory_writes.iter().enumerate() {
            let memory = NewMemory {
                subject: partition.subject.clone(),
                counterpart: partition.counterpart.clone(),
                text: write.text.clone(),
                salience: write.salience,
                private: write.private,
                keys: write.keys.clone(),
                timestamp: None,
            };
            match self.store.append(memory).await {
                Ok(entry) => outcome.committed.push(entry.id),
                Err(err) => {
                    warn!(
                        turn_id = %outcome.turn_id,
                        index,
                        error = %err,
                        "Memory write failed"
                    );
                    outcome.memory_failures.push(MemoryWriteFailure {
                        index,
                        message: err.to_string(),
                    });
                }
            }
        }
        outcome.advance(TurnState::Committed);

        // COMMITTED -> COMPLETE
        if sink
            .emit_complete(&result, &outcome.memory_failures)
            .await
            .is_err()
        {
            debug!(turn_id = %outcome.turn_id, "Client left before the completion signal");
        }
        outcome.result = Some(result);
        outcome.advance(TurnState::Complete);

        info!(
            turn_id = %outcome.turn_id,
            tokens = outcome.tokens_forwarded,
            memories_used = outcome.memories_used,
            committed = outcome.committed.len(),
            memory_failures = outcome.memory_failures.len(),
            "Turn complete"
        );
        outcome
    }

    async fn fail(
        &self,
        mut outcome: TurnOutcome,
        sink: &mut dyn StreamSink,
        error: TurnError,
    ) -> TurnOutcome {
        warn!(
            turn_id = %outcome.turn_id,
            from = %outcome.state,
            kind = %error.kind(),
            error = %error,
            "Turn failed"
        );
        if sink.emit_error(error.kind(), &error.to_string()).await.is_err() {
            debug!(turn_id = %outcome.turn_id, "Client left before the error signal");
        }
        outcome.advance(TurnState::Failed);
        outcome.failure = Some(error);
        outcome
    }
}

fn abort(mut outcome: TurnOutcome, reason: &str) -> TurnOutcome {
    info!(
        turn_id = %outcome.turn_id,
        tokens = outcome.tokens_forwarded,
        reason,
        "Turn aborted"
    );
    outcome.advance(TurnState::Aborted);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions_are_legal() {
        use TurnState::*;
        let path = [
            Init,
            ContextBuilt,
            MemoryRetrieved,
            Streaming,
            TerminalReceived,
            Validated,
            Committed,
            Complete,
        ];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_states_only() {
        use TurnState::*;
        for state in [Init, ContextBuilt, MemoryRetrieved, Streaming, TerminalReceived, Validated, Committed] {
            assert!(state.can_transition_to(Failed), "{state} -> FAILED");
        }
        for state in [Complete, Failed, Aborted] {
            assert!(!state.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_aborted_reachable_from_streaming_only() {
        use TurnState::*;
        assert!(Streaming.can_transition_to(Aborted));
        for state in [Init, ContextBuilt, MemoryRetrieved, TerminalReceived, Validated, Committed] {
            assert!(!state.can_transition_to(Aborted));
        }
    }

    #[test]
    fn test_preview_truncates_long_input() {
        assert_eq!(preview("short"), "short");
        let long = "a".repeat(80);
        assert_eq!(preview(&long).chars().count(), INPUT_PREVIEW_CHARS + 3);
    }

    #[test]
    fn test_error_kinds() {
        let err = TurnError::Generation(GenerationFailure::incomplete_stream());
        assert_eq!(err.kind(), ErrorKind::GenerationFailure);
        let err = TurnError::MalformedRequest(vec![ValidationError::new("npc_id", "is required")]);
        assert_eq!(err.to_string(), "malformed request: npc_id: is required");
    }
}
