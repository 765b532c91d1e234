//! Test utilities for deterministic turn orchestration tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_traits::{
    ComposedContext, ErrorKind, GenerationAdapter, GenerationEvent, GenerationFailure,
    GenerationStream, MemoryEntry, MemoryStore, MemoryWriteFailure, NewMemory, PartitionKey,
    SinkClosed, StoreError, StreamSink, TurnResult,
};
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::storage::RedbMemoryStore;

/// Creates a temporary redb-backed store for tests.
pub fn create_test_store() -> (Arc<RedbMemoryStore>, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = temp_dir.path().join("turn-test.redb");
    let db = Arc::new(redb::Database::create(db_path).expect("failed to create redb database"));
    (
        Arc::new(RedbMemoryStore::new(db).expect("failed to init memory store")),
        temp_dir,
    )
}

/// What a `RecordingSink` received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Token(String),
    Error(ErrorKind, String),
    Complete(TurnResult, Vec<MemoryWriteFailure>),
}

/// Sink that records every emitted event.
///
/// `close_after_tokens(n)` makes it report `SinkClosed` once `n` tokens have
/// been accepted, like a client that hung up mid-stream.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<SinkEvent>,
    close_after: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_after_tokens(tokens: usize) -> Self {
        Self {
            events: Vec::new(),
            close_after: Some(tokens),
        }
    }

    pub fn tokens(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Token(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(ErrorKind, String)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Error(kind, detail) => Some((*kind, detail.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> Vec<(TurnResult, Vec<MemoryWriteFailure>)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Complete(result, failures) => Some((result.clone(), failures.clone())),
                _ => None,
            })
            .collect()
    }

    fn closed(&self) -> bool {
        self.close_after
            .is_some_and(|limit| self.tokens().len() >= limit)
    }
}

#[async_trait]
impl StreamSink for RecordingSink {
    async fn emit_token(&mut self, text: &str) -> Result<(), SinkClosed> {
        if self.closed() {
            return Err(SinkClosed);
        }
        self.events.push(SinkEvent::Token(text.to_string()));
        Ok(())
    }

    async fn emit_error(&mut self, kind: ErrorKind, detail: &str) -> Result<(), SinkClosed> {
        if self.closed() {
            return Err(SinkClosed);
        }
        self.events.push(SinkEvent::Error(kind, detail.to_string()));
        Ok(())
    }

    async fn emit_complete(
        &mut self,
        result: &TurnResult,
        memory_failures: &[MemoryWriteFailure],
    ) -> Result<(), SinkClosed> {
        if self.closed() {
            return Err(SinkClosed);
        }
        self.events
            .push(SinkEvent::Complete(result.clone(), memory_failures.to_vec()));
        Ok(())
    }
}

/// Store wrapper that injects retrieval and append faults.
///
/// `cancel_on_append` fires a token right before each append is delegated,
/// like a client that hangs up while the turn is committing.
pub struct FaultyMemoryStore {
    inner: Arc<dyn MemoryStore>,
    cancel_on_append: Option<CancellationToken>,
    fail_retrieval: AtomicBool,
    failing_appends: Mutex<HashSet<usize>>,
    append_calls: AtomicUsize,
    retrieve_calls: AtomicUsize,
}

impl FaultyMemoryStore {
    pub fn new(inner: Arc<dyn MemoryStore>) -> Self {
        Self {
            inner,
            cancel_on_append: None,
            fail_retrieval: AtomicBool::new(false),
            failing_appends: Mutex::new(HashSet::new()),
            append_calls: AtomicUsize::new(0),
            retrieve_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_retrieval(self) -> Self {
        self.fail_retrieval.store(true, Ordering::SeqCst);
        self
    }

    /// Fail the n-th append call (1-based) with a storage error.
    pub fn fail_append_call(self, call: usize) -> Self {
        self.failing_appends.lock().insert(call);
        self
    }

    pub fn cancel_on_append(mut self, token: CancellationToken) -> Self {
        self.cancel_on_append = Some(token);
        self
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn retrieve_calls(&self) -> usize {
        self.retrieve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MemoryStore for FaultyMemoryStore {
    async fn retrieve_top(
        &self,
        partition: &PartitionKey,
        k: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_retrieval.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("injected retrieval fault".to_string()));
        }
        self.inner.retrieve_top(partition, k).await
    }

    async fn append(&self, memory: NewMemory) -> Result<MemoryEntry, StoreError> {
        let call = self.append_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(token) = &self.cancel_on_append {
            token.cancel();
        }
        if self.failing_appends.lock().contains(&call) {
            return Err(StoreError::Storage(format!(
                "injected append fault at call {call}"
            )));
        }
        self.inner.append(memory).await
    }
}

/// Adapter that emits its leading tokens, then holds the stream open until
/// `release` is called, then finishes with the terminal payload.
///
/// `pulled` counts events handed to the consumer across all streams.
pub struct GatedAdapter {
    leading_tokens: Vec<String>,
    terminal: Value,
    gate: Arc<Semaphore>,
    started: Arc<Notify>,
    calls: AtomicUsize,
    pulled: Arc<AtomicUsize>,
}

impl GatedAdapter {
    pub fn new(leading_tokens: Vec<String>, terminal: Value) -> Self {
        Self {
            leading_tokens,
            terminal,
            gate: Arc::new(Semaphore::new(0)),
            started: Arc::new(Notify::new()),
            calls: AtomicUsize::new(0),
            pulled: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Let one held stream continue.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Wait until a stream has emitted its leading tokens.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }
}

impl GenerationAdapter for GatedAdapter {
    fn name(&self) -> &str {
        "gated"
    }

    fn generate(&self, _context: ComposedContext) -> GenerationStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tokens = self.leading_tokens.clone();
        let terminal = self.terminal.clone();
        let gate = self.gate.clone();
        let started = self.started.clone();
        let pulled = self.pulled.clone();

        Box::pin(futures::stream::unfold(
            (tokens.into_iter(), Some(terminal), false),
            move |(mut tokens, mut terminal, mut gated)| {
                let gate = gate.clone();
                let started = started.clone();
                let pulled = pulled.clone();
                async move {
                    if let Some(token) = tokens.next() {
                        pulled.fetch_add(1, Ordering::SeqCst);
                        let event = Ok::<_, GenerationFailure>(GenerationEvent::Token(token));
                        return Some((event, (tokens, terminal, gated)));
                    }
                    if !gated {
                        started.notify_one();
                        let permit = gate.acquire().await.ok()?;
                        permit.forget();
                        gated = true;
                    }
                    let payload = terminal.take()?;
                    pulled.fetch_add(1, Ordering::SeqCst);
                    let event = Ok::<_, GenerationFailure>(GenerationEvent::Terminal(payload));
                    Some((event, (tokens, terminal, gated)))
                }
            },
        ))
    }
}
