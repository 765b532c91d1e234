//! Deterministic scripted adapter for tests and offline runs.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use parley_traits::{
    ComposedContext, GenerationAdapter, GenerationEvent, GenerationFailure, GenerationStream,
};
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};

/// One scripted stream event.
#[derive(Debug, Clone)]
pub enum ScriptStepKind {
    /// Emit a partial token.
    Token(String),
    /// Emit the terminal payload and end the stream.
    Terminal(Value),
    /// Emit a generation failure and end the stream.
    Fail(GenerationFailure),
    /// End the stream without a terminal event.
    Disconnect,
}

/// Scripted stream step with optional delay.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub delay_ms: u64,
    pub kind: ScriptStepKind,
}

impl ScriptStep {
    pub fn token(text: impl Into<String>) -> Self {
        Self {
            delay_ms: 0,
            kind: ScriptStepKind::Token(text.into()),
        }
    }

    pub fn terminal(payload: Value) -> Self {
        Self {
            delay_ms: 0,
            kind: ScriptStepKind::Terminal(payload),
        }
    }

    pub fn fail(failure: GenerationFailure) -> Self {
        Self {
            delay_ms: 0,
            kind: ScriptStepKind::Fail(failure),
        }
    }

    pub fn disconnect() -> Self {
        Self {
            delay_ms: 0,
            kind: ScriptStepKind::Disconnect,
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// Build the steps for a reply streamed word by word and closed by `payload`.
///
/// The utterance in `payload` is split on spaces so clients see several
/// tokens before the terminal event.
pub fn reply_steps(payload: Value) -> Vec<ScriptStep> {
    let utterance = payload
        .get("utterance")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut steps: Vec<ScriptStep> = utterance
        .split_inclusive(' ')
        .map(ScriptStep::token)
        .collect();
    steps.push(ScriptStep::terminal(payload));
    steps
}

/// Scripted adapter. Each `generate` call consumes one queued script; when
/// the queue is empty a neutral in-character reply is produced.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAdapter {
    scripts: Arc<Mutex<VecDeque<Vec<ScriptStep>>>>,
    contexts: Arc<Mutex<Vec<ComposedContext>>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_scripts(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(VecDeque::from(scripts))),
            contexts: Arc::default(),
        }
    }

    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        self.scripts.lock().push_back(steps);
    }

    /// Contexts received so far, in call order.
    pub fn contexts(&self) -> Vec<ComposedContext> {
        self.contexts.lock().clone()
    }

    pub fn fallback_payload() -> Value {
        json!({
            "utterance": "Hm. I hear you, traveler.",
            "emotion": "neutral",
            "style_tags": ["guarded"],
            "behavior_directive": "none",
            "memory_writes": [],
            "public_events": []
        })
    }
}

impl GenerationAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&self, context: ComposedContext) -> GenerationStream {
        self.contexts.lock().push(context);
        let steps = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| reply_steps(Self::fallback_payload()));

        Box::pin(async_stream::stream! {
            for step in steps {
                if step.delay_ms > 0 {
                    sleep(Duration::from_millis(step.delay_ms)).await;
                }
                match step.kind {
                    ScriptStepKind::Token(text) => {
                        yield Ok(GenerationEvent::Token(text));
                    }
                    ScriptStepKind::Terminal(payload) => {
                        yield Ok(GenerationEvent::Terminal(payload));
                        return;
                    }
                    ScriptStepKind::Fail(failure) => {
                        yield Err(failure);
                        return;
                    }
                    ScriptStepKind::Disconnect => return,
                }
            }
        })
    }
}
