//! Channel-backed stream sink.
//!
//! Frames go through a bounded mpsc channel, so a slow client suspends token
//! forwarding instead of growing a buffer. A dropped receiver surfaces as
//! `SinkClosed`.

use async_trait::async_trait;
use parley_traits::{ErrorKind, MemoryWriteFailure, SinkClosed, StreamSink, TurnResult};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::error;

/// Client-facing frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnFrame {
    Token {
        text: String,
    },
    Final {
        /// Serialized `TurnResult`
        json: String,
        #[serde(default)]
        memory_write_failures: Vec<MemoryWriteFailure>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl TurnFrame {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnFrame::Token { .. })
    }
}

pub struct ChannelSink {
    tx: mpsc::Sender<TurnFrame>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<TurnFrame>) -> Self {
        Self { tx }
    }

    /// Bounded sink plus the receiving end for the transport.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<TurnFrame>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    async fn send(&self, frame: TurnFrame) -> Result<(), SinkClosed> {
        self.tx.send(frame).await.map_err(|_| SinkClosed)
    }
}

#[async_trait]
impl StreamSink for ChannelSink {
    async fn emit_token(&mut self, text: &str) -> Result<(), SinkClosed> {
        self.send(TurnFrame::Token {
            text: text.to_string(),
        })
        .await
    }

    async fn emit_error(&mut self, kind: ErrorKind, detail: &str) -> Result<(), SinkClosed> {
        self.send(TurnFrame::Error {
            kind,
            message: detail.to_string(),
        })
        .await
    }

    async fn emit_complete(
        &mut self,
        result: &TurnResult,
        memory_failures: &[MemoryWriteFailure],
    ) -> Result<(), SinkClosed> {
        let frame = match serde_json::to_string(result) {
            Ok(json) => TurnFrame::Final {
                json,
                memory_write_failures: memory_failures.to_vec(),
            },
            Err(e) => {
                error!(error = %e, "Failed to serialize turn result");
                TurnFrame::Error {
                    kind: ErrorKind::SchemaError,
                    message: "turn result could not be serialized".to_string(),
                }
            }
        };
        self.send(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_traits::{BehaviorDirective, Emotion};
    use serde_json::json;

    fn result() -> TurnResult {
        TurnResult {
            utterance: "Away with you.".to_string(),
            emotion: Emotion::Angry,
            style_tags: vec![],
            behavior_directive: BehaviorDirective::StepBack,
            memory_writes: vec![],
            public_events: vec![],
            voice_hint: None,
        }
    }

    #[test]
    fn test_frame_wire_shapes() {
        let token = serde_json::to_value(TurnFrame::Token { text: "Hel".into() }).unwrap();
        assert_eq!(token, json!({"type": "token", "text": "Hel"}));

        let error = serde_json::to_value(TurnFrame::Error {
            kind: ErrorKind::TurnInProgress,
            message: "busy".into(),
        })
        .unwrap();
        assert_eq!(
            error,
            json!({"type": "error", "kind": "turn_in_progress", "message": "busy"})
        );
    }

    #[tokio::test]
    async fn test_final_frame_embeds_result_json() {
        let (mut sink, mut rx) = ChannelSink::channel(4);
        let failures = vec![MemoryWriteFailure {
            index: 1,
            message: "disk full".into(),
        }];
        sink.emit_complete(&result(), &failures).await.unwrap();

        let TurnFrame::Final {
            json,
            memory_write_failures,
        } = rx.recv().await.unwrap()
        else {
            panic!("expected final frame");
        };
        let decoded: TurnResult = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, result());
        assert_eq!(memory_write_failures, failures);
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_sink() {
        let (mut sink, rx) = ChannelSink::channel(1);
        drop(rx);
        assert_eq!(sink.emit_token("x").await, Err(SinkClosed));
    }

    #[tokio::test]
    async fn test_full_channel_applies_backpressure() {
        let (mut sink, mut rx) = ChannelSink::channel(1);
        sink.emit_token("a").await.unwrap();

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            sink.emit_token("b"),
        )
        .await;
        assert!(pending.is_err(), "second token should wait for the reader");

        assert_eq!(rx.recv().await, Some(TurnFrame::Token { text: "a".into() }));
    }
}
