//! `/v1/chat.stream`: one turn per socket.
//!
//! The client sends a single turn request as a text frame and receives
//! token frames followed by exactly one `final` or `error` frame, after which
//! the server closes the socket. The turn itself runs in its own task, so a
//! client that leaves after the terminal payload cannot interrupt the memory
//! commit.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use parley_core::{ChannelSink, TurnFrame, TurnOrchestrator, TurnOutcome, TurnRequest};
use parley_traits::ErrorKind;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub async fn chat_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Start `request` on its own task, returning the frame stream and the
/// task handle. At most `buffer` frames wait for the transport.
pub fn spawn_turn(
    orchestrator: &TurnOrchestrator,
    request: TurnRequest,
    buffer: usize,
    cancel: CancellationToken,
) -> (mpsc::Receiver<TurnFrame>, JoinHandle<TurnOutcome>) {
    let orchestrator = orchestrator.clone();
    let (mut sink, frames) = ChannelSink::channel(buffer);
    let handle =
        tokio::spawn(async move { orchestrator.run_turn(request, &mut sink, cancel).await });
    (frames, handle)
}

/// Parse the opening client frame.
pub fn parse_request(message: &Message) -> Option<Result<TurnRequest, String>> {
    let parsed = match message {
        Message::Text(text) => serde_json::from_str::<TurnRequest>(text.as_str()),
        Message::Binary(bytes) => serde_json::from_slice::<TurnRequest>(bytes),
        _ => return None,
    };
    Some(parsed.map_err(|err| format!("invalid turn request: {err}")))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let request = loop {
        match receiver.next().await {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                debug!("Client left before sending a turn request");
                return;
            }
            Some(Ok(message)) => match parse_request(&message) {
                Some(Ok(request)) => break request,
                Some(Err(detail)) => {
                    warn!(error = %detail, "Rejecting turn request");
                    let frame = TurnFrame::Error {
                        kind: ErrorKind::MalformedRequest,
                        message: detail,
                    };
                    let text = encode_frame(&frame).unwrap_or_else(|fallback| fallback);
                    let _ = sender.send(Message::Text(text.into())).await;
                    let _ = sender.send(Message::Close(None)).await;
                    return;
                }
                None => continue,
            },
        }
    };

    let cancel = CancellationToken::new();
    let (mut frames, _turn) = spawn_turn(
        &state.orchestrator,
        request,
        state.config.turn.sink_buffer,
        cancel.clone(),
    );

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let (text, terminal) = match encode_frame(&frame) {
                    Ok(text) => (text, frame.is_terminal()),
                    Err(fallback) => {
                        cancel.cancel();
                        (fallback, true)
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    info!("Client socket closed while streaming");
                    cancel.cancel();
                    break;
                }
                if terminal {
                    break;
                }
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    info!("Client disconnected mid-turn");
                    cancel.cancel();
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Wire text for `frame`. When encoding fails the error holds a terminal
/// `internal` error frame to send instead.
fn encode_frame(frame: &impl Serialize) -> Result<String, String> {
    serde_json::to_string(frame).map_err(|err| {
        warn!(error = %err, "Failed to serialize frame");
        json!({
            "type": "error",
            "kind": ErrorKind::Internal,
            "message": "failed to encode frame",
        })
        .to_string()
    })
}
