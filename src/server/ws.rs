//! WebSocket chat loop.
//!
//! One exchange at a time per connection. While an exchange is streaming the
//! socket is still polled, so a disconnect cancels the exchange (and with it
//! the provider task) right away. Text frames that arrive mid-exchange are
//! queued and served in order afterwards.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::core::relay::{ChatSink, ServerMessage, SinkError};
use crate::core::session::ChatSession;

/// The sending half of a chat socket, speaking JSON text frames.
struct WsSink {
    sender: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl ChatSink for WsSink {
    async fn send(&mut self, message: ServerMessage) -> Result<(), SinkError> {
        let text =
            serde_json::to_string(&message).map_err(|e| SinkError::Encode(e.to_string()))?;
        self.sender
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| SinkError::Closed)
    }
}

enum Incoming {
    Frame(String),
    Ignored,
    Closed,
}

fn classify(incoming: Option<Result<WsMessage, axum::Error>>, connection: Uuid) -> Incoming {
    match incoming {
        Some(Ok(WsMessage::Text(text))) => Incoming::Frame(text.as_str().to_string()),
        Some(Ok(WsMessage::Binary(data))) => {
            warn!("[{connection}] Ignoring {}-byte binary frame", data.len());
            Incoming::Ignored
        }
        Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => Incoming::Ignored,
        Some(Ok(WsMessage::Close(_))) | None => Incoming::Closed,
        Some(Err(e)) => {
            debug!("[{connection}] WebSocket receive error: {e}");
            Incoming::Closed
        }
    }
}

async fn next_frame(receiver: &mut SplitStream<WebSocket>, connection: Uuid) -> Option<String> {
    loop {
        match classify(receiver.next().await, connection) {
            Incoming::Frame(text) => return Some(text),
            Incoming::Ignored => continue,
            Incoming::Closed => return None,
        }
    }
}

pub async fn chat_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, state.session))
}

async fn run_connection(socket: WebSocket, session: Arc<ChatSession>) {
    let connection = Uuid::new_v4();
    info!("[{connection}] WebSocket connection established");

    let (sender, mut receiver) = socket.split();
    let mut sink = WsSink { sender };
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut exchanges = 0usize;

    'connection: loop {
        let frame = match pending.pop_front() {
            Some(frame) => frame,
            None => match next_frame(&mut receiver, connection).await {
                Some(frame) => frame,
                None => break,
            },
        };
        exchanges += 1;
        debug!("[{connection}] Starting exchange {exchanges}");

        let exchange = session.handle_frame(&frame, &mut sink);
        tokio::pin!(exchange);
        loop {
            tokio::select! {
                result = &mut exchange => match result {
                    Ok(reason) => {
                        debug!("[{connection}] Exchange {exchanges} finished: {reason:?}");
                        break;
                    }
                    Err(e) => {
                        info!("[{connection}] Client went away mid-exchange: {e}");
                        break 'connection;
                    }
                },
                incoming = receiver.next() => match classify(incoming, connection) {
                    Incoming::Frame(text) => pending.push_back(text),
                    Incoming::Ignored => {}
                    Incoming::Closed => {
                        info!("[{connection}] Client disconnected during exchange {exchanges}");
                        break 'connection;
                    }
                },
            }
        }
    }

    if let Err(e) = sink.sender.close().await {
        debug!("[{connection}] Ignoring error while closing socket: {e}");
    }
    info!("[{connection}] WebSocket connection closed after {exchanges} exchanges");
}
