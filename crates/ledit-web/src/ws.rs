// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! WebSocket bridge between browser clients and the event bus.
//!
//! Outgoing: every bus event is forwarded as a JSON text frame
//! `{type, payload, timestamp}`.  A lagging client silently loses the
//! oldest events (the bus counts the loss); there is no replay.
//!
//! Incoming: JSON [`ControlCommand`]s are forwarded to the session's
//! command channel, the same path the REST surface uses.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use tracing::{debug, warn};

use crate::{AppState, ControlCommand};

/// HTTP handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    // Subscribe to everything; the browser decides what to render.
    let mut events = state.bus.subscribe(&[]);

    loop {
        tokio::select! {
            // Incoming message from the browser.
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlCommand>(&text) {
                            Ok(cmd) => {
                                if state.commands.send(cmd).await.is_err() {
                                    warn!("session command channel closed; dropping client");
                                    break;
                                }
                            }
                            Err(e) => {
                                let err = serde_json::json!({
                                    "type": "error",
                                    "payload": { "message": format!("invalid command: {e}") },
                                });
                                if socket.send(Message::Text(err.to_string())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!("WebSocket recv error: {e}");
                        break;
                    }
                }
            }
            // Outgoing event from the bus.
            event = events.next() => {
                match event {
                    Some(ev) => {
                        let Ok(text) = serde_json::to_string(&ev) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Bus closed: the session is shutting down.
                    None => break,
                }
            }
        }
    }

    debug!("WebSocket connection closed");
}
