// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Web UI server: a background HTTP server exposing the event bus over
//! WebSocket plus a small REST control surface for the bundled single-page
//! app.
//!
//! The server owns nothing: queries are forwarded to the session through a
//! command channel, state is observed through the event bus, and shutdown
//! rides the same cancellation token as the agent loop.  Events published
//! while no client is connected are not replayed; a new client sees a fresh
//! snapshot plus subsequent events.

mod ws;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use ledit_events::EventBus;

pub use ws::ws_handler;

/// How many ports above `port_start` are probed before giving up.
const PORT_SCAN_RANGE: u16 = 50;

/// Commands a web client may issue against the running session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    SubmitQuery { intent: String },
    CancelQuery,
}

#[derive(Clone)]
pub struct AppState {
    pub bus: EventBus,
    pub workspace_root: PathBuf,
    pub commands: mpsc::Sender<ControlCommand>,
}

/// Running server handle.
pub struct WebServer {
    pub port: u16,
    pub task: tokio::task::JoinHandle<()>,
}

/// Bind the first free port at or above `config.port_start` and serve until
/// the cancellation token fires.
pub async fn serve(
    config: &ledit_config::WebConfig,
    bus: EventBus,
    workspace_root: PathBuf,
    commands: mpsc::Sender<ControlCommand>,
    cancel: CancellationToken,
) -> anyhow::Result<WebServer> {
    let (listener, port) = bind_first_free(config.port_start).await?;
    let state = AppState {
        bus,
        workspace_root,
        commands,
    };
    let app = router(state);

    info!(port, "web UI listening");
    let task = tokio::spawn(async move {
        let shutdown = cancel.cancelled_owned();
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::warn!("web server error: {e}");
        }
    });

    Ok(WebServer { port, task })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/api/file", get(read_file))
        .route("/api/git/status", get(git_status))
        .route("/api/providers", get(providers))
        .route("/api/query", post(submit_query))
        .route("/api/cancel", post(cancel_query))
        .with_state(Arc::new(state))
}

async fn bind_first_free(start: u16) -> anyhow::Result<(TcpListener, u16)> {
    for offset in 0..PORT_SCAN_RANGE {
        let port = start + offset;
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
            return Ok((listener, port));
        }
    }
    anyhow::bail!(
        "no free port in {start}..{} for the web UI",
        start + PORT_SCAN_RANGE
    )
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Deserialize)]
struct FileQuery {
    path: String,
}

async fn read_file(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FileQuery>,
) -> impl IntoResponse {
    if path_escapes(&q.path) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "path escapes the workspace" })),
        );
    }
    let full = state.workspace_root.join(&q.path);
    match std::fs::read_to_string(&full) {
        Ok(content) => (
            StatusCode::OK,
            Json(json!({ "path": q.path, "content": content })),
        ),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("not found: {}", q.path) })),
        ),
    }
}

async fn git_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let output = tokio::process::Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(&state.workspace_root)
        .output()
        .await;
    match output {
        Ok(out) => Json(json!({
            "clean": out.stdout.is_empty(),
            "status": String::from_utf8_lossy(&out.stdout),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn providers() -> Json<serde_json::Value> {
    let list: Vec<_> = ledit_model::list_drivers()
        .iter()
        .map(|d| {
            json!({
                "id": d.id,
                "name": d.name,
                "description": d.description,
                "requires_api_key": d.requires_api_key,
            })
        })
        .collect();
    Json(json!({ "providers": list }))
}

#[derive(Deserialize)]
struct QueryBody {
    intent: String,
}

async fn submit_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<QueryBody>,
) -> impl IntoResponse {
    if !same_origin(&headers) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "cross-origin request rejected" })),
        );
    }
    match state
        .commands
        .send(ControlCommand::SubmitQuery {
            intent: body.intent,
        })
        .await
    {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "session is shutting down" })),
        ),
    }
}

async fn cancel_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !same_origin(&headers) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "cross-origin request rejected" })),
        );
    }
    match state.commands.send(ControlCommand::CancelQuery).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "session is shutting down" })),
        ),
    }
}

/// Same-origin check for mutating endpoints.  Requests without an Origin
/// header (curl, same-site fetch) pass; a present Origin must match Host.
fn same_origin(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let Some(host) = headers.get("host").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
        .map(|origin_host| origin_host == host)
        .unwrap_or(false)
}

/// A relative path escapes when parent segments outnumber normal ones at
/// any prefix, or when it is absolute.
fn path_escapes(raw: &str) -> bool {
    let p = Path::new(raw);
    if p.is_absolute() {
        return true;
    }
    let mut depth: i64 = 0;
    for comp in p.components() {
        match comp {
            std::path::Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            std::path::Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    false
}

/// The bundled single-page app: a minimal live console over the WebSocket.
const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <title>ledit</title>
  <style>
    body { font-family: ui-monospace, monospace; margin: 2rem; background: #111; color: #ddd; }
    #log { white-space: pre-wrap; border: 1px solid #333; padding: 1rem; height: 70vh; overflow-y: auto; }
    .tool { color: #8bd; } .err { color: #d88; } .chunk { color: #bdb; }
    input { width: 70%; padding: .5rem; background: #222; color: #ddd; border: 1px solid #444; }
    button { padding: .5rem 1rem; }
  </style>
</head>
<body>
  <h2>ledit</h2>
  <div id="log"></div>
  <p>
    <input id="intent" placeholder="describe the change...">
    <button onclick="submitQuery()">run</button>
    <button onclick="cancelQuery()">cancel</button>
  </p>
  <script>
    const log = document.getElementById('log');
    function line(cls, text) {
      const el = document.createElement('div');
      el.className = cls; el.textContent = text;
      log.appendChild(el); log.scrollTop = log.scrollHeight;
    }
    const ws = new WebSocket(`ws://${location.host}/ws`);
    ws.onmessage = (m) => {
      const ev = JSON.parse(m.data);
      if (ev.type === 'stream_chunk') line('chunk', ev.payload.text ?? '');
      else if (ev.type === 'error') line('err', JSON.stringify(ev.payload));
      else line('tool', `${ev.type} ${JSON.stringify(ev.payload)}`);
    };
    async function submitQuery() {
      const intent = document.getElementById('intent').value;
      await fetch('/api/query', {method: 'POST', headers: {'content-type': 'application/json'}, body: JSON.stringify({intent})});
    }
    async function cancelQuery() { await fetch('/api/cancel', {method: 'POST'}); }
  </script>
</body>
</html>
"#;

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        h
    }

    #[test]
    fn missing_origin_passes() {
        assert!(same_origin(&headers(&[("host", "127.0.0.1:8998")])));
    }

    #[test]
    fn matching_origin_passes() {
        assert!(same_origin(&headers(&[
            ("host", "127.0.0.1:8998"),
            ("origin", "http://127.0.0.1:8998")
        ])));
    }

    #[test]
    fn mismatched_origin_fails() {
        assert!(!same_origin(&headers(&[
            ("host", "127.0.0.1:8998"),
            ("origin", "http://evil.example")
        ])));
    }

    #[test]
    fn path_escape_detection() {
        assert!(path_escapes("/etc/passwd"));
        assert!(path_escapes("../secrets"));
        assert!(path_escapes("a/../../b"));
        assert!(!path_escapes("src/main.rs"));
        assert!(!path_escapes("a/../b"));
    }

    #[test]
    fn control_command_parses_from_wire_json() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"type": "submit_query", "intent": "fix the build"}"#).unwrap();
        assert_eq!(
            cmd,
            ControlCommand::SubmitQuery {
                intent: "fix the build".into()
            }
        );
        let cancel: ControlCommand = serde_json::from_str(r#"{"type": "cancel_query"}"#).unwrap();
        assert_eq!(cancel, ControlCommand::CancelQuery);
    }

    #[tokio::test]
    async fn port_scan_skips_occupied_ports() {
        let first = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken = first.local_addr().unwrap().port();
        let (listener, port) = bind_first_free(taken).await.unwrap();
        assert!(port > taken);
        drop(listener);
    }
}
