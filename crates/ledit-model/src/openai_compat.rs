// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared driver for OpenAI-compatible chat completion APIs.
//!
//! Every provider in the registry speaks the same `/chat/completions` SSE
//! streaming wire format; this module provides the single implementation
//! that each driver configures with its own defaults (URL, auth style).

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::ResponseStream, CompletionRequest, MessageContent, ResponseEvent, Role, Usage,
};

/// HTTP failure from a provider endpoint, preserved as a typed error so the
/// failover client can distinguish retryable statuses (429, 5xx) from
/// terminal ones without string matching.
#[derive(Debug, thiserror::Error)]
#[error("{provider} error {status}: {body}")]
pub struct HttpStatusError {
    pub provider: &'static str,
    pub status: u16,
    pub body: String,
}

impl HttpStatusError {
    pub fn is_retryable(&self) -> bool {
        self.status == 429 || self.status >= 500
    }
}

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` - standard for hosted providers.
    Bearer,
    /// No authentication header - local servers (Ollama, vLLM, LM Studio).
    None,
}

/// OpenAI-compatible chat completion provider.
pub struct OpenAICompatProvider {
    driver_name: &'static str,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    models_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    auth_style: AuthStyle,
}

impl OpenAICompatProvider {
    /// `base_url` ends **before** `/chat/completions`, e.g.
    /// `https://api.groq.com/openai/v1`.
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        auth_style: AuthStyle,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            models_url: format!("{base}/models"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
            auth_style,
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> anyhow::Result<reqwest::RequestBuilder> {
        match self.auth_style {
            AuthStyle::Bearer => {
                let key = self
                    .api_key
                    .as_deref()
                    .context("API key not set; provide api_key or api_key_env in config")?;
                Ok(req.bearer_auth(key))
            }
            AuthStyle::None => Ok(req),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    /// Probe `GET /models` with a short deadline.  Any 2xx/4xx answer means
    /// the endpoint is alive (401 still proves liveness - the key problem
    /// surfaces on the first real request with a clearer message).
    async fn health(&self) -> anyhow::Result<()> {
        let req = self
            .client
            .get(&self.models_url)
            .timeout(std::time::Duration::from_secs(5));
        let req = self.authorize(req)?;
        let resp = req
            .send()
            .await
            .with_context(|| format!("{} health probe failed", self.driver_name))?;
        if resp.status().is_server_error() {
            bail!(HttpStatusError {
                provider: self.driver_name,
                status: resp.status().as_u16(),
                body: "health probe".into(),
            });
        }
        Ok(())
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let messages = build_openai_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if req.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending completion request"
        );

        let http_req = self.client.post(&self.chat_url).json(&body);
        let http_req = self.authorize(http_req)?;

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(HttpStatusError {
                provider: self.driver_name,
                status,
                body: text,
            }
            .into());
        }

        if !req.stream {
            // Non-streaming: one JSON body, converted to the same event shape
            // so callers have a single accumulation path.
            let v: Value = resp.json().await.context("parsing completion body")?;
            let events = parse_non_streaming_body(&v);
            return Ok(Box::pin(futures::stream::iter(events)));
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets.  Maintain a line buffer
        // across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Serialize the conversation into OpenAI wire messages.  Each tool-call
/// message becomes an assistant message carrying a one-element `tool_calls`
/// array (the loop dispatches at most one tool per iteration, so grouping
/// is never needed).
fn build_openai_messages(messages: &[crate::Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(t) => json!({
                "role": role_str(&m.role),
                "content": t,
            }),
            MessageContent::ToolCall {
                tool_call_id,
                function,
            } => json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": [{
                    "id": tool_call_id,
                    "type": "function",
                    "function": {
                        "name": function.name,
                        "arguments": function.arguments,
                    }
                }]
            }),
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
        })
        .collect()
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v).map(Ok)
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// A trailing incomplete line stays in `buf` so the next TCP chunk can
/// extend it.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn parse_sse_chunk(v: &Value) -> Option<ResponseEvent> {
    // Usage-only chunk (emitted when stream_options.include_usage = true).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return Some(ResponseEvent::Usage(Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        }));
    }

    let choice = &v["choices"][0];

    if choice["finish_reason"].as_str() == Some("length") {
        return Some(ResponseEvent::MaxTokens);
    }

    let delta = &choice["delta"];

    if let Some(tool_calls) = delta.get("tool_calls") {
        let tc = tool_calls.get(0)?;
        return Some(ResponseEvent::ToolCall {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"]
                .as_str()
                .unwrap_or("")
                .to_string(),
        });
    }

    delta["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| ResponseEvent::TextDelta(s.to_string()))
}

/// Convert a non-streaming completion body into the streaming event shape.
fn parse_non_streaming_body(v: &Value) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    let message = &v["choices"][0]["message"];

    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            events.push(Ok(ResponseEvent::TextDelta(text.to_string())));
        }
    }
    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for (i, tc) in tool_calls.iter().enumerate() {
            events.push(Ok(ResponseEvent::ToolCall {
                index: i as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"]
                    .as_str()
                    .unwrap_or("")
                    .to_string(),
            }));
        }
    }
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        events.push(Ok(ResponseEvent::Usage(Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        })));
    }
    events.push(Ok(ResponseEvent::Done));
    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
