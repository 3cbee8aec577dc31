// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use ledit_model::{Message, MessageContent, Role};

/// The ordered message log exchanged with the model for one run.
///
/// Owned exclusively by the agent loop; observers see snapshots via the
/// event bus.  The linkage invariant: every tool result answers exactly one
/// prior assistant tool call, and at loop exit no call is left unanswered
/// unless the run terminated abnormally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Record an assistant tool call.  Returns the origin message index the
    /// data model tracks for the call.
    pub fn push_tool_call(&mut self, id: &str, name: &str, args: &serde_json::Value) -> usize {
        self.push(Message::tool_call(id, name, args.to_string()));
        self.messages.len() - 1
    }

    pub fn push_tool_result(&mut self, id: &str, output: &str) {
        self.push(Message::tool_result(id, output));
    }

    /// Tool-call ids that have no answering tool message yet.
    pub fn unanswered_calls(&self) -> Vec<&str> {
        let mut open: Vec<&str> = Vec::new();
        for msg in &self.messages {
            match &msg.content {
                MessageContent::ToolCall { tool_call_id, .. } if msg.role == Role::Assistant => {
                    open.push(tool_call_id);
                }
                MessageContent::ToolResult { tool_call_id, .. } => {
                    open.retain(|id| id != tool_call_id);
                }
                _ => {}
            }
        }
        open
    }

    /// True when every tool call has been answered exactly once and no
    /// result references an unknown call.
    pub fn is_well_linked(&self) -> bool {
        let mut calls: Vec<&str> = Vec::new();
        let mut answered: Vec<&str> = Vec::new();
        for msg in &self.messages {
            match &msg.content {
                MessageContent::ToolCall { tool_call_id, .. } => calls.push(tool_call_id),
                MessageContent::ToolResult { tool_call_id, .. } => {
                    if !calls.contains(&tool_call_id.as_str()) {
                        return false;
                    }
                    if answered.contains(&tool_call_id.as_str()) {
                        return false;
                    }
                    answered.push(tool_call_id);
                }
                _ => {}
            }
        }
        calls.len() == answered.len()
    }

    /// Rough token estimate for the whole log.
    pub fn approx_tokens(&self) -> usize {
        self.messages.iter().map(Message::approx_tokens).sum()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_conversation_is_empty_and_linked() {
        let c = Conversation::new();
        assert!(c.is_empty());
        assert!(c.is_well_linked());
    }

    #[test]
    fn answered_call_links_cleanly() {
        let mut c = Conversation::new();
        c.push(Message::user("do it"));
        c.push_tool_call("c1", "read_file", &serde_json::json!({"path": "a"}));
        assert_eq!(c.unanswered_calls(), vec!["c1"]);
        c.push_tool_result("c1", "content");
        assert!(c.unanswered_calls().is_empty());
        assert!(c.is_well_linked());
    }

    #[test]
    fn unanswered_call_breaks_linkage() {
        let mut c = Conversation::new();
        c.push_tool_call("c1", "read_file", &serde_json::json!({}));
        assert!(!c.is_well_linked());
    }

    #[test]
    fn result_for_unknown_call_breaks_linkage() {
        let mut c = Conversation::new();
        c.push_tool_result("ghost", "out");
        assert!(!c.is_well_linked());
    }

    #[test]
    fn double_answer_breaks_linkage() {
        let mut c = Conversation::new();
        c.push_tool_call("c1", "x", &serde_json::json!({}));
        c.push_tool_result("c1", "a");
        c.push_tool_result("c1", "b");
        assert!(!c.is_well_linked());
    }

    #[test]
    fn push_tool_call_returns_origin_index() {
        let mut c = Conversation::new();
        c.push(Message::user("hi"));
        let idx = c.push_tool_call("c1", "x", &serde_json::json!({}));
        assert_eq!(idx, 1);
    }

    #[test]
    fn serde_round_trip_preserves_linkage() {
        let mut c = Conversation::new();
        c.push(Message::user("u"));
        c.push_tool_call("c1", "t", &serde_json::json!({"a": 1}));
        c.push_tool_result("c1", "r");
        let text = serde_json::to_string(&c).unwrap();
        let back: Conversation = serde_json::from_str(&text).unwrap();
        assert_eq!(back.len(), 3);
        assert!(back.is_well_linked());
    }
}
