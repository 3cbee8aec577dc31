// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// The single next step the planner commits to.  At most one step ahead:
/// the evaluator either accepts completion or requests a new plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub action: PlanAction,
    /// Target file or directory, when the action has one.
    #[serde(default)]
    pub target: Option<String>,
    /// What to do at the target (edit description, shell command, query).
    #[serde(default)]
    pub instructions: Option<String>,
    /// Observable predicate describing completion, e.g.
    /// `regex:^// agent: generated` or `build passes`.
    #[serde(default)]
    pub stop_when: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    ReadFile,
    EditFile,
    MicroEdit,
    RunShell,
    Validate,
    Analyze,
    Completed,
    Continue,
}

impl PlanAction {
    pub fn is_edit(&self) -> bool {
        matches!(self, PlanAction::EditFile | PlanAction::MicroEdit)
    }
}

/// The evaluator's verdict on the run so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub status: EvalStatus,
    pub reason: String,
    #[serde(default)]
    pub next_action: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Completed,
    Continue,
    Revise,
}

/// Extract the first JSON object from model output that may wrap it in
/// prose or a markdown fence, and deserialize it as `T`.
///
/// Returns a hint describing what was wrong so the loop can inject a
/// schema-reminder message and retry.
pub fn parse_structured<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, String> {
    let candidate = extract_json_object(text)
        .ok_or_else(|| "response contains no JSON object".to_string())?;
    serde_json::from_str(candidate).map_err(|e| format!("JSON does not match the schema: {e}"))
}

/// Find the first balanced `{ ... }` span, skipping braces inside strings.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_plan_json() {
        let plan: Plan = parse_structured(
            r#"{"action": "read_file", "target": "src/main.rs", "stop_when": "file read"}"#,
        )
        .unwrap();
        assert_eq!(plan.action, PlanAction::ReadFile);
        assert_eq!(plan.target.as_deref(), Some("src/main.rs"));
    }

    #[test]
    fn parses_plan_wrapped_in_prose_and_fence() {
        let text = "Here is my plan:\n```json\n{\"action\": \"validate\"}\n```\nDone.";
        let plan: Plan = parse_structured(text).unwrap();
        assert_eq!(plan.action, PlanAction::Validate);
    }

    #[test]
    fn nested_braces_in_strings_do_not_confuse_extraction() {
        let text = r#"{"action": "run_shell", "instructions": "awk '{print $1}' f"}"#;
        let plan: Plan = parse_structured(text).unwrap();
        assert_eq!(plan.instructions.as_deref(), Some("awk '{print $1}' f"));
    }

    #[test]
    fn missing_json_is_a_hint_not_a_panic() {
        let err = parse_structured::<Plan>("I think we should edit the file.").unwrap_err();
        assert!(err.contains("no JSON object"));
    }

    #[test]
    fn wrong_shape_reports_schema_mismatch() {
        let err = parse_structured::<Plan>(r#"{"action": "dance"}"#).unwrap_err();
        assert!(err.contains("schema"));
    }

    #[test]
    fn evaluation_parses_with_optional_next_action() {
        let ev: Evaluation =
            parse_structured(r#"{"status": "continue", "reason": "no validation yet"}"#).unwrap();
        assert_eq!(ev.status, EvalStatus::Continue);
        assert!(ev.next_action.is_none());
    }

    #[test]
    fn edit_actions_are_recognized() {
        assert!(PlanAction::EditFile.is_edit());
        assert!(PlanAction::MicroEdit.is_edit());
        assert!(!PlanAction::Validate.is_edit());
    }
}
