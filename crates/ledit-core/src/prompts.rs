// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Prompt texts for the planner, executor, and evaluator turns, plus the
//! sub-agent personas.

/// System message for the whole run.
pub fn system_prompt(workspace_root: &str) -> String {
    format!(
        "You are ledit, an autonomous coding agent operating on the repository \
         at {workspace_root}. You work in small, verifiable steps: read before \
         you edit, make the smallest sufficient change, and validate after \
         editing. Tool output you receive is ground truth; never invent file \
         contents."
    )
}

/// Instruction appended for a planner turn.  The response must be a single
/// JSON object in the `Plan` shape.
pub const PLANNER_INSTRUCTION: &str = "\
Decide the single next step. Respond with ONE JSON object and nothing else:
{\"action\": \"read_file|edit_file|micro_edit|run_shell|validate|analyze|completed|continue\",
 \"target\": \"<file or directory, when applicable>\",
 \"instructions\": \"<what to do there / shell command / search query>\",
 \"stop_when\": \"<observable completion predicate, e.g. regex:PATTERN or 'build passes'>\"}
Pick `completed` only when the task is observably done. Plan at most one step ahead.";

/// Reminder injected when the planner response did not parse.
pub fn plan_schema_reminder(hint: &str) -> String {
    format!(
        "Your previous response could not be used: {hint}. \
         Reply with exactly one JSON object matching the plan schema - \
         no prose, no markdown fence."
    )
}

/// Instruction for the executor's codegen turn on edit actions.
pub fn edit_instruction(target: &str, instructions: &str) -> String {
    format!(
        "Apply this change to {target}: {instructions}\n\
         Use exactly one tool call (edit_file_section, micro_edit, or \
         write_file for new files). Make the smallest sufficient change."
    )
}

/// Reminder when a codegen turn produced prose instead of a tool call.
pub const EDIT_NEEDS_TOOL_CALL: &str = "\
You must perform the edit through a tool call, not describe it in text. \
Call edit_file_section, micro_edit, or write_file now.";

/// Instruction appended for an evaluator turn.
pub const EVALUATOR_INSTRUCTION: &str = "\
Evaluate whether the user's intent is now satisfied, judging only from the \
evidence in this conversation (tool results, validation output). Respond \
with ONE JSON object and nothing else:
{\"status\": \"completed|continue|revise\",
 \"reason\": \"<one sentence of evidence>\",
 \"next_action\": \"<what to do next, when status is not completed>\"}
For code changes, require a passing validation before `completed`. \
Documentation-only changes may complete without validation.";

/// Forcing message injected by the stuck detector.
pub const STUCK_NUDGE: &str = "\
You have made no structural progress for two iterations (no edit, no \
validation). Take a concrete step now: plan an edit_file or micro_edit on a \
specific file, or run validate.";

/// Message injected when evidence verification rejects a completion claim.
pub fn evidence_rejection(detail: &str) -> String {
    format!(
        "Completion was claimed but evidence verification failed: {detail}. \
         Plan a targeted repair step."
    )
}

/// Sub-agent persona presets keyed by role.
pub fn persona_prompt(role: &str) -> Option<&'static str> {
    match role {
        "coder" => Some(
            "You are a focused implementation sub-agent. Make the requested \
             change with the fewest edits that fully satisfy it, then stop.",
        ),
        "tester" => Some(
            "You are a testing sub-agent. Exercise the described behaviour, \
             run the relevant checks, and report exactly what passes and \
             fails with evidence.",
        ),
        "reviewer" => Some(
            "You are a code-review sub-agent. Read the relevant code and \
             report concrete defects and risks, most severe first. Do not \
             edit files.",
        ),
        "debugger" => Some(
            "You are a debugging sub-agent. Reproduce the failure, isolate \
             the cause with targeted reads and shell probes, and either fix \
             it minimally or report the root cause.",
        ),
        "researcher" => Some(
            "You are a research sub-agent. Gather the requested information \
             from the workspace and summarize it with file references. Do \
             not edit files.",
        ),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_documented_personas_exist() {
        for role in ["coder", "tester", "reviewer", "debugger", "researcher"] {
            assert!(persona_prompt(role).is_some(), "missing persona {role}");
        }
        assert!(persona_prompt("barista").is_none());
    }

    #[test]
    fn planner_instruction_names_every_action() {
        for action in [
            "read_file",
            "edit_file",
            "micro_edit",
            "run_shell",
            "validate",
            "analyze",
            "completed",
            "continue",
        ] {
            assert!(PLANNER_INSTRUCTION.contains(action), "missing {action}");
        }
    }

    #[test]
    fn system_prompt_mentions_workspace() {
        assert!(system_prompt("/work/repo").contains("/work/repo"));
    }
}
