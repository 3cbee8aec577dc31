// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::budget::{BudgetSnapshot, Dimension};

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum TerminationReason {
    Completed,
    BudgetExceeded(Dimension),
    Interrupted,
    IterationCap,
    FatalError(String),
}

impl TerminationReason {
    /// Process exit code contract: 0 success, 1 fatal, 2 budget (including
    /// the iteration cap), 130 interrupted.
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationReason::Completed => 0,
            TerminationReason::BudgetExceeded(_) | TerminationReason::IterationCap => 2,
            TerminationReason::Interrupted => 130,
            TerminationReason::FatalError(_) => 1,
        }
    }

    /// One actionable hint for the operator, printed with the summary.
    pub fn hint(&self) -> Option<String> {
        match self {
            TerminationReason::Completed => None,
            TerminationReason::BudgetExceeded(Dimension::Tokens) => {
                Some("raise budgets.token_cap or use --token-cap".into())
            }
            TerminationReason::BudgetExceeded(Dimension::Cost) => {
                Some("raise budgets.cost_cap_usd or route to a cheaper model".into())
            }
            TerminationReason::BudgetExceeded(Dimension::Time) => {
                Some("raise budgets.time_cap_secs or narrow the task".into())
            }
            TerminationReason::BudgetExceeded(Dimension::Iterations)
            | TerminationReason::IterationCap => {
                Some("increase --max-iterations, or split the task".into())
            }
            TerminationReason::Interrupted => {
                Some("run the same command again to resume from the saved state".into())
            }
            TerminationReason::FatalError(_) => {
                Some("see .ledit/workspace.log for the full trace".into())
            }
        }
    }
}

/// The structured run summary emitted with `query_completed` and printed as
/// the graceful-exit report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub reason: TerminationReason,
    pub iterations: u32,
    pub budgets: BudgetSnapshot,
    pub wall_time_secs: u64,
    pub active_provider: Option<String>,
}

impl RunSummary {
    /// Human-readable exit report.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let reason = match &self.reason {
            TerminationReason::Completed => "completed".to_string(),
            TerminationReason::BudgetExceeded(d) => format!("budget exceeded ({d})"),
            TerminationReason::Interrupted => "interrupted".to_string(),
            TerminationReason::IterationCap => "iteration cap reached".to_string(),
            TerminationReason::FatalError(e) => format!("fatal error: {e}"),
        };
        out.push_str(&format!("run {} - {}\n", self.run_id, reason));
        out.push_str(&format!(
            "  iterations: {}   wall time: {}   cost: ${:.4}\n",
            self.iterations,
            humantime::format_duration(std::time::Duration::from_secs(self.wall_time_secs)),
            self.budgets.cost_used,
        ));
        for (phase, usage) in &self.budgets.per_phase {
            out.push_str(&format!(
                "  {:<16} {:>8} prompt + {:>7} completion tokens\n",
                phase.label(),
                usage.prompt_tokens,
                usage.completion_tokens,
            ));
        }
        out.push_str(&format!("  total tokens: {}\n", self.budgets.tokens_used));
        if let Some(provider) = &self.active_provider {
            out.push_str(&format!("  provider: {provider}\n"));
        }
        if let Some(hint) = self.reason.hint() {
            out.push_str(&format!("  hint: {hint}\n"));
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{Phase, PhaseUsage};

    fn summary(reason: TerminationReason) -> RunSummary {
        let mut budgets = BudgetSnapshot::default();
        budgets.per_phase.insert(
            Phase::Planning,
            PhaseUsage {
                prompt_tokens: 120,
                completion_tokens: 40,
                wall_time_secs: 1.0,
            },
        );
        budgets.tokens_used = 160;
        budgets.cost_used = 0.0123;
        RunSummary {
            run_id: "r-1".into(),
            reason,
            iterations: 4,
            budgets,
            wall_time_secs: 61,
            active_provider: Some("openai".into()),
        }
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(TerminationReason::Completed.exit_code(), 0);
        assert_eq!(TerminationReason::FatalError("x".into()).exit_code(), 1);
        assert_eq!(
            TerminationReason::BudgetExceeded(Dimension::Tokens).exit_code(),
            2
        );
        assert_eq!(TerminationReason::IterationCap.exit_code(), 2);
        assert_eq!(TerminationReason::Interrupted.exit_code(), 130);
    }

    #[test]
    fn render_contains_reason_and_phases() {
        let text = summary(TerminationReason::BudgetExceeded(Dimension::Tokens)).render();
        assert!(text.contains("budget exceeded (tokens)"));
        assert!(text.contains("planning"));
        assert!(text.contains("total tokens: 160"));
        assert!(text.contains("hint:"));
    }

    #[test]
    fn completed_summary_has_no_hint() {
        let text = summary(TerminationReason::Completed).render();
        assert!(!text.contains("hint:"));
    }

    #[test]
    fn reason_serializes_with_detail() {
        let r = TerminationReason::BudgetExceeded(Dimension::Cost);
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("budget_exceeded"));
        assert!(json.contains("cost"));
    }
}
