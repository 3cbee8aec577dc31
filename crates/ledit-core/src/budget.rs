// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use ledit_model::Usage;

/// The loop phase a model call or tool execution belongs to, for
/// per-category accounting in the exit summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    IntentAnalysis,
    Planning,
    Codegen,
    Validation,
    Evaluation,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::IntentAnalysis,
        Phase::Planning,
        Phase::Codegen,
        Phase::Validation,
        Phase::Evaluation,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Phase::IntentAnalysis => "intent_analysis",
            Phase::Planning => "planning",
            Phase::Codegen => "codegen",
            Phase::Validation => "validation",
            Phase::Evaluation => "evaluation",
        }
    }
}

/// The four bounded run dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Tokens,
    Cost,
    Time,
    Iterations,
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Dimension::Tokens => "tokens",
            Dimension::Cost => "cost",
            Dimension::Time => "time",
            Dimension::Iterations => "iterations",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetEventKind {
    SoftWarn,
    HardStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetEvent {
    pub kind: BudgetEventKind,
    pub dimension: Dimension,
}

/// Serializable snapshot of the tracker, persisted with the run state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub tokens_used: u64,
    pub cost_used: f64,
    pub time_used_secs: u64,
    pub per_phase: BTreeMap<Phase, PhaseUsage>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PhaseUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub wall_time_secs: f64,
}

/// Token / dollar / time / iteration accounting with soft and hard bounds.
///
/// Each dimension fires `SoftWarn` once when crossing the soft fraction and
/// `HardStop` once at the cap; the loop terminates at the next iteration
/// boundary after a hard stop.
pub struct BudgetTracker {
    caps: ledit_config::BudgetConfig,
    max_iterations: u32,
    started: Instant,
    /// Wall time carried over from a resumed run.
    carried_time: Duration,
    per_phase: BTreeMap<Phase, PhaseUsage>,
    cost_used: f64,
    soft_fired: Vec<Dimension>,
    hard_fired: Vec<Dimension>,
}

impl BudgetTracker {
    pub fn new(caps: ledit_config::BudgetConfig, max_iterations: u32) -> Self {
        Self {
            caps,
            max_iterations,
            started: Instant::now(),
            carried_time: Duration::ZERO,
            per_phase: BTreeMap::new(),
            cost_used: 0.0,
            soft_fired: Vec::new(),
            hard_fired: Vec::new(),
        }
    }

    /// Rebuild the tracker from a persisted snapshot (resume path).
    pub fn from_snapshot(
        caps: ledit_config::BudgetConfig,
        max_iterations: u32,
        snapshot: &BudgetSnapshot,
    ) -> Self {
        let mut t = Self::new(caps, max_iterations);
        t.per_phase = snapshot.per_phase.clone();
        t.cost_used = snapshot.cost_used;
        t.carried_time = Duration::from_secs(snapshot.time_used_secs);
        t
    }

    /// Record one model call (or tool execution, with zero usage).
    pub fn record(&mut self, phase: Phase, usage: Usage, cost: f64, wall: Duration) {
        let entry = self.per_phase.entry(phase).or_default();
        entry.prompt_tokens += usage.prompt_tokens as u64;
        entry.completion_tokens += usage.completion_tokens as u64;
        entry.wall_time_secs += wall.as_secs_f64();
        self.cost_used += cost;
    }

    pub fn tokens_used(&self) -> u64 {
        self.per_phase
            .values()
            .map(|u| u.prompt_tokens + u.completion_tokens)
            .sum()
    }

    pub fn cost_used(&self) -> f64 {
        self.cost_used
    }

    pub fn time_used(&self) -> Duration {
        self.carried_time + self.started.elapsed()
    }

    /// Poll for newly crossed thresholds.  Each (kind, dimension) pair fires
    /// at most once per run.
    pub fn poll_events(&mut self, iteration: u32) -> Vec<BudgetEvent> {
        let mut events = Vec::new();
        let soft = self.caps.soft_fraction;
        let checks: [(Dimension, f64, f64); 4] = [
            (
                Dimension::Tokens,
                self.tokens_used() as f64,
                self.caps.token_cap as f64,
            ),
            (Dimension::Cost, self.cost_used, self.caps.cost_cap_usd),
            (
                Dimension::Time,
                self.time_used().as_secs_f64(),
                self.caps.time_cap_secs as f64,
            ),
            (
                Dimension::Iterations,
                iteration as f64,
                self.max_iterations as f64,
            ),
        ];
        for (dim, used, cap) in checks {
            if cap <= 0.0 {
                continue;
            }
            if used >= cap && !self.hard_fired.contains(&dim) {
                self.hard_fired.push(dim);
                events.push(BudgetEvent {
                    kind: BudgetEventKind::HardStop,
                    dimension: dim,
                });
            } else if used >= cap * soft && used < cap && !self.soft_fired.contains(&dim) {
                self.soft_fired.push(dim);
                warn!(dimension = %dim, used, cap, "approaching budget cap");
                events.push(BudgetEvent {
                    kind: BudgetEventKind::SoftWarn,
                    dimension: dim,
                });
            }
        }
        events
    }

    /// The dimension that hard-tripped, if any.
    pub fn hard_tripped(&self) -> Option<Dimension> {
        self.hard_fired.first().copied()
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            tokens_used: self.tokens_used(),
            cost_used: self.cost_used,
            time_used_secs: self.time_used().as_secs(),
            per_phase: self.per_phase.clone(),
        }
    }

    pub fn per_phase(&self) -> &BTreeMap<Phase, PhaseUsage> {
        &self.per_phase
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(tokens: u64) -> ledit_config::BudgetConfig {
        ledit_config::BudgetConfig {
            token_cap: tokens,
            cost_cap_usd: 100.0,
            time_cap_secs: 3600,
            soft_fraction: 0.8,
        }
    }

    fn usage(p: u32, c: u32) -> Usage {
        Usage {
            prompt_tokens: p,
            completion_tokens: c,
        }
    }

    #[test]
    fn per_phase_sums_equal_total() {
        let mut t = BudgetTracker::new(caps(10_000), 10);
        t.record(Phase::Planning, usage(100, 20), 0.0, Duration::ZERO);
        t.record(Phase::Codegen, usage(200, 80), 0.0, Duration::ZERO);
        t.record(Phase::Evaluation, usage(50, 10), 0.0, Duration::ZERO);
        let phase_total: u64 = t
            .per_phase()
            .values()
            .map(|u| u.prompt_tokens + u.completion_tokens)
            .sum();
        assert_eq!(phase_total, t.tokens_used());
        assert_eq!(t.tokens_used(), 460);
    }

    #[test]
    fn soft_warn_fires_once_below_cap() {
        let mut t = BudgetTracker::new(caps(100), 10);
        t.record(Phase::Planning, usage(80, 0), 0.0, Duration::ZERO);
        let events = t.poll_events(1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, BudgetEventKind::SoftWarn);
        assert_eq!(events[0].dimension, Dimension::Tokens);
        // Does not refire.
        assert!(t.poll_events(1).is_empty());
    }

    #[test]
    fn hard_stop_fires_exactly_once_at_cap() {
        let mut t = BudgetTracker::new(caps(100), 10);
        t.record(Phase::Planning, usage(100, 0), 0.0, Duration::ZERO);
        let events = t.poll_events(1);
        let hard: Vec<_> = events
            .iter()
            .filter(|e| e.kind == BudgetEventKind::HardStop)
            .collect();
        assert_eq!(hard.len(), 1);
        assert_eq!(t.hard_tripped(), Some(Dimension::Tokens));
        assert!(t.poll_events(1).is_empty(), "hard stop must not refire");
    }

    #[test]
    fn iteration_cap_is_a_dimension() {
        let mut t = BudgetTracker::new(caps(1_000_000), 5);
        let events = t.poll_events(5);
        assert!(events
            .iter()
            .any(|e| e.kind == BudgetEventKind::HardStop && e.dimension == Dimension::Iterations));
    }

    #[test]
    fn cost_accumulates() {
        let mut t = BudgetTracker::new(caps(1_000_000), 10);
        t.record(Phase::Codegen, usage(1, 1), 0.25, Duration::ZERO);
        t.record(Phase::Codegen, usage(1, 1), 0.5, Duration::ZERO);
        assert!((t.cost_used() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn snapshot_round_trips_through_resume() {
        let mut t = BudgetTracker::new(caps(1000), 10);
        t.record(Phase::Planning, usage(100, 50), 0.1, Duration::from_secs(2));
        let snap = t.snapshot();
        let resumed = BudgetTracker::from_snapshot(caps(1000), 10, &snap);
        assert_eq!(resumed.tokens_used(), 150);
        assert!((resumed.cost_used() - 0.1).abs() < 1e-9);
        assert!(resumed.time_used() >= Duration::from_secs(snap.time_used_secs));
    }
}
