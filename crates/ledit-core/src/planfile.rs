// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Multi-agent orchestration file consumed by `ledit process`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    pub version: u32,
    pub goal: String,
    pub agents: Vec<PlanAgent>,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub settings: PlanSettings,
    /// Shell command run after all steps complete.
    #[serde(default)]
    pub validation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAgent {
    pub id: String,
    /// Persona role: coder, tester, reviewer, debugger, researcher.
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    /// References a [`PlanAgent::id`].
    pub agent: String,
    pub task: String,
    /// Step ids that must complete before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanSettings {
    #[serde(default)]
    pub max_iterations_per_step: Option<u32>,
}

impl PlanFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading plan file {}", path.display()))?;
        let plan: PlanFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing plan file {}", path.display()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Structural validation: all referenced ids exist, step ids are unique,
    /// and the dependency graph is acyclic.
    pub fn validate(&self) -> anyhow::Result<()> {
        let agent_ids: HashSet<&str> = self.agents.iter().map(|a| a.id.as_str()).collect();
        if agent_ids.len() != self.agents.len() {
            bail!("duplicate agent ids in plan file");
        }

        let mut step_ids = HashSet::new();
        for step in &self.steps {
            if !step_ids.insert(step.id.as_str()) {
                bail!("duplicate step id: {}", step.id);
            }
            if !agent_ids.contains(step.agent.as_str()) {
                bail!("step {} references unknown agent: {}", step.id, step.agent);
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !step_ids.contains(dep.as_str()) {
                    bail!("step {} depends on unknown step: {dep}", step.id);
                }
            }
        }

        self.check_acyclic()?;
        Ok(())
    }

    /// Steps in a valid execution order (dependencies first).
    pub fn execution_order(&self) -> anyhow::Result<Vec<&PlanStep>> {
        let by_id: HashMap<&str, &PlanStep> =
            self.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut order = Vec::new();
        let mut done: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&PlanStep> = self.steps.iter().collect();

        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|step| {
                let ready = step.depends_on.iter().all(|d| done.contains(d.as_str()));
                if ready {
                    done.insert(step.id.as_str());
                    order.push(by_id[step.id.as_str()]);
                }
                !ready
            });
            if remaining.len() == before {
                bail!("dependency cycle in plan file");
            }
        }
        Ok(order)
    }

    fn check_acyclic(&self) -> anyhow::Result<()> {
        self.execution_order().map(|_| ())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(json: &str) -> anyhow::Result<PlanFile> {
        let p: PlanFile = serde_json::from_str(json).unwrap();
        p.validate()?;
        Ok(p)
    }

    const VALID: &str = r#"{
        "version": 1,
        "goal": "add retry logic",
        "agents": [
            {"id": "c", "role": "coder"},
            {"id": "t", "role": "tester"}
        ],
        "steps": [
            {"id": "s1", "agent": "c", "task": "implement"},
            {"id": "s2", "agent": "t", "task": "test", "depends_on": ["s1"]}
        ],
        "settings": {},
        "validation": "cargo test"
    }"#;

    #[test]
    fn valid_plan_passes_and_orders_steps() {
        let p = plan(VALID).unwrap();
        let order: Vec<&str> = p
            .execution_order()
            .unwrap()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(order, vec!["s1", "s2"]);
    }

    #[test]
    fn unknown_agent_reference_fails() {
        let bad = VALID.replace("\"agent\": \"t\"", "\"agent\": \"ghost\"");
        assert!(plan(&bad).is_err());
    }

    #[test]
    fn unknown_dependency_fails() {
        let bad = VALID.replace("[\"s1\"]", "[\"s99\"]");
        assert!(plan(&bad).is_err());
    }

    #[test]
    fn cycle_is_detected() {
        let cyclic = r#"{
            "version": 1,
            "goal": "g",
            "agents": [{"id": "c", "role": "coder"}],
            "steps": [
                {"id": "a", "agent": "c", "task": "x", "depends_on": ["b"]},
                {"id": "b", "agent": "c", "task": "y", "depends_on": ["a"]}
            ]
        }"#;
        let err = plan(cyclic).unwrap_err().to_string();
        assert!(err.contains("cycle"));
    }

    #[test]
    fn duplicate_step_ids_fail() {
        let dup = VALID.replace("\"id\": \"s2\"", "\"id\": \"s1\"");
        assert!(plan(&dup).is_err());
    }

    #[test]
    fn independent_steps_order_after_dependencies() {
        let p = plan(
            r#"{
            "version": 1,
            "goal": "g",
            "agents": [{"id": "c", "role": "coder"}],
            "steps": [
                {"id": "late", "agent": "c", "task": "z", "depends_on": ["a", "b"]},
                {"id": "a", "agent": "c", "task": "x"},
                {"id": "b", "agent": "c", "task": "y"}
            ]
        }"#,
        )
        .unwrap();
        let order: Vec<&str> = p
            .execution_order()
            .unwrap()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(order.last(), Some(&"late"));
    }
}
