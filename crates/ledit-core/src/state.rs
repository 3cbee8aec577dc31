// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::budget::BudgetSnapshot;
use crate::conversation::Conversation;
use crate::plan::{Evaluation, Plan};

/// Persisted snapshot of loop progress, written after every iteration so a
/// crashed or interrupted run can be resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub run_id: String,
    pub policy_version: String,
    pub policy_variant: String,
    pub user_intent: String,
    pub conversation: Conversation,
    pub iteration: u32,
    pub max_iterations: u32,
    pub budgets: BudgetSnapshot,
    #[serde(default)]
    pub last_plan: Option<Plan>,
    #[serde(default)]
    pub last_evaluation: Option<Evaluation>,
    pub completed: bool,
    pub interrupted: bool,
    /// Fingerprint of the active configuration; resume is only offered when
    /// it matches.
    pub config_snapshot: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(intent: &str, config: &ledit_config::Config) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            policy_version: config.agent.policy_version.clone(),
            policy_variant: config.agent.policy_variant.clone(),
            user_intent: intent.to_string(),
            conversation: Conversation::new(),
            iteration: 0,
            max_iterations: config.agent.max_iterations,
            budgets: BudgetSnapshot::default(),
            last_plan: None,
            last_evaluation: None,
            completed: false,
            interrupted: false,
            config_snapshot: config.snapshot_hash(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this persisted state may be resumed under `config`.
    pub fn compatible_with(&self, config: &ledit_config::Config) -> bool {
        self.policy_version == config.agent.policy_version
            && self.config_snapshot == config.snapshot_hash()
            && !self.completed
    }
}

/// Atomic persistence of [`AgentState`] in the workspace control directory.
///
/// Writes go through a temp file + rename so a crash mid-write never leaves
/// a truncated state file.  Corrupt files are logged and discarded, never
/// fatal.
pub struct RunStateStore {
    path: PathBuf,
}

impl RunStateStore {
    pub fn new(control: &ledit_config::ControlDir) -> Self {
        Self {
            path: control.run_state_file(),
        }
    }

    /// Store at an explicit path.  Sub-agent runs persist here so they never
    /// shadow the parent's resumable state.
    pub fn at_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn save(&self, state: &AgentState) -> anyhow::Result<()> {
        let mut state = state.clone();
        state.updated_at = Utc::now();
        let text = serde_json::to_string_pretty(&state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(run_id = %state.run_id, iteration = state.iteration, "run state persisted");
        Ok(())
    }

    /// Load the stored state, if any.  A corrupt file is removed and
    /// reported as absent.
    pub fn load(&self) -> Option<AgentState> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&text) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("discarding corrupt run state: {e}");
                let _ = std::fs::remove_file(&self.path);
                None
            }
        }
    }

    /// A state compatible with `config`, for the resume offer at startup.
    pub fn load_resumable(&self, config: &ledit_config::Config) -> Option<AgentState> {
        let state = self.load()?;
        if state.compatible_with(config) {
            Some(state)
        } else {
            debug!("stored run state is incompatible with the active config; ignoring");
            None
        }
    }

    /// Remove the state file (successful completion).
    pub fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &std::path::Path) -> (RunStateStore, ledit_config::Config) {
        let control = ledit_config::ControlDir::new(dir);
        control.ensure().unwrap();
        (RunStateStore::new(&control), ledit_config::Config::default())
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, config) = store_in(tmp.path());
        let mut state = AgentState::new("rename foo to bar", &config);
        state.iteration = 3;
        store.save(&state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.iteration, 3);
        assert_eq!(loaded.user_intent, "rename foo to bar");
    }

    #[test]
    fn resumable_requires_matching_config() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, config) = store_in(tmp.path());
        let state = AgentState::new("x", &config);
        store.save(&state).unwrap();
        assert!(store.load_resumable(&config).is_some());

        let mut other = config.clone();
        other.model.name = "different-model".into();
        assert!(store.load_resumable(&other).is_none());
    }

    #[test]
    fn completed_state_is_not_resumable() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, config) = store_in(tmp.path());
        let mut state = AgentState::new("x", &config);
        state.completed = true;
        store.save(&state).unwrap();
        assert!(store.load_resumable(&config).is_none());
    }

    #[test]
    fn corrupt_state_is_discarded_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store_in(tmp.path());
        std::fs::write(
            ledit_config::ControlDir::new(tmp.path()).run_state_file(),
            "{not valid",
        )
        .unwrap();
        assert!(store.load().is_none());
        assert!(!store.exists(), "corrupt file should be removed");
    }

    #[test]
    fn clear_removes_state_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, config) = store_in(tmp.path());
        store.save(&AgentState::new("x", &config)).unwrap();
        assert!(store.exists());
        store.clear();
        assert!(!store.exists());
    }

    #[test]
    fn no_tmp_file_left_behind_after_save() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, config) = store_in(tmp.path());
        store.save(&AgentState::new("x", &config)).unwrap();
        let control = ledit_config::ControlDir::new(tmp.path());
        let leftover = control.root().join("run_state.json.tmp");
        assert!(!leftover.exists());
    }
}
