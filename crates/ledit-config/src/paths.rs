// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

/// Name of the hidden control directory at the workspace root.
pub const CONTROL_DIR: &str = ".ledit";

/// Layout of the per-workspace control directory.
///
/// Everything the agent persists lives under `.ledit/` at the workspace
/// root: configuration, active run state, the evidence cache, the verbose
/// log, the pricing table, and the registry of running instances.
#[derive(Debug, Clone)]
pub struct ControlDir {
    root: PathBuf,
}

impl ControlDir {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            root: workspace_root.as_ref().join(CONTROL_DIR),
        }
    }

    /// Create the directory tree if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.evidence_cache_dir())?;
        std::fs::create_dir_all(self.revisions_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Active AgentState; absent when no run is in flight.
    pub fn run_state_file(&self) -> PathBuf {
        self.root.join("run_state.json")
    }

    pub fn evidence_cache_dir(&self) -> PathBuf {
        self.root.join("evidence_cache")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("workspace.log")
    }

    /// Workspace index maintained by the embedding subsystem.
    pub fn workspace_index_file(&self) -> PathBuf {
        self.root.join("workspace.json")
    }

    pub fn pricing_file(&self) -> PathBuf {
        self.root.join("model_pricing.json")
    }

    pub fn instances_file(&self) -> PathBuf {
        self.root.join("instances.json")
    }

    pub fn revisions_dir(&self) -> PathBuf {
        self.root.join("revisions")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_hidden_dir() {
        let c = ControlDir::new("/work");
        assert_eq!(c.root(), Path::new("/work/.ledit"));
        assert_eq!(c.run_state_file(), Path::new("/work/.ledit/run_state.json"));
        assert_eq!(
            c.evidence_cache_dir(),
            Path::new("/work/.ledit/evidence_cache")
        );
    }

    #[test]
    fn ensure_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let c = ControlDir::new(tmp.path());
        c.ensure().unwrap();
        assert!(c.evidence_cache_dir().is_dir());
        assert!(c.revisions_dir().is_dir());
    }
}
