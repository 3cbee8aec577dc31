// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ledit_tools::RevisionRecorder;

/// One recorded pre-edit snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub id: String,
    /// Workspace-relative path of the touched file.
    pub path: PathBuf,
    /// Content before the edit; `None` when the file was newly created.
    pub prior: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Journal of pre-edit file snapshots under `.ledit/revisions/`, one JSON
/// file per revision.  `ledit rollback <id>` restores the snapshot.
pub struct RevisionLog {
    dir: PathBuf,
    workspace_root: PathBuf,
    counter: Mutex<u32>,
    run_id: String,
}

impl RevisionLog {
    pub fn new(control: &ledit_config::ControlDir, workspace_root: &Path, run_id: &str) -> Self {
        Self {
            dir: control.revisions_dir(),
            workspace_root: workspace_root.to_path_buf(),
            counter: Mutex::new(0),
            run_id: run_id.to_string(),
        }
    }

    /// List all recorded revisions, newest first.
    pub fn list(dir: &Path) -> Vec<Revision> {
        let mut revisions: Vec<Revision> = std::fs::read_dir(dir)
            .into_iter()
            .flatten()
            .filter_map(Result::ok)
            .filter_map(|e| std::fs::read_to_string(e.path()).ok())
            .filter_map(|text| serde_json::from_str(&text).ok())
            .collect();
        revisions.sort_by(|a: &Revision, b: &Revision| b.recorded_at.cmp(&a.recorded_at));
        revisions
    }

    /// Restore the file recorded under `revision_id`.  A `prior` of `None`
    /// means the edit created the file, so rollback deletes it.
    pub fn rollback(dir: &Path, workspace_root: &Path, revision_id: &str) -> anyhow::Result<()> {
        let file = dir.join(format!("{revision_id}.json"));
        let text = std::fs::read_to_string(&file)
            .map_err(|_| anyhow::anyhow!("unknown revision id: {revision_id}"))?;
        let revision: Revision = serde_json::from_str(&text)?;
        let target = workspace_root.join(&revision.path);
        match &revision.prior {
            Some(content) => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, content)?;
            }
            None => {
                let _ = std::fs::remove_file(&target);
            }
        }
        debug!(revision_id, path = %revision.path.display(), "rolled back");
        Ok(())
    }
}

impl RevisionRecorder for RevisionLog {
    fn record(&self, path: &Path, prior: Option<&str>) {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        let id = format!("{}-{:03}", self.run_id, *counter);
        drop(counter);

        let rel = path
            .strip_prefix(&self.workspace_root)
            .unwrap_or(path)
            .to_path_buf();
        let revision = Revision {
            id: id.clone(),
            path: rel,
            prior: prior.map(String::from),
            recorded_at: Utc::now(),
        };
        let file = self.dir.join(format!("{id}.json"));
        match serde_json::to_string_pretty(&revision) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&file, text) {
                    warn!("failed to record revision {id}: {e}");
                }
            }
            Err(e) => warn!("failed to serialize revision {id}: {e}"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(dir: &Path) -> (RevisionLog, ledit_config::ControlDir) {
        let control = ledit_config::ControlDir::new(dir);
        control.ensure().unwrap();
        (RevisionLog::new(&control, dir, "run1"), control)
    }

    #[test]
    fn record_and_rollback_restores_content() {
        let tmp = tempfile::tempdir().unwrap();
        let (log, control) = setup(tmp.path());
        let file = tmp.path().join("code.rs");
        std::fs::write(&file, "original").unwrap();

        log.record(&file, Some("original"));
        std::fs::write(&file, "mutated").unwrap();

        RevisionLog::rollback(&control.revisions_dir(), tmp.path(), "run1-001").unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "original");
    }

    #[test]
    fn rollback_of_created_file_deletes_it() {
        let tmp = tempfile::tempdir().unwrap();
        let (log, control) = setup(tmp.path());
        let file = tmp.path().join("new.rs");

        log.record(&file, None);
        std::fs::write(&file, "created by agent").unwrap();

        RevisionLog::rollback(&control.revisions_dir(), tmp.path(), "run1-001").unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn unknown_revision_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, control) = setup(tmp.path());
        let err = RevisionLog::rollback(&control.revisions_dir(), tmp.path(), "nope");
        assert!(err.is_err());
    }

    #[test]
    fn list_returns_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let (log, control) = setup(tmp.path());
        log.record(&tmp.path().join("a"), Some("1"));
        log.record(&tmp.path().join("b"), Some("2"));
        let all = RevisionLog::list(&control.revisions_dir());
        assert_eq!(all.len(), 2);
        assert!(all[0].recorded_at >= all[1].recorded_at);
    }

    #[test]
    fn ids_are_sequential_within_a_run() {
        let tmp = tempfile::tempdir().unwrap();
        let (log, control) = setup(tmp.path());
        log.record(&tmp.path().join("a"), Some("1"));
        log.record(&tmp.path().join("b"), Some("2"));
        let mut ids: Vec<String> = RevisionLog::list(&control.revisions_dir())
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["run1-001", "run1-002"]);
    }
}
