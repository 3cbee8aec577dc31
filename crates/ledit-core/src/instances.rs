// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One running ledit process, as advertised in `instances.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub pid: u32,
    /// Web UI port, when the server is running.
    pub port: Option<u16>,
    pub started_at: DateTime<Utc>,
}

impl Instance {
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

/// Registry of running processes in the control directory.  Entries whose
/// pid no longer exists are pruned on every read, so a crashed process
/// cannot leave a phantom entry forever.
pub struct InstanceRegistry {
    path: PathBuf,
}

impl InstanceRegistry {
    pub fn new(control: &ledit_config::ControlDir) -> Self {
        Self {
            path: control.instances_file(),
        }
    }

    /// Register the current process.  Returns the recorded entry.
    pub fn register(&self, port: Option<u16>) -> Instance {
        let me = Instance {
            pid: std::process::id(),
            port,
            started_at: Utc::now(),
        };
        let mut all = self.read_live();
        all.retain(|i| i.pid != me.pid);
        all.push(me.clone());
        self.write(&all);
        me
    }

    /// Remove the current process on clean shutdown.
    pub fn deregister(&self) {
        let mut all = self.read_live();
        let me = std::process::id();
        all.retain(|i| i.pid != me);
        self.write(&all);
    }

    /// All live instances (dead pids pruned).
    pub fn list(&self) -> Vec<Instance> {
        let live = self.read_live();
        self.write(&live);
        live
    }

    fn read_live(&self) -> Vec<Instance> {
        let entries: Vec<Instance> = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        entries.into_iter().filter(|i| pid_alive(i.pid)).collect()
    }

    fn write(&self, entries: &[Instance]) {
        match serde_json::to_string_pretty(entries) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    warn!("failed to write instance registry: {e}");
                }
            }
            Err(e) => warn!("failed to serialize instance registry: {e}"),
        }
    }
}

/// Signal 0 probes for existence without sending anything.
fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
