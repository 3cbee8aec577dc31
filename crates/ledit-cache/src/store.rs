// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::key::file_content_hash;

/// Values larger than this are not worth memoizing; re-running the tool is
/// cheaper than dragging megabytes through the store on every run.
const MAX_VALUE_BYTES: usize = 64 * 1024;

/// Hash of a source file captured when the entry was written.  A lookup
/// re-hashes the live file; mismatch means the cached output describes a
/// file that no longer exists in that form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileValidator {
    pub path: PathBuf,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub key: String,
    pub value: String,
    pub ingested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<FileValidator>,
}

/// Persistent, hash-validated memoization of read-only tool outputs.
///
/// Entries live in one append-structured JSONL file; the newest record for a
/// key wins.  The file is compacted on open (dead records dropped, entry
/// count trimmed to the LRU bound).  Lookups of file-derived entries
/// re-validate against the live file and lazily evict on mismatch.
pub struct EvidenceCache {
    file: PathBuf,
    workspace_root: PathBuf,
    mem: Mutex<LruCache<String, EvidenceEntry>>,
    /// Per-key guards so two tasks asking for the same missing key compute
    /// it once; distinct keys proceed in parallel.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EvidenceCache {
    /// Open (or create) the store under `dir`, compacting the log.
    pub fn open(
        dir: &Path,
        workspace_root: &Path,
        max_entries: usize,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join("entries.jsonl");
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap();
        let mut mem = LruCache::new(cap);

        if file.is_file() {
            let text = std::fs::read_to_string(&file)?;
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<EvidenceEntry>(line) {
                    // Later records shadow earlier ones and refresh recency.
                    Ok(entry) => {
                        mem.put(entry.key.clone(), entry);
                    }
                    Err(e) => warn!("skipping corrupt cache record: {e}"),
                }
            }
        }

        let cache = Self {
            file,
            workspace_root: workspace_root.to_path_buf(),
            mem: Mutex::new(mem),
            locks: Mutex::new(HashMap::new()),
        };
        cache.compact()?;
        Ok(cache)
    }

    /// Look up a key.  File-derived entries are re-validated against the
    /// live file; a stale entry is evicted and reported as absent.
    pub fn lookup(&self, key: &str) -> Option<String> {
        let mut mem = self.mem.lock().unwrap();
        let entry = mem.get(key)?.clone();
        if let Some(v) = &entry.validator {
            let live = file_content_hash(&self.workspace_root.join(&v.path));
            if live.as_deref() != Some(v.content_hash.as_str()) {
                debug!(key, path = %v.path.display(), "evidence entry stale; evicting");
                mem.pop(key);
                return None;
            }
        }
        Some(entry.value)
    }

    /// Insert a value.  Oversized values are silently not cached.
    pub fn insert(&self, key: &str, value: &str, validator: Option<FileValidator>) {
        if value.len() > MAX_VALUE_BYTES {
            debug!(key, len = value.len(), "value exceeds cache bound; not stored");
            return;
        }
        let entry = EvidenceEntry {
            key: key.to_string(),
            value: value.to_string(),
            ingested_at: Utc::now(),
            validator,
        };
        self.mem.lock().unwrap().put(key.to_string(), entry.clone());
        if let Err(e) = self.append(&entry) {
            warn!("failed to append cache entry: {e}");
        }
    }

    /// Acquire the computation guard for `key`.  Hold it across the
    /// lookup-miss → execute → insert window.
    pub async fn lock_key(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let m = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        m.lock_owned().await
    }

    /// Number of live in-memory entries.
    pub fn len(&self) -> usize {
        self.mem.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, entry: &EvidenceEntry) -> anyhow::Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)?;
        writeln!(f, "{}", serde_json::to_string(entry)?)?;
        Ok(())
    }

    /// Rewrite the log with only the surviving entries, oldest-recency first
    /// so a reload reconstructs the same LRU order.
    fn compact(&self) -> anyhow::Result<()> {
        let mem = self.mem.lock().unwrap();
        let mut lines = Vec::with_capacity(mem.len());
        // LruCache iterates most-recent first; reverse for reload order.
        for (_, entry) in mem.iter() {
            lines.push(serde_json::to_string(entry)?);
        }
        lines.reverse();
        let tmp = self.file.with_extension("jsonl.tmp");
        std::fs::write(&tmp, lines.join("\n") + "\n")?;
        std::fs::rename(&tmp, &self.file)?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn open_cache(dir: &Path) -> EvidenceCache {
        EvidenceCache::open(&dir.join("cache"), dir, 64).unwrap()
    }

    #[test]
    fn insert_then_lookup_returns_value() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        cache.insert("k1", "hello", None);
        assert_eq!(cache.lookup("k1").as_deref(), Some("hello"));
    }

    #[test]
    fn lookup_missing_key_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        assert!(cache.lookup("nope").is_none());
    }

    #[test]
    fn entries_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let cache = open_cache(tmp.path());
            cache.insert("persisted", "value", None);
        }
        let cache = open_cache(tmp.path());
        assert_eq!(cache.lookup("persisted").as_deref(), Some("value"));
    }

    #[test]
    fn newest_record_wins_on_reload() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let cache = open_cache(tmp.path());
            cache.insert("k", "old", None);
            cache.insert("k", "new", None);
        }
        let cache = open_cache(tmp.path());
        assert_eq!(cache.lookup("k").as_deref(), Some("new"));
    }

    #[test]
    fn stale_file_validator_evicts_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("watched.txt");
        std::fs::write(&target, "v1").unwrap();
        let cache = open_cache(tmp.path());
        let validator = FileValidator {
            path: PathBuf::from("watched.txt"),
            content_hash: file_content_hash(&target).unwrap(),
        };
        cache.insert("fk", "derived-from-v1", Some(validator));
        assert!(cache.lookup("fk").is_some());

        std::fs::write(&target, "v2").unwrap();
        assert!(cache.lookup("fk").is_none(), "mismatch must evict");
        assert!(cache.lookup("fk").is_none(), "entry stays gone");
    }

    #[test]
    fn deleted_file_invalidates_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("gone.txt");
        std::fs::write(&target, "data").unwrap();
        let cache = open_cache(tmp.path());
        let validator = FileValidator {
            path: PathBuf::from("gone.txt"),
            content_hash: file_content_hash(&target).unwrap(),
        };
        cache.insert("gk", "derived", Some(validator));
        std::fs::remove_file(&target).unwrap();
        assert!(cache.lookup("gk").is_none());
    }

    #[test]
    fn lru_bound_evicts_oldest() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = EvidenceCache::open(&tmp.path().join("cache"), tmp.path(), 2).unwrap();
        cache.insert("a", "1", None);
        cache.insert("b", "2", None);
        cache.insert("c", "3", None);
        assert!(cache.lookup("a").is_none());
        assert_eq!(cache.lookup("c").as_deref(), Some("3"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn oversized_value_is_not_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        let big = "x".repeat(MAX_VALUE_BYTES + 1);
        cache.insert("big", &big, None);
        assert!(cache.lookup("big").is_none());
    }

    #[test]
    fn corrupt_lines_are_skipped_on_open() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("cache");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("entries.jsonl"), "not json\n").unwrap();
        let cache = EvidenceCache::open(&dir, tmp.path(), 8).unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn per_key_lock_serializes_same_key() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(open_cache(tmp.path()));
        let g1 = cache.lock_key("shared").await;
        let c2 = Arc::clone(&cache);
        let pending = tokio::spawn(async move {
            let _g = c2.lock_key("shared").await;
        });
        // Distinct key proceeds while "shared" is held.
        let _other = cache.lock_key("different").await;
        assert!(!pending.is_finished());
        drop(g1);
        pending.await.unwrap();
    }
}
