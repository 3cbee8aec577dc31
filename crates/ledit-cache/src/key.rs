// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Argument fields that never participate in the cache key.  Their values
/// change between otherwise identical invocations and would defeat
/// memoization entirely.
const VOLATILE_FIELDS: &[&str] = &["timestamp", "request_id", "nonce"];

/// Argument fields whose values are filesystem paths and must be cleaned
/// and made workspace-relative before hashing, so `./src/main.rs`,
/// `src/./main.rs`, and the absolute form all produce the same key.
const PATH_FIELDS: &[&str] = &["path", "file", "target", "workdir", "directory"];

/// Build the canonical cache key for a tool invocation.
///
/// Canonicalization rules: argument keys are alphabetized, volatile fields
/// are stripped, and path-valued fields are cleaned relative to
/// `workspace_root`.  The result is a hex-encoded sha256 so keys are safe
/// to use as identifiers in the persisted store.
pub fn canonical_key(tool_name: &str, args: &Value, workspace_root: &Path) -> String {
    let canon = canonicalize_args(args, workspace_root);
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(canon.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// The canonical (alphabetized, cleaned) form of the arguments, exposed for
/// tests and for the registry's duplicate-shell-command detection.
pub fn canonicalize_args(args: &Value, workspace_root: &Path) -> Value {
    match args {
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (k, v) in map {
                if VOLATILE_FIELDS.contains(&k.as_str()) {
                    continue;
                }
                let cleaned = if PATH_FIELDS.contains(&k.as_str()) {
                    match v.as_str() {
                        Some(s) => Value::String(clean_path(s, workspace_root)),
                        None => v.clone(),
                    }
                } else {
                    canonicalize_args(v, workspace_root)
                };
                sorted.insert(k.clone(), cleaned);
            }
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| canonicalize_args(v, workspace_root))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Lexically clean a path and strip the workspace root prefix when present.
pub fn clean_path(raw: &str, workspace_root: &Path) -> String {
    let p = Path::new(raw);
    let p = p.strip_prefix(workspace_root).unwrap_or(p);

    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out.to_string_lossy().into_owned()
}

/// sha256 of a file's current content, hex-encoded.  `None` when the file
/// cannot be read (missing, permission).
pub fn file_content_hash(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(hex::encode(hasher.finalize()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn key_is_independent_of_argument_order() {
        let root = Path::new("/w");
        let a = canonical_key("read_file", &json!({"path": "a.rs", "limit": 5}), root);
        let b = canonical_key("read_file", &json!({"limit": 5, "path": "a.rs"}), root);
        assert_eq!(a, b);
    }

    #[test]
    fn key_differs_per_tool_name() {
        let root = Path::new("/w");
        let args = json!({"path": "a.rs"});
        assert_ne!(
            canonical_key("read_file", &args, root),
            canonical_key("search_files", &args, root)
        );
    }

    #[test]
    fn volatile_fields_do_not_affect_key() {
        let root = Path::new("/w");
        let a = canonical_key("run_shell", &json!({"command": "ls", "request_id": "1"}), root);
        let b = canonical_key("run_shell", &json!({"command": "ls", "request_id": "2"}), root);
        assert_eq!(a, b);
    }

    #[test]
    fn redundant_dot_segments_are_cleaned() {
        let root = Path::new("/w");
        let a = canonical_key("read_file", &json!({"path": "./src/main.rs"}), root);
        let b = canonical_key("read_file", &json!({"path": "src/./main.rs"}), root);
        assert_eq!(a, b);
    }

    #[test]
    fn absolute_workspace_paths_equal_relative_ones() {
        let root = Path::new("/work/project");
        let a = canonical_key("read_file", &json!({"path": "/work/project/src/lib.rs"}), root);
        let b = canonical_key("read_file", &json!({"path": "src/lib.rs"}), root);
        assert_eq!(a, b);
    }

    #[test]
    fn clean_path_resolves_parent_segments() {
        assert_eq!(clean_path("src/../lib/x.rs", Path::new("/w")), "lib/x.rs");
    }

    #[test]
    fn file_content_hash_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("x.txt");
        std::fs::write(&f, "one").unwrap();
        let h1 = file_content_hash(&f).unwrap();
        std::fs::write(&f, "two").unwrap();
        let h2 = file_content_hash(&f).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn file_content_hash_missing_file_is_none() {
        assert!(file_content_hash(Path::new("/nonexistent/q.bin")).is_none());
    }
}
