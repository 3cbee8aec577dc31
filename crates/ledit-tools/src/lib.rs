// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool layer: the `Tool` trait, the safety interceptor, output redaction,
//! the dispatch pipeline, and the built-in tool catalog.

pub mod builtin;
mod interceptor;
mod redact;
mod registry;
mod tool;

pub use interceptor::{CallClass, Interceptor};
pub use redact::{truncate_with_marker, Redactor, TRUNCATION_MARKER};
pub use registry::ToolRegistry;
pub use tool::{
    spec_of, Capabilities, ErrorKind, ExecContext, RevisionRecorder, Tool, ToolCall, ToolResult,
    ToolSpec,
};

/// Register the standard tool catalog required by the agent loop.
/// Sub-agent tools are registered separately by the dispatcher so the flag
/// that disables them has a single enforcement point.
pub fn register_builtin(registry: &mut ToolRegistry) {
    registry.register(builtin::ReadFileTool);
    registry.register(builtin::WriteFileTool);
    registry.register(builtin::EditSectionTool);
    registry.register(builtin::MicroEditTool);
    registry.register(builtin::RunShellTool);
    registry.register(builtin::SearchFilesTool);
    registry.register(builtin::WorkspaceContextTool);
    registry.register(builtin::ValidateTool);
    registry.register(builtin::CommitTool);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_is_complete() {
        let mut reg = ToolRegistry::new(&ledit_config::ToolsConfig::default());
        register_builtin(&mut reg);
        let names = reg.names();
        for required in [
            "read_file",
            "write_file",
            "edit_file_section",
            "micro_edit",
            "run_shell",
            "search_files",
            "workspace_context",
            "validate",
            "commit",
        ] {
            assert!(names.contains(&required.to_string()), "missing {required}");
        }
    }

    #[test]
    fn every_builtin_declares_capabilities() {
        let mut reg = ToolRegistry::new(&ledit_config::ToolsConfig::default());
        register_builtin(&mut reg);
        for spec in reg.specs() {
            let c = spec.capabilities;
            assert!(
                c.reads_fs || c.mutates_fs || c.runs_shell || c.network || c.spawns_agents,
                "{} has empty capability set",
                spec.name
            );
        }
    }
}
