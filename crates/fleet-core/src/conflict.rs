//! Automated conflict resolution pass run before a merge gives up.
//!
//! A resolver works inside the task's worktree: it integrates the base
//! branch into the workspace branch and commits the result there. The
//! workspace engine then re-checks for conflicts; it never overwrites files
//! itself.

use std::path::Path;
use std::process::Command;

use crate::config::ConflictResolverCommand;

#[derive(Debug, Clone)]
pub struct ConflictRequest<'a> {
    pub spec_id: &'a str,
    pub worktree: &'a Path,
    pub branch: &'a str,
    pub base_branch: &'a str,
    pub files: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Resolved,
    Unresolved(String),
}

pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, request: &ConflictRequest<'_>) -> ResolutionOutcome;
}

/// Runs a configured command in the worktree.
///
/// The command sees `FLEET_SPEC_ID`, `FLEET_BRANCH`, `FLEET_BASE_BRANCH` and
/// `FLEET_CONFLICT_FILES` (newline separated). Exit status 0 means resolved.
pub struct CommandConflictResolver {
    command: ConflictResolverCommand,
}

impl CommandConflictResolver {
    pub fn new(command: ConflictResolverCommand) -> Self {
        Self { command }
    }
}

impl ConflictResolver for CommandConflictResolver {
    fn resolve(&self, request: &ConflictRequest<'_>) -> ResolutionOutcome {
        tracing::info!(
            spec_id = %request.spec_id,
            command = %self.command.command,
            files = request.files.len(),
            "running conflict resolver"
        );
        let output = Command::new(&self.command.command)
            .args(&self.command.args)
            .current_dir(request.worktree)
            .env("FLEET_SPEC_ID", request.spec_id)
            .env("FLEET_BRANCH", request.branch)
            .env("FLEET_BASE_BRANCH", request.base_branch)
            .env("FLEET_CONFLICT_FILES", request.files.join("\n"))
            .output();

        match output {
            Ok(out) if out.status.success() => ResolutionOutcome::Resolved,
            Ok(out) => ResolutionOutcome::Unresolved(format!(
                "resolver exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )),
            Err(e) => ResolutionOutcome::Unresolved(format!("resolver could not start: {e}")),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request<'a>(dir: &'a Path, files: &'a [String]) -> ConflictRequest<'a> {
        ConflictRequest {
            spec_id: "001-a",
            worktree: dir,
            branch: "fleet/001-a",
            base_branch: "main",
            files,
        }
    }

    #[test]
    fn successful_command_resolves() {
        let tmp = tempfile::tempdir().unwrap();
        let files = vec!["a.rs".to_string()];
        let resolver = CommandConflictResolver::new(ConflictResolverCommand {
            command: "sh".into(),
            args: vec!["-c".into(), "test \"$FLEET_CONFLICT_FILES\" = a.rs".into()],
        });
        assert_eq!(
            resolver.resolve(&request(tmp.path(), &files)),
            ResolutionOutcome::Resolved
        );
    }

    #[test]
    fn failing_command_is_unresolved() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = CommandConflictResolver::new(ConflictResolverCommand {
            command: "sh".into(),
            args: vec!["-c".into(), "exit 3".into()],
        });
        assert!(matches!(
            resolver.resolve(&request(tmp.path(), &[])),
            ResolutionOutcome::Unresolved(_)
        ));
    }

    #[test]
    fn missing_command_is_unresolved() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = CommandConflictResolver::new(ConflictResolverCommand {
            command: "fleet-no-such-resolver-binary".into(),
            args: vec![],
        });
        assert!(matches!(
            resolver.resolve(&request(tmp.path(), &[])),
            ResolutionOutcome::Unresolved(_)
        ));
    }
}
