use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::WorkspacesConfig;
use crate::conflict::{CommandConflictResolver, ConflictRequest, ConflictResolver, ResolutionOutcome};
use crate::layout::ProjectLayout;
use crate::worktree::{
    combine_diff, diff_stats, parse_merge_tree_conflicts, parse_porcelain, DiffStats,
    DiscardOutcome, FileChange, GitOutput, GitRunner, MergeOptions, MergeOutcome, MergePreview,
    OrphanCleanupReport, RealGitRunner, Result, WorkspaceDiff, WorkspaceError, WorkspaceState,
    WorkspaceStatus,
};

// ---------------------------------------------------------------------------
// WorkspaceEngine
// ---------------------------------------------------------------------------

/// Creates, diffs, merges and discards the per-task git worktrees of one
/// project root.
///
/// Each task gets `.fleet/worktrees/tasks/<spec-id>/` on branch
/// `<prefix><spec-id>`, forked from the base branch.
pub struct WorkspaceEngine {
    layout: ProjectLayout,
    settings: WorkspacesConfig,
    git: Box<dyn GitRunner>,
    resolver: Option<Box<dyn ConflictResolver>>,
}

impl WorkspaceEngine {
    /// Engine using the real git binary and the configured resolver command.
    pub fn new(layout: ProjectLayout, settings: WorkspacesConfig) -> Self {
        let resolver = settings
            .conflict_resolver
            .clone()
            .map(|cmd| Box::new(CommandConflictResolver::new(cmd)) as Box<dyn ConflictResolver>);
        Self {
            layout,
            settings,
            git: Box::new(RealGitRunner),
            resolver,
        }
    }

    /// Engine with a custom git runner (for testing).
    pub fn with_git_runner(
        layout: ProjectLayout,
        settings: WorkspacesConfig,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            layout,
            settings,
            git,
            resolver: None,
        }
    }

    pub fn with_conflict_resolver(mut self, resolver: Box<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn branch_name(&self, spec_id: &str) -> String {
        format!("{}{}", self.settings.branch_prefix, spec_id)
    }

    /// Configured base branch, else `main`, else `master`, else the current branch.
    pub fn base_branch(&self) -> Result<String> {
        if let Some(base) = &self.settings.base_branch {
            return Ok(base.clone());
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate)? {
                return Ok(candidate.to_string());
            }
        }
        self.current_branch()
    }

    pub fn state(&self, spec_id: &str) -> Result<WorkspaceState> {
        validate_name(spec_id)?;
        let path = self.layout.worktree_path(spec_id);
        Ok(WorkspaceState {
            spec_id: spec_id.to_string(),
            exists: path.exists(),
            path,
            branch: self.branch_name(spec_id),
            base_branch: self.base_branch()?,
        })
    }

    // -- lifecycle ----------------------------------------------------------

    /// Create the worktree and seed it with the task's spec directory.
    pub fn create(&self, spec_id: &str) -> Result<WorkspaceState> {
        let mut state = self.state(spec_id)?;
        if state.exists {
            return Err(WorkspaceError::AlreadyExists(state.path.display().to_string()));
        }
        std::fs::create_dir_all(self.layout.worktrees_dir())?;

        let path = state.path.to_string_lossy().into_owned();
        info!(
            spec_id = %spec_id,
            worktree = %path,
            branch = %state.branch,
            base = %state.base_branch,
            "creating workspace"
        );
        if self.branch_exists(&state.branch)? {
            // A previous workspace was removed but its branch kept.
            self.git_ok(&["worktree", "add", &path, &state.branch])?;
        } else {
            self.git_ok(&[
                "worktree",
                "add",
                "-b",
                &state.branch,
                &path,
                &state.base_branch,
            ])?;
        }
        self.seed_spec_copy(spec_id)?;
        state.exists = true;
        Ok(state)
    }

    /// Reuse the workspace if it is already on disk, otherwise create it.
    pub fn ensure(&self, spec_id: &str) -> Result<WorkspaceState> {
        let state = self.state(spec_id)?;
        if state.exists {
            self.seed_spec_copy(spec_id)?;
            return Ok(state);
        }
        self.create(spec_id)
    }

    /// Copy main spec files the worktree does not have yet.
    fn seed_spec_copy(&self, spec_id: &str) -> Result<()> {
        let src = self.layout.spec_dir(spec_id);
        if !src.is_dir() {
            return Ok(());
        }
        let dst = self.layout.worktree_spec_dir(spec_id);
        std::fs::create_dir_all(&dst)?;
        for entry in std::fs::read_dir(&src)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let target = dst.join(entry.file_name());
            if !target.exists() {
                std::fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    }

    // -- inspection ---------------------------------------------------------

    pub fn status(&self, spec_id: &str) -> Result<WorkspaceStatus> {
        let state = self.require(spec_id)?;
        let (_, stats) = self.divergence(&state)?;
        Ok(WorkspaceStatus { state, stats })
    }

    pub fn diff(&self, spec_id: &str) -> Result<WorkspaceDiff> {
        let state = self.require(spec_id)?;
        let (files, stats) = self.divergence(&state)?;
        Ok(WorkspaceDiff {
            state,
            stats,
            files,
        })
    }

    pub fn merge_preview(&self, spec_id: &str) -> Result<MergePreview> {
        let state = self.require(spec_id)?;
        let (_, stats) = self.divergence(&state)?;
        let uncommitted_changes = self.uncommitted_changes()?;
        let conflicts = self.conflicts(&state)?;
        let commits_behind = self.count_commits(&format!("{}..{}", state.branch, state.base_branch))?;
        Ok(MergePreview {
            state,
            stats,
            uncommitted_changes,
            conflicts,
            commits_behind,
        })
    }

    // -- integration --------------------------------------------------------

    /// Integrate the workspace branch into the base branch.
    ///
    /// Refuses (returns [`MergeOutcome::Blocked`]) while the project root has
    /// uncommitted changes, whatever the state of the workspace. Conflicts go
    /// through the resolver once; any that remain are reported and nothing is
    /// merged.
    pub fn merge(&self, spec_id: &str, opts: MergeOptions) -> Result<MergeOutcome> {
        let span = tracing::info_span!("workspace_merge", spec_id = %spec_id, stage_only = opts.stage_only);
        let _enter = span.enter();

        let state = self.require(spec_id)?;

        let uncommitted = self.uncommitted_changes()?;
        if !uncommitted.is_empty() {
            warn!(files = uncommitted.len(), "merge blocked by uncommitted changes in project root");
            return Ok(MergeOutcome::Blocked { uncommitted });
        }

        let current = self.current_branch()?;
        if current != state.base_branch {
            return Err(WorkspaceError::WrongBranch {
                expected: state.base_branch,
                actual: current,
            });
        }

        let (files, _) = self.divergence(&state)?;
        if files.is_empty() {
            info!(branch = %state.branch, "nothing to merge");
            return Ok(MergeOutcome::NothingToMerge);
        }

        let conflicts = self.conflicts(&state)?;
        if !conflicts.is_empty() {
            let remaining = self.resolve_conflicts(&state, conflicts)?;
            if !remaining.is_empty() {
                warn!(branch = %state.branch, conflicts = ?remaining, "merge conflicts remain");
                return Ok(MergeOutcome::Conflict { files: remaining });
            }
        }

        if opts.stage_only {
            self.stage(&state)
        } else {
            self.integrate(&state)
        }
    }

    fn stage(&self, state: &WorkspaceState) -> Result<MergeOutcome> {
        let out = self.git(&["merge", "--squash", &state.branch])?;
        if !out.success {
            let files = self.unmerged_files(&out)?;
            let _ = self.git(&["reset", "--merge"]);
            warn!(branch = %state.branch, conflicts = ?files, "staging merge failed");
            return Ok(MergeOutcome::Conflict { files });
        }
        let files = lines(&self.git_ok(&["diff", "--cached", "--name-only"])?);
        info!(branch = %state.branch, files = files.len(), "changes staged for review");
        Ok(MergeOutcome::Staged { files })
    }

    fn integrate(&self, state: &WorkspaceState) -> Result<MergeOutcome> {
        let out = self.git(&["merge", "--no-ff", "--no-commit", &state.branch])?;
        if !out.success {
            let files = self.unmerged_files(&out)?;
            let _ = self.git(&["merge", "--abort"]);
            warn!(branch = %state.branch, conflicts = ?files, "merge failed and was aborted");
            return Ok(MergeOutcome::Conflict { files });
        }

        let message = format!("Merge {} into {}", state.branch, state.base_branch);
        let commit = self.git(&["commit", "-m", &message])?;
        if !commit.success {
            let _ = self.git(&["merge", "--abort"]);
            return Err(WorkspaceError::Git {
                command: "commit".into(),
                stderr: commit.stderr.trim().to_string(),
            });
        }
        let head = self
            .git_ok(&["rev-parse", "HEAD"])
            .ok()
            .map(|s| s.trim().to_string());

        if let Err(e) = self.remove_workspace(state) {
            warn!(spec_id = %state.spec_id, error = %e, "merged but workspace cleanup failed");
        }
        info!(branch = %state.branch, commit = ?head, "merge successful");
        Ok(MergeOutcome::Merged { commit: head })
    }

    fn resolve_conflicts(&self, state: &WorkspaceState, conflicts: Vec<String>) -> Result<Vec<String>> {
        let Some(resolver) = &self.resolver else {
            return Ok(conflicts);
        };
        if !state.exists {
            return Ok(conflicts);
        }
        let request = ConflictRequest {
            spec_id: &state.spec_id,
            worktree: &state.path,
            branch: &state.branch,
            base_branch: &state.base_branch,
            files: &conflicts,
        };
        match resolver.resolve(&request) {
            ResolutionOutcome::Resolved => {
                let remaining = self.conflicts(state)?;
                info!(spec_id = %state.spec_id, remaining = remaining.len(), "conflict resolution pass finished");
                Ok(remaining)
            }
            ResolutionOutcome::Unresolved(reason) => {
                warn!(spec_id = %state.spec_id, reason = %reason, "conflict resolution failed");
                Ok(conflicts)
            }
        }
    }

    // -- removal ------------------------------------------------------------

    /// Remove the worktree and its branch. An absent workspace is a no-op.
    pub fn discard(&self, spec_id: &str) -> Result<DiscardOutcome> {
        let state = self.state(spec_id)?;
        if !state.exists && !self.branch_exists(&state.branch)? {
            debug!(spec_id = %spec_id, "workspace already absent");
            return Ok(DiscardOutcome::AlreadyAbsent);
        }
        self.remove_workspace(&state)?;
        info!(spec_id = %spec_id, "workspace discarded");
        Ok(DiscardOutcome::Removed)
    }

    fn remove_workspace(&self, state: &WorkspaceState) -> Result<()> {
        if state.path.exists() {
            let path = state.path.to_string_lossy().into_owned();
            let out = self.git(&["worktree", "remove", "--force", &path])?;
            if !out.success {
                warn!(path = %path, stderr = %out.stderr.trim(), "git worktree remove failed, deleting directory");
                if state.path.exists() {
                    std::fs::remove_dir_all(&state.path)?;
                }
                let _ = self.git(&["worktree", "prune"]);
            }
        }
        if self.branch_exists(&state.branch)? {
            self.git_ok(&["branch", "-D", &state.branch])?;
        }
        Ok(())
    }

    /// Workspaces currently on disk.
    pub fn list(&self) -> Result<Vec<WorkspaceState>> {
        self.layout
            .worktree_names()?
            .iter()
            .map(|name| self.state(name))
            .collect()
    }

    /// Workspace directories with no entry in `known_spec_ids`.
    pub fn find_orphans(&self, known_spec_ids: &[String]) -> Result<Vec<String>> {
        Ok(self
            .layout
            .worktree_names()?
            .into_iter()
            .filter(|name| !known_spec_ids.contains(name))
            .collect())
    }

    pub fn discard_orphan(&self, project_id: &str, workspace_name: &str) -> Result<DiscardOutcome> {
        let expected = self.layout.project_id();
        if project_id != expected {
            return Err(WorkspaceError::ProjectMismatch {
                expected,
                requested: project_id.to_string(),
            });
        }
        self.discard(workspace_name)
    }

    /// Best-effort removal of every orphan; failures become warnings.
    pub fn cleanup_orphans(&self, known_spec_ids: &[String]) -> Result<OrphanCleanupReport> {
        let mut report = OrphanCleanupReport::default();
        for name in self.find_orphans(known_spec_ids)? {
            match self.discard(&name) {
                Ok(_) => report.removed.push(name),
                Err(e) => {
                    warn!(workspace = %name, error = %e, "orphan cleanup failed");
                    report.warnings.push(format!("{name}: {e}"));
                }
            }
        }
        Ok(report)
    }

    // -- git helpers --------------------------------------------------------

    fn require(&self, spec_id: &str) -> Result<WorkspaceState> {
        let state = self.state(spec_id)?;
        if !state.exists && !self.branch_exists(&state.branch)? {
            return Err(WorkspaceError::NotFound(spec_id.to_string()));
        }
        Ok(state)
    }

    fn divergence(&self, state: &WorkspaceState) -> Result<(Vec<FileChange>, DiffStats)> {
        let range = format!("{}...{}", state.base_branch, state.branch);
        let commit_count = self.count_commits(&format!("{}..{}", state.base_branch, state.branch))?;
        let name_status = self.git_ok(&["diff", "--name-status", "-M", &range])?;
        let numstat = self.git_ok(&["diff", "--numstat", "-M", &range])?;
        let (files, _) = combine_diff(&name_status, &numstat, commit_count);
        let data_dir = format!("{}/", self.layout.data_dir_name());
        let files: Vec<FileChange> = files
            .into_iter()
            .filter(|f| !f.path.starts_with(&data_dir))
            .collect();
        let stats = diff_stats(&files, commit_count);
        Ok((files, stats))
    }

    fn count_commits(&self, range: &str) -> Result<u32> {
        let out = self.git_ok(&["rev-list", "--count", range])?;
        Ok(out.trim().parse().unwrap_or(0))
    }

    fn uncommitted_changes(&self) -> Result<Vec<String>> {
        let out = self.git_ok(&["status", "--porcelain"])?;
        Ok(parse_porcelain(&out, self.layout.data_dir_name()))
    }

    fn conflicts(&self, state: &WorkspaceState) -> Result<Vec<String>> {
        let out = self.git(&[
            "merge-tree",
            "--write-tree",
            "--name-only",
            "--no-messages",
            &state.base_branch,
            &state.branch,
        ])?;
        if out.success {
            return Ok(Vec::new());
        }
        let files = parse_merge_tree_conflicts(&out.stdout);
        if files.is_empty() {
            return Err(WorkspaceError::Git {
                command: "merge-tree".into(),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(files)
    }

    fn unmerged_files(&self, merge_out: &GitOutput) -> Result<Vec<String>> {
        let files = lines(&self.git(&["diff", "--name-only", "--diff-filter=U"])?.stdout);
        if !files.is_empty() {
            return Ok(files);
        }
        let text = format!("{}\n{}", merge_out.stdout, merge_out.stderr);
        Ok(text
            .lines()
            .filter(|l| l.contains("CONFLICT"))
            .map(|l| l.trim().to_string())
            .collect())
    }

    fn current_branch(&self) -> Result<String> {
        Ok(self
            .git_ok(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        Ok(self
            .git(&["rev-parse", "--verify", "--quiet", &reference])?
            .success)
    }

    fn git(&self, args: &[&str]) -> Result<GitOutput> {
        self.git_in(self.layout.root(), args)
    }

    fn git_in(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        self.git.run_git(dir, args).map_err(WorkspaceError::Runner)
    }

    fn git_ok(&self, args: &[&str]) -> Result<String> {
        let out = self.git(args)?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(WorkspaceError::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

fn lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate_name(name: &str) -> Result<()> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\');
    if plain {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidName(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
