use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by workspace (git worktree) operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// A git command ran and exited non-zero.
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    /// The git binary could not be run at all.
    #[error("could not run git: {0}")]
    Runner(String),

    #[error("workspace already exists: {0}")]
    AlreadyExists(String),

    #[error("no workspace for spec {0}")]
    NotFound(String),

    /// The project root must have the base branch checked out to integrate.
    #[error("project root is on '{actual}', expected base branch '{expected}'")]
    WrongBranch { expected: String, actual: String },

    #[error("workspace name '{0}' is not a plain directory name")]
    InvalidName(String),

    #[error("workspace belongs to project '{expected}', not '{requested}'")]
    ProjectMismatch { expected: String, requested: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    /// Run a git command in `dir`. `Err` only when git could not be started.
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Workspace data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceState {
    pub spec_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub exists: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub additions: u64,
    pub deletions: u64,
    pub commit_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Added,
    Deleted,
    Modified,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub old_path: Option<String>,
    pub kind: FileChangeKind,
    pub additions: u64,
    pub deletions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    pub state: WorkspaceState,
    pub stats: DiffStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDiff {
    pub state: WorkspaceState,
    pub stats: DiffStats,
    pub files: Vec<FileChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePreview {
    pub state: WorkspaceState,
    pub stats: DiffStats,
    /// Uncommitted paths in the project root. Non-empty means merging is blocked.
    pub uncommitted_changes: Vec<String>,
    /// Files that conflict between the workspace branch and the base tip.
    pub conflicts: Vec<String>,
    /// Commits on the base branch the workspace has not seen.
    pub commits_behind: u32,
}

impl MergePreview {
    pub fn is_blocked(&self) -> bool {
        !self.uncommitted_changes.is_empty()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn can_merge(&self) -> bool {
        !self.is_blocked() && !self.has_conflicts() && self.stats.files_changed > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Leave the changes staged, uncommitted, in the project root.
    pub stage_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged { commit: Option<String> },
    Staged { files: Vec<String> },
    NothingToMerge,
    Conflict { files: Vec<String> },
    /// The project root has uncommitted changes; nothing was touched.
    Blocked { uncommitted: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardOutcome {
    Removed,
    AlreadyAbsent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanCleanupReport {
    pub removed: Vec<String>,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Parse `git diff --name-status -M` output.
pub fn parse_name_status(stdout: &str) -> Vec<FileChange> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let code = parts.next()?;
            let first = parts.next()?.to_string();
            let second = parts.next().map(str::to_string);
            let (kind, path, old_path) = match code.chars().next()? {
                'A' => (FileChangeKind::Added, first, None),
                'D' => (FileChangeKind::Deleted, first, None),
                'R' => (FileChangeKind::Renamed, second?, Some(first)),
                'C' => (FileChangeKind::Added, second?, None),
                _ => (FileChangeKind::Modified, first, None),
            };
            Some(FileChange {
                path,
                old_path,
                kind,
                additions: 0,
                deletions: 0,
            })
        })
        .collect()
}

/// Parse `git diff --numstat -M` output into `(path, additions, deletions)`.
///
/// Binary files report `-` counts and are taken as zero. Rename paths are
/// reduced to the new path.
pub fn parse_numstat(stdout: &str) -> Vec<(String, u64, u64)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let adds = parts.next()?.trim().parse().unwrap_or(0);
            let dels = parts.next()?.trim().parse().unwrap_or(0);
            let path = rename_target(parts.next()?.trim());
            Some((path, adds, dels))
        })
        .collect()
}

/// `src/{a => b}/x.rs` -> `src/b/x.rs`, `a.rs => b.rs` -> `b.rs`.
fn rename_target(path: &str) -> String {
    if let (Some(open), Some(close)) = (path.find('{'), path.find('}')) {
        if open < close {
            let inner = &path[open + 1..close];
            if let Some((_, new)) = inner.split_once(" => ") {
                let joined = format!("{}{}{}", &path[..open], new, &path[close + 1..]);
                return joined.replace("//", "/");
            }
        }
    }
    match path.split_once(" => ") {
        Some((_, new)) => new.to_string(),
        None => path.to_string(),
    }
}

/// Paths from `git status --porcelain`, skipping anything under `exclude_prefix`.
pub fn parse_porcelain(stdout: &str, exclude_prefix: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|l| l.len() > 3)
        .map(|line| {
            let rest = &line[3..];
            let path = rest.rsplit_once(" -> ").map(|(_, new)| new).unwrap_or(rest);
            path.trim_matches('"').to_string()
        })
        .filter(|path| {
            let dir = exclude_prefix.trim_end_matches('/');
            !(path == dir || path.starts_with(&format!("{dir}/")))
        })
        .collect()
}

/// Conflicted files from `git merge-tree --write-tree --name-only --no-messages`.
///
/// The first line is the result tree id; conflicted paths follow.
pub fn parse_merge_tree_conflicts(stdout: &str) -> Vec<String> {
    let mut files: Vec<String> = stdout
        .lines()
        .skip(1)
        .take_while(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .collect();
    files.dedup();
    files
}

/// Fold numstat counts into name-status entries and total them.
pub fn combine_diff(name_status: &str, numstat: &str, commit_count: u32) -> (Vec<FileChange>, DiffStats) {
    let mut files = parse_name_status(name_status);
    let counts = parse_numstat(numstat);
    for file in &mut files {
        if let Some((_, adds, dels)) = counts.iter().find(|(p, _, _)| *p == file.path) {
            file.additions = *adds;
            file.deletions = *dels;
        }
    }
    let stats = diff_stats(&files, commit_count);
    (files, stats)
}

pub fn diff_stats(files: &[FileChange], commit_count: u32) -> DiffStats {
    DiffStats {
        files_changed: files.len(),
        additions: files.iter().map(|f| f.additions).sum(),
        deletions: files.iter().map(|f| f.deletions).sum(),
        commit_count,
    }
}
