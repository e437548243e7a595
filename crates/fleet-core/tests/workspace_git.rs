//! Workspace engine against a throwaway repository and the real git binary.

use std::path::Path;
use std::process::Command;

use fleet_core::config::WorkspacesConfig;
use fleet_core::layout::ProjectLayout;
use fleet_core::spec_lock::SpecLockConfig;
use fleet_core::task_store::{NewTask, TaskStore};
use fleet_core::worktree::{DiscardOutcome, FileChangeKind, MergeOptions, MergeOutcome};
use fleet_core::worktree_manager::WorkspaceEngine;

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).to_string()
}

/// `merge-tree --write-tree` needs git 2.38 or newer.
fn git_is_recent() -> bool {
    let Ok(out) = Command::new("git").arg("--version").output() else {
        return false;
    };
    let text = String::from_utf8_lossy(&out.stdout);
    let version = text.split_whitespace().nth(2).unwrap_or("0.0");
    let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let (major, minor) = (parts.next().unwrap_or(0), parts.next().unwrap_or(0));
    (major, minor) >= (2, 38)
}

fn init_repo(root: &Path) {
    git(root, &["init", "-q", "-b", "main"]);
    git(root, &["config", "user.name", "Fleet Test"]);
    git(root, &["config", "user.email", "fleet@example.com"]);
    std::fs::write(root.join("README.md"), "hello\n").unwrap();
    git(root, &["add", "README.md"]);
    git(root, &["commit", "-q", "-m", "init"]);
}

#[test]
fn workspace_lifecycle_with_real_git() {
    if !git_is_recent() {
        eprintln!("skipping: git >= 2.38 not available");
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    init_repo(root);

    let layout = ProjectLayout::new(root);
    let store = TaskStore::new(layout.clone(), SpecLockConfig::default());
    let engine = WorkspaceEngine::new(layout.clone(), WorkspacesConfig::default());

    let task = store.create_task(NewTask::titled("Add feature")).unwrap();
    let state = engine.create(&task.spec_id).unwrap();
    assert!(state.exists);
    assert_eq!(state.base_branch, "main");
    assert!(layout
        .worktree_status_record_path(&task.spec_id)
        .exists());

    std::fs::write(state.path.join("feature.txt"), "one\ntwo\n").unwrap();
    git(&state.path, &["add", "feature.txt"]);
    git(&state.path, &["commit", "-q", "-m", "feature"]);

    let diff = engine.diff(&task.spec_id).unwrap();
    assert_eq!(diff.stats.commit_count, 1);
    assert_eq!(diff.stats.additions, 2);
    assert_eq!(diff.files.len(), 1);
    assert_eq!(diff.files[0].kind, FileChangeKind::Added);

    std::fs::write(root.join("scratch.txt"), "dirty\n").unwrap();
    let preview = engine.merge_preview(&task.spec_id).unwrap();
    assert!(preview.is_blocked());
    assert!(!preview.has_conflicts());
    assert!(matches!(
        engine.merge(&task.spec_id, MergeOptions::default()).unwrap(),
        MergeOutcome::Blocked { .. }
    ));
    std::fs::remove_file(root.join("scratch.txt")).unwrap();

    let outcome = engine.merge(&task.spec_id, MergeOptions::default()).unwrap();
    assert!(matches!(outcome, MergeOutcome::Merged { commit: Some(_) }));
    assert!(root.join("feature.txt").exists());
    assert!(!state.path.exists());
    assert_eq!(engine.discard(&task.spec_id).unwrap(), DiscardOutcome::AlreadyAbsent);
}

#[test]
fn conflicting_workspace_is_reported() {
    if !git_is_recent() {
        eprintln!("skipping: git >= 2.38 not available");
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    init_repo(root);

    let layout = ProjectLayout::new(root);
    let store = TaskStore::new(layout.clone(), SpecLockConfig::default());
    let engine = WorkspaceEngine::new(layout, WorkspacesConfig::default());
    let task = store.create_task(NewTask::titled("Edit readme")).unwrap();
    let state = engine.create(&task.spec_id).unwrap();

    std::fs::write(state.path.join("README.md"), "from workspace\n").unwrap();
    git(&state.path, &["commit", "-q", "-am", "workspace edit"]);
    std::fs::write(root.join("README.md"), "from main\n").unwrap();
    git(root, &["commit", "-q", "-am", "main edit"]);

    let preview = engine.merge_preview(&task.spec_id).unwrap();
    assert_eq!(preview.conflicts, vec!["README.md".to_string()]);
    assert_eq!(preview.commits_behind, 1);

    let outcome = engine.merge(&task.spec_id, MergeOptions::default()).unwrap();
    assert_eq!(
        outcome,
        MergeOutcome::Conflict {
            files: vec!["README.md".into()]
        }
    );
    assert_eq!(std::fs::read_to_string(root.join("README.md")).unwrap(), "from main\n");

    assert_eq!(engine.discard(&task.spec_id).unwrap(), DiscardOutcome::Removed);
    assert!(!state.path.exists());
}
