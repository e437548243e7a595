//! On-disk layout of a project root.
//!
//! ```text
//! <root>/.fleet/specs/<NNN>-<slug>/implementation_plan.json
//! <root>/.fleet/specs/<NNN>-<slug>/task_metadata.json
//! <root>/.fleet/specs/<NNN>-<slug>/worker.json           (while a worker runs)
//! <root>/.fleet/specs/.spec-number.lock
//! <root>/.fleet/worktrees/tasks/<spec-id>/            (git worktree)
//! <root>/.fleet/worktrees/tasks/<spec-id>/.fleet/specs/<spec-id>/
//! <root>/.fleet/monitor-status.json
//! ```

use std::path::{Path, PathBuf};

pub const STATUS_RECORD_FILE: &str = "implementation_plan.json";
pub const METADATA_FILE: &str = "task_metadata.json";
pub const WORKER_CLAIM_FILE: &str = "worker.json";
pub const SPEC_LOCK_FILE: &str = ".spec-number.lock";
pub const MONITOR_STATUS_FILE: &str = "monitor-status.json";
pub const DEFAULT_DATA_DIR: &str = ".fleet";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
    data_dir: String,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_data_dir(root, DEFAULT_DATA_DIR)
    }

    pub fn with_data_dir(root: impl Into<PathBuf>, data_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir_name(&self) -> &str {
        &self.data_dir
    }

    /// Directory name of the root, used as the project id.
    pub fn project_id(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.display().to_string())
    }

    pub fn data_root(&self) -> PathBuf {
        self.root.join(&self.data_dir)
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.data_root().join("specs")
    }

    pub fn spec_dir(&self, spec_id: &str) -> PathBuf {
        self.specs_dir().join(spec_id)
    }

    pub fn status_record_path(&self, spec_id: &str) -> PathBuf {
        self.spec_dir(spec_id).join(STATUS_RECORD_FILE)
    }

    pub fn metadata_path(&self, spec_id: &str) -> PathBuf {
        self.spec_dir(spec_id).join(METADATA_FILE)
    }

    pub fn worker_claim_path(&self, spec_id: &str) -> PathBuf {
        self.spec_dir(spec_id).join(WORKER_CLAIM_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.specs_dir().join(SPEC_LOCK_FILE)
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.data_root().join("worktrees").join("tasks")
    }

    pub fn worktree_path(&self, spec_id: &str) -> PathBuf {
        self.worktrees_dir().join(spec_id)
    }

    /// Spec directory inside a worktree named `worktree_name`.
    pub fn worktree_specs_dir(&self, worktree_name: &str) -> PathBuf {
        self.worktree_path(worktree_name)
            .join(&self.data_dir)
            .join("specs")
    }

    pub fn worktree_spec_dir(&self, spec_id: &str) -> PathBuf {
        self.worktree_specs_dir(spec_id).join(spec_id)
    }

    pub fn worktree_status_record_path(&self, spec_id: &str) -> PathBuf {
        self.worktree_spec_dir(spec_id).join(STATUS_RECORD_FILE)
    }

    pub fn monitor_status_path(&self) -> PathBuf {
        self.data_root().join(MONITOR_STATUS_FILE)
    }

    /// Names of the directories directly under `worktrees/tasks`.
    pub fn worktree_names(&self) -> std::io::Result<Vec<String>> {
        list_dir_names(&self.worktrees_dir())
    }

    /// Names of the spec directories in the main specs dir.
    pub fn spec_ids(&self) -> std::io::Result<Vec<String>> {
        Ok(list_dir_names(&self.specs_dir())?
            .into_iter()
            .filter(|name| parse_spec_number(name).is_some())
            .collect())
    }
}

/// Sorted directory names under `dir`; a missing dir yields an empty list.
pub fn list_dir_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Numeric prefix of a spec directory name (`004-add-login` -> 4).
pub fn parse_spec_number(name: &str) -> Option<u32> {
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let rest = &name[digits.len()..];
    if !(rest.is_empty() || rest.starts_with('-')) {
        return None;
    }
    digits.parse().ok()
}

pub fn format_spec_id(number: u32, slug: &str) -> String {
    if slug.is_empty() {
        format!("{number:03}")
    } else {
        format!("{number:03}-{slug}")
    }
}

/// Lowercase, dash-separated slug of at most 50 characters.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let mut slug: String = slug.trim_end_matches('-').chars().take(50).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_layout() {
        let layout = ProjectLayout::new("/work/app");
        assert_eq!(layout.project_id(), "app");
        assert_eq!(
            layout.status_record_path("002-x"),
            PathBuf::from("/work/app/.fleet/specs/002-x/implementation_plan.json")
        );
        assert_eq!(
            layout.lock_path(),
            PathBuf::from("/work/app/.fleet/specs/.spec-number.lock")
        );
        assert_eq!(
            layout.worktree_status_record_path("002-x"),
            PathBuf::from(
                "/work/app/.fleet/worktrees/tasks/002-x/.fleet/specs/002-x/implementation_plan.json"
            )
        );
    }

    #[test]
    fn spec_number_parsing() {
        assert_eq!(parse_spec_number("004-add-login"), Some(4));
        assert_eq!(parse_spec_number("120"), Some(120));
        assert_eq!(parse_spec_number("12abc"), None);
        assert_eq!(parse_spec_number(".spec-number.lock"), None);
        assert_eq!(parse_spec_number("notes"), None);
    }

    #[test]
    fn spec_id_formatting() {
        assert_eq!(format_spec_id(7, "fix-bug"), "007-fix-bug");
        assert_eq!(format_spec_id(1234, "x"), "1234-x");
        assert_eq!(format_spec_id(3, ""), "003");
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Add OAuth login!!"), "add-oauth-login");
        assert_eq!(slugify("  --weird__name-- "), "weird-name");
        assert_eq!(slugify(&"a".repeat(80)).len(), 50);
    }

    #[test]
    fn missing_dirs_list_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(tmp.path());
        assert!(layout.spec_ids().unwrap().is_empty());
        assert!(layout.worktree_names().unwrap().is_empty());
    }
}
