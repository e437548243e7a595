//! The monitor status file other processes read to see what the monitor is doing.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fleet_core::config::fleet_home;
use fleet_core::layout::ProjectLayout;
use fleet_core::records;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::monitor::PollReport;

pub const GLOBAL_STATUS_FILE: &str = "monitor-status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Starting,
    Monitoring,
    ShutdownPending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub enabled: bool,
    pub monitoring: bool,
    pub tasks_remaining: usize,
    pub shutdown_pending: bool,
    pub state: MonitorState,
    pub pid: u32,
    pub roots: Vec<PathBuf>,
    pub polls: u64,
    pub total_tasks: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_at: Option<DateTime<Utc>>,
}

impl MonitorStatus {
    pub fn starting(roots: Vec<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            enabled: true,
            monitoring: false,
            tasks_remaining: 0,
            shutdown_pending: false,
            state: MonitorState::Starting,
            pid: std::process::id(),
            roots,
            polls: 0,
            total_tasks: 0,
            started_at: now,
            updated_at: now,
            shutdown_at: None,
        }
    }

    pub fn record_poll(&mut self, report: &PollReport) {
        self.monitoring = true;
        self.polls = report.poll;
        self.tasks_remaining = report.active;
        self.total_tasks = report.total;
        self.shutdown_pending = report.shutdown;
        self.state = if report.shutdown {
            MonitorState::ShutdownPending
        } else {
            MonitorState::Monitoring
        };
        self.updated_at = report.timestamp;
    }
}

/// Where the status file lives: inside the project for a single root,
/// under the fleet home for a monitor spanning several.
pub fn default_status_path(roots: &[ProjectLayout]) -> PathBuf {
    match roots {
        [single] => single.monitor_status_path(),
        _ => fleet_home().join(GLOBAL_STATUS_FILE),
    }
}

/// Owns the status file for the life of the monitor and removes it on drop.
#[derive(Debug)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, status: &MonitorStatus) -> records::Result<()> {
        records::write_json_atomic(&self.path, status)
    }

    pub fn read(path: &Path) -> Option<MonitorStatus> {
        records::read_json_lenient(path)
    }
}

impl Drop for StatusFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "monitor status removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove monitor status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_root_status_lives_in_the_project() {
        let layout = ProjectLayout::new("/work/app");
        assert_eq!(
            default_status_path(std::slice::from_ref(&layout)),
            layout.monitor_status_path()
        );
        let many = [layout, ProjectLayout::new("/work/other")];
        assert_eq!(
            default_status_path(&many),
            fleet_home().join(GLOBAL_STATUS_FILE)
        );
    }

    #[test]
    fn status_file_is_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("status.json");
        {
            let mut file = StatusFile::new(&path);
            let status = MonitorStatus::starting(vec![tmp.path().to_path_buf()]);
            file.write(&status).unwrap();
            let read = StatusFile::read(&path).unwrap();
            assert!(read.enabled);
            assert_eq!(read.state, MonitorState::Starting);
        }
        assert!(!path.exists());
    }
}
