//! The completion polling loop.
//!
//! Each poll is a pure function of what is on disk, apart from one flag:
//! whether an active task has ever been observed. A project that has never
//! had any task does not trigger a shutdown.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::config::MonitorConfig;
use fleet_core::layout::ProjectLayout;
use fleet_core::records::{self, MetadataRecord, RecordSource};
use fleet_core::types::TaskStatus;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::shutdown::{ShutdownAction, ShutdownSignal};
use crate::status::{MonitorStatus, StatusFile};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("failed to scan {root}: {source}")]
    Scan {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("status file error: {0}")]
    Status(#[from] fleet_core::records::RecordError),
    #[error("shutdown failed: {0}")]
    Shutdown(String),
    #[error("no project roots to watch")]
    NoRoots,
}

pub type Result<T> = std::result::Result<T, MonitorError>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub shutdown_delay: Duration,
    pub complete_by_progress: bool,
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
            shutdown_delay: Duration::from_secs(cfg.shutdown_delay_secs),
            complete_by_progress: cfg.complete_by_progress,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    /// `done` or `pr_created`.
    Terminal,
    /// Every subtask completed but the status never moved.
    CompleteByProgress,
    Active,
}

pub fn classify(status: TaskStatus, percent: u8, complete_by_progress: bool) -> TaskClass {
    if status.is_terminal() {
        TaskClass::Terminal
    } else if complete_by_progress && status != TaskStatus::Backlog && percent >= 100 {
        TaskClass::CompleteByProgress
    } else {
        TaskClass::Active
    }
}

/// One task as seen by a single poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskObservation {
    pub root: PathBuf,
    pub spec_id: String,
    pub status: TaskStatus,
    pub percent: u8,
    /// `None` when neither copy of the status record exists.
    pub source: Option<RecordSource>,
    pub class: TaskClass,
}

/// Read every non-archived task under `layout` without writing anything.
pub fn scan_project(layout: &ProjectLayout, complete_by_progress: bool) -> Result<Vec<TaskObservation>> {
    let spec_ids = layout.spec_ids().map_err(|source| MonitorError::Scan {
        root: layout.root().to_path_buf(),
        source,
    })?;

    let mut observed = Vec::with_capacity(spec_ids.len());
    for spec_id in spec_ids {
        let metadata: Option<MetadataRecord> =
            records::read_json_lenient(&layout.metadata_path(&spec_id));
        if metadata.is_some_and(|m| m.metadata.archived_at.is_some()) {
            continue;
        }

        let reconciled = records::load_reconciled(
            &layout.status_record_path(&spec_id),
            &layout.worktree_status_record_path(&spec_id),
        );
        let (status, percent, source) = match reconciled {
            Some(r) => (r.record.status, r.record.completion_percent(), Some(r.source)),
            None => (TaskStatus::Backlog, 0, None),
        };
        observed.push(TaskObservation {
            root: layout.root().to_path_buf(),
            class: classify(status, percent, complete_by_progress),
            spec_id,
            status,
            percent,
            source,
        });
    }
    Ok(observed)
}

// ---------------------------------------------------------------------------
// Poll report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    pub poll: u64,
    pub tasks: Vec<TaskObservation>,
    pub total: usize,
    pub active: usize,
    pub terminal: usize,
    pub complete_by_progress: usize,
    /// Whether this poll decided to shut the host down.
    pub shutdown: bool,
    pub timestamp: DateTime<Utc>,
}

impl PollReport {
    pub fn active_tasks(&self) -> impl Iterator<Item = &TaskObservation> {
        self.tasks.iter().filter(|t| t.class == TaskClass::Active)
    }
}

/// How [`CompletionMonitor::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A host shutdown was scheduled.
    Shutdown,
    /// Stopped through the [`ShutdownSignal`] before work finished.
    Interrupted,
}

// ---------------------------------------------------------------------------
// CompletionMonitor
// ---------------------------------------------------------------------------

pub struct CompletionMonitor {
    roots: Vec<ProjectLayout>,
    settings: MonitorSettings,
    seen_active: bool,
    polls: u64,
}

impl CompletionMonitor {
    pub fn new(roots: Vec<ProjectLayout>, settings: MonitorSettings) -> Result<Self> {
        if roots.is_empty() {
            return Err(MonitorError::NoRoots);
        }
        Ok(Self {
            roots,
            settings,
            seen_active: false,
            polls: 0,
        })
    }

    pub fn roots(&self) -> &[ProjectLayout] {
        &self.roots
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn seen_active(&self) -> bool {
        self.seen_active
    }

    /// Scan every root once and decide whether work is finished.
    ///
    /// A root that cannot be read fails the whole poll so a transient IO
    /// error never looks like an empty project.
    pub fn poll_once(&mut self) -> Result<PollReport> {
        self.polls += 1;
        let mut tasks = Vec::new();
        for layout in &self.roots {
            tasks.extend(scan_project(layout, self.settings.complete_by_progress)?);
        }

        let count = |class| tasks.iter().filter(|t| t.class == class).count();
        let active = count(TaskClass::Active);
        let terminal = count(TaskClass::Terminal);
        let complete_by_progress = count(TaskClass::CompleteByProgress);
        let total = tasks.len();

        let shutdown = active == 0 && (self.seen_active || total > 0);
        if active > 0 {
            self.seen_active = true;
        }

        debug!(
            poll = self.polls,
            total, active, terminal, complete_by_progress, shutdown, "monitor poll"
        );
        Ok(PollReport {
            poll: self.polls,
            tasks,
            total,
            active,
            terminal,
            complete_by_progress,
            shutdown,
            timestamp: Utc::now(),
        })
    }

    /// Poll on an interval until work is finished or `signal` fires.
    ///
    /// On completion the host shutdown is scheduled through `action`. When
    /// `status` is set the file is rewritten after every poll.
    pub async fn run(
        &mut self,
        action: &dyn ShutdownAction,
        signal: &ShutdownSignal,
        mut status: Option<&mut StatusFile>,
    ) -> Result<RunOutcome> {
        let mut stop_rx = signal.subscribe();
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let roots: Vec<PathBuf> = self.roots.iter().map(|l| l.root().to_path_buf()).collect();
        let mut snapshot = MonitorStatus::starting(roots);

        info!(
            roots = self.roots.len(),
            interval_secs = self.settings.poll_interval.as_secs(),
            delay_secs = self.settings.shutdown_delay.as_secs(),
            "completion monitor started"
        );

        loop {
            if signal.is_triggered() {
                return Ok(RunOutcome::Interrupted);
            }
            tokio::select! {
                _ = interval.tick() => {
                    let report = match self.poll_once() {
                        Ok(report) => report,
                        Err(e) => {
                            warn!(error = %e, "monitor poll failed, retrying next tick");
                            continue;
                        }
                    };
                    snapshot.record_poll(&report);
                    if report.shutdown {
                        snapshot.shutdown_at = Some(
                            report.timestamp
                                + chrono::Duration::from_std(self.settings.shutdown_delay)
                                    .unwrap_or_else(|_| chrono::Duration::zero()),
                        );
                    }
                    if let Some(file) = status.as_deref_mut() {
                        if let Err(e) = file.write(&snapshot) {
                            warn!(error = %e, "failed to write monitor status");
                        }
                    }
                    if report.shutdown {
                        info!(
                            terminal = report.terminal,
                            complete_by_progress = report.complete_by_progress,
                            "no active tasks remain, scheduling shutdown"
                        );
                        action.schedule(self.settings.shutdown_delay)?;
                        return Ok(RunOutcome::Shutdown);
                    }
                    for task in report.active_tasks() {
                        debug!(spec_id = %task.spec_id, status = %task.status, percent = task.percent, "still active");
                    }
                }
                _ = stop_rx.recv() => {
                    info!("completion monitor stopping");
                    return Ok(RunOutcome::Interrupted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(classify(TaskStatus::Done, 10, true), TaskClass::Terminal);
        assert_eq!(classify(TaskStatus::PrCreated, 0, true), TaskClass::Terminal);
        assert_eq!(classify(TaskStatus::InProgress, 100, true), TaskClass::CompleteByProgress);
        assert_eq!(classify(TaskStatus::Error, 100, true), TaskClass::CompleteByProgress);
        assert_eq!(classify(TaskStatus::InProgress, 100, false), TaskClass::Active);
        assert_eq!(classify(TaskStatus::HumanReview, 80, true), TaskClass::Active);
        // Backlog at 100% means a plan was written but nothing ran.
        assert_eq!(classify(TaskStatus::Backlog, 100, true), TaskClass::Active);
    }

    #[test]
    fn settings_from_config() {
        let settings = MonitorSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(5));
        assert_eq!(settings.shutdown_delay, Duration::from_secs(120));
        assert!(settings.complete_by_progress);
    }

    #[test]
    fn no_roots_is_an_error() {
        assert!(matches!(
            CompletionMonitor::new(Vec::new(), MonitorSettings::default()),
            Err(MonitorError::NoRoots)
        ));
    }
}
