//! Cross-process spec numbering lock.
//!
//! One lock file per project root (`.fleet/specs/.spec-number.lock`).
//! Acquisition creates it with `O_CREAT | O_EXCL`, so concurrent callers in
//! any process have exactly one winner. The body records the holder's pid, a
//! random token and the acquisition time.
//!
//! ## Stale holders
//!
//! A holder is presumed crashed when its pid is gone or it has held the lock
//! longer than `stale_after`. The waiter renames the file aside, deletes it
//! only if the moved body is still the one it judged stale (otherwise the
//! file is linked back into place) and retries. A body that cannot be
//! parsed is judged by the file's mtime instead, which covers a holder that
//! died between create and write.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SpecLockSettings;
use crate::layout::{format_spec_id, list_dir_names, parse_spec_number, ProjectLayout};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SpecLockError {
    #[error("timed out after {waited:?} waiting for spec lock {path}")]
    Timeout { path: PathBuf, waited: Duration },
    #[error("spec lock io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpecLockError>;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SpecLockConfig {
    pub acquire_timeout: Duration,
    pub stale_after: Duration,
    pub retry_interval: Duration,
}

impl Default for SpecLockConfig {
    fn default() -> Self {
        Self::from(&SpecLockSettings::default())
    }
}

impl From<&SpecLockSettings> for SpecLockConfig {
    fn from(s: &SpecLockSettings) -> Self {
        Self {
            acquire_timeout: Duration::from_millis(s.acquire_timeout_ms),
            stale_after: Duration::from_millis(s.stale_after_ms),
            retry_interval: Duration::from_millis(s.retry_interval_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Lock file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecLockHolder {
    pub pid: u32,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

/// Outcome of a single acquisition attempt.
pub enum AcquireResult {
    Acquired(SpecLockGuard),
    /// A live holder owns the lock. `None` when its body was unreadable.
    Held(Option<SpecLockHolder>),
    /// A stale holder was removed; retry immediately.
    StaleRemoved,
}

#[derive(Debug, Clone)]
pub struct SpecLock {
    path: PathBuf,
    config: SpecLockConfig,
}

impl SpecLock {
    pub fn new(path: impl Into<PathBuf>, config: SpecLockConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_acquire(&self) -> Result<AcquireResult> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                let holder = SpecLockHolder {
                    pid: std::process::id(),
                    token: uuid::Uuid::new_v4().to_string(),
                    acquired_at: Utc::now(),
                };
                let json = serde_json::to_vec(&holder).map_err(std::io::Error::other)?;
                let written = file.write_all(&json).and_then(|_| file.sync_all());
                if let Err(e) = written {
                    let _ = std::fs::remove_file(&self.path);
                    return Err(e.into());
                }
                Ok(AcquireResult::Acquired(SpecLockGuard {
                    path: self.path.clone(),
                    token: holder.token,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_holder(&self.path);
                if !self.is_stale(holder.as_ref()) {
                    return Ok(AcquireResult::Held(holder));
                }
                self.reclaim(holder.as_ref())?;
                Ok(AcquireResult::StaleRemoved)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Retry until acquired or `acquire_timeout` elapses.
    pub fn acquire(&self) -> Result<SpecLockGuard> {
        let started = Instant::now();
        loop {
            match self.try_acquire()? {
                AcquireResult::Acquired(guard) => return Ok(guard),
                AcquireResult::StaleRemoved => continue,
                AcquireResult::Held(holder) => {
                    let waited = started.elapsed();
                    if waited >= self.config.acquire_timeout {
                        tracing::warn!(
                            path = %self.path.display(),
                            holder_pid = holder.as_ref().map(|h| h.pid),
                            "spec lock acquisition timed out"
                        );
                        return Err(SpecLockError::Timeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    std::thread::sleep(self.config.retry_interval);
                }
            }
        }
    }

    /// Move the lock file aside and delete it only if it is still the one
    /// judged stale. A lock re-taken since that judgement is put back.
    ///
    /// Returns whether the stale file was removed.
    fn reclaim(&self, judged: Option<&SpecLockHolder>) -> Result<bool> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let aside = self
            .path
            .with_extension(format!("stale-{}-{nanos}", std::process::id()));
        match std::fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let moved = read_holder(&aside);
        let unchanged = moved.as_ref() == judged && (moved.is_some() || self.is_stale_file(&aside));
        if unchanged {
            tracing::info!(
                path = %self.path.display(),
                pid = judged.map(|h| h.pid),
                "reclaiming stale spec lock"
            );
            remove_if_present(&aside)?;
            return Ok(true);
        }

        tracing::debug!(path = %self.path.display(), "spec lock changed hands, restoring it");
        // hard_link fails if a third caller created the lock in the meantime.
        match std::fs::hard_link(&aside, &self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::warn!(path = %self.path.display(), "spec lock re-created while restoring a live holder");
            }
            Err(e) => {
                let _ = std::fs::rename(&aside, &self.path);
                return Err(e.into());
            }
        }
        remove_if_present(&aside)?;
        Ok(false)
    }

    fn is_stale_file(&self, path: &Path) -> bool {
        file_age(path).is_some_and(|age| age > self.config.stale_after)
    }

    fn is_stale(&self, holder: Option<&SpecLockHolder>) -> bool {
        match holder {
            Some(h) => {
                if !pid_alive(h.pid) {
                    return true;
                }
                let age = Utc::now().signed_duration_since(h.acquired_at);
                age.to_std().map(|a| a > self.config.stale_after).unwrap_or(false)
            }
            None => self.is_stale_file(&self.path),
        }
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn read_holder(path: &Path) -> Option<SpecLockHolder> {
    let content = std::fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Releases the lock on drop, unless another holder has reclaimed it.
#[derive(Debug)]
pub struct SpecLockGuard {
    path: PathBuf,
    token: String,
}

impl Drop for SpecLockGuard {
    fn drop(&mut self) {
        match read_holder(&self.path) {
            Some(holder) if holder.token == self.token => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to release spec lock");
                }
            }
            _ => {
                tracing::warn!(path = %self.path.display(), "spec lock was reclaimed before release");
            }
        }
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Unknown on this platform; age alone decides staleness.
    true
}

// ---------------------------------------------------------------------------
// SpecNumberCoordinator
// ---------------------------------------------------------------------------

/// Hands out spec numbers under the project's spec lock.
#[derive(Debug, Clone)]
pub struct SpecNumberCoordinator {
    layout: ProjectLayout,
    lock: SpecLock,
}

impl SpecNumberCoordinator {
    pub fn new(layout: ProjectLayout, config: SpecLockConfig) -> Self {
        let lock = SpecLock::new(layout.lock_path(), config);
        Self { layout, lock }
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// Run `f` while holding the lock.
    ///
    /// `f` must stay short: the numbering scan and fast state checks only.
    pub fn with_lock<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&SpecNumbering<'_>) -> std::result::Result<T, E>,
        E: From<SpecLockError>,
    {
        let _guard = self.lock.acquire()?;
        let numbering = SpecNumbering {
            layout: &self.layout,
        };
        f(&numbering)
    }

    /// Convenience: allocate a number and create its spec directory.
    pub fn allocate(&self, slug: &str) -> Result<(u32, String)> {
        self.with_lock(|n| n.create_spec_dir(slug))
    }
}

/// Capability handed to [`SpecNumberCoordinator::with_lock`] callbacks.
pub struct SpecNumbering<'a> {
    layout: &'a ProjectLayout,
}

impl SpecNumbering<'_> {
    pub fn layout(&self) -> &ProjectLayout {
        self.layout
    }

    pub fn next_spec_number(&self) -> Result<u32> {
        Ok(highest_spec_number(self.layout)? + 1)
    }

    /// Claim the next number by creating `<NNN>-<slug>` in the main specs dir.
    pub fn create_spec_dir(&self, slug: &str) -> Result<(u32, String)> {
        let number = self.next_spec_number()?;
        let spec_id = format_spec_id(number, slug);
        std::fs::create_dir_all(self.layout.specs_dir())?;
        std::fs::create_dir(self.layout.spec_dir(&spec_id))?;
        tracing::debug!(spec_id = %spec_id, number, "allocated spec number");
        Ok((number, spec_id))
    }
}

/// Highest numeric prefix across the main specs dir and every worktree copy.
pub fn highest_spec_number(layout: &ProjectLayout) -> std::io::Result<u32> {
    let mut highest = max_number(&list_dir_names(&layout.specs_dir())?);
    for worktree in layout.worktree_names()? {
        let names = list_dir_names(&layout.worktree_specs_dir(&worktree))?;
        highest = highest.max(max_number(&names));
    }
    Ok(highest)
}

fn max_number(names: &[String]) -> u32 {
    names
        .iter()
        .filter_map(|n| parse_spec_number(n))
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SpecLockConfig {
        SpecLockConfig {
            acquire_timeout: Duration::from_millis(300),
            stale_after: Duration::from_secs(60),
            retry_interval: Duration::from_millis(5),
        }
    }

    fn write_holder(path: &Path, holder: &SpecLockHolder) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec(holder).unwrap()).unwrap();
    }

    #[test]
    fn current_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_dead() {
        assert!(!pid_alive(4_000_000));
    }

    #[test]
    fn acquire_and_release() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = SpecLock::new(tmp.path().join("specs/.lock"), fast_config());
        let guard = lock.acquire().unwrap();
        assert!(lock.path().exists());
        assert!(matches!(lock.try_acquire().unwrap(), AcquireResult::Held(Some(_))));
        drop(guard);
        assert!(!lock.path().exists());
    }

    #[test]
    fn live_holder_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".lock");
        write_holder(
            &path,
            &SpecLockHolder {
                pid: std::process::id(),
                token: "other".into(),
                acquired_at: Utc::now(),
            },
        );
        let lock = SpecLock::new(&path, fast_config());
        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, SpecLockError::Timeout { .. }));
        assert!(path.exists());
    }

    #[test]
    fn dead_holder_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".lock");
        write_holder(
            &path,
            &SpecLockHolder {
                pid: 4_000_000,
                token: "crashed".into(),
                acquired_at: Utc::now(),
            },
        );
        let lock = SpecLock::new(&path, fast_config());
        let _guard = lock.acquire().unwrap();
        assert_ne!(read_holder(&path).unwrap().token, "crashed");
    }

    #[test]
    fn holder_past_staleness_window_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".lock");
        write_holder(
            &path,
            &SpecLockHolder {
                pid: std::process::id(),
                token: "ancient".into(),
                acquired_at: Utc::now() - chrono::Duration::minutes(10),
            },
        );
        let lock = SpecLock::new(&path, fast_config());
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn reclaim_restores_a_lock_retaken_since_judged_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".lock");
        let judged = SpecLockHolder {
            pid: 4_000_000,
            token: "crashed".into(),
            acquired_at: Utc::now(),
        };
        // Another waiter already reclaimed and re-took the lock.
        let fresh = SpecLockHolder {
            pid: std::process::id(),
            token: "fresh".into(),
            acquired_at: Utc::now(),
        };
        write_holder(&path, &fresh);

        let lock = SpecLock::new(&path, fast_config());
        assert!(!lock.reclaim(Some(&judged)).unwrap());
        assert_eq!(read_holder(&path), Some(fresh));
        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![".lock".to_string()]);
    }

    #[test]
    fn reclaim_removes_the_judged_holder_and_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".lock");
        let judged = SpecLockHolder {
            pid: 4_000_000,
            token: "crashed".into(),
            acquired_at: Utc::now(),
        };
        write_holder(&path, &judged);

        let lock = SpecLock::new(&path, fast_config());
        assert!(lock.reclaim(Some(&judged)).unwrap());
        assert!(!path.exists());
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
        assert!(!lock.reclaim(Some(&judged)).unwrap());
    }

    #[test]
    fn guard_does_not_remove_reclaimed_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".lock");
        let lock = SpecLock::new(&path, fast_config());
        let guard = lock.acquire().unwrap();
        write_holder(
            &path,
            &SpecLockHolder {
                pid: std::process::id(),
                token: "new-owner".into(),
                acquired_at: Utc::now(),
            },
        );
        drop(guard);
        assert_eq!(read_holder(&path).unwrap().token, "new-owner");
    }

    #[test]
    fn next_number_scans_worktree_copies() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = ProjectLayout::new(tmp.path());
        std::fs::create_dir_all(layout.spec_dir("001-a")).unwrap();
        std::fs::create_dir_all(layout.spec_dir("003-b")).unwrap();
        std::fs::create_dir_all(layout.worktree_specs_dir("003-b").join("007-newer")).unwrap();

        let coord = SpecNumberCoordinator::new(layout.clone(), fast_config());
        let next = coord
            .with_lock(|n| n.next_spec_number())
            .unwrap();
        assert_eq!(next, 8);

        let (number, spec_id) = coord.allocate("next-task").unwrap();
        assert_eq!(number, 8);
        assert_eq!(spec_id, "008-next-task");
        assert!(layout.spec_dir("008-next-task").is_dir());
    }

    #[test]
    fn empty_project_starts_at_one() {
        let tmp = tempfile::tempdir().unwrap();
        let coord = SpecNumberCoordinator::new(ProjectLayout::new(tmp.path()), fast_config());
        assert_eq!(coord.allocate("first").unwrap(), (1, "001-first".to_string()));
    }
}
