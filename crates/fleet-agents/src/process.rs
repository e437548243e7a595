//! Worker process spawning.
//!
//! [`WorkerSpawner`] is the seam the orchestrator talks to; tests substitute a
//! scripted implementation, production uses [`ProcessSpawner`].

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    #[error("worker executable not found: {0}")]
    NotFound(String),
    #[error("permission denied running worker: {0}")]
    PermissionDenied(String),
    #[error("working directory does not exist: {0}")]
    MissingWorkDir(PathBuf),
    #[error("failed to start worker {program}: {message}")]
    Other { program: String, message: String },
}

// ---------------------------------------------------------------------------
// Request / handle types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Signals a running worker.
pub trait WorkerControl: Send + Sync {
    /// Ask the worker to stop (SIGTERM on unix).
    fn terminate(&self);
    /// Stop the worker unconditionally (SIGKILL on unix).
    fn force_kill(&self);
    fn has_exited(&self) -> bool;
}

/// A started worker: its combined output, its exit code, and a way to stop it.
///
/// `output` disconnects once both stdout and stderr are closed; `exit`
/// yields exactly one exit code.
pub struct SpawnedWorker {
    pub pid: Option<u32>,
    pub output: flume::Receiver<String>,
    pub exit: flume::Receiver<i32>,
    pub control: Arc<dyn WorkerControl>,
}

/// Abstraction over process spawning so the orchestrator can be tested
/// without real processes.
#[async_trait::async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedWorker, SpawnError>;
}

// ---------------------------------------------------------------------------
// ProcessSpawner
// ---------------------------------------------------------------------------

/// Spawns workers as child processes with piped stdout/stderr.
///
/// On unix each worker leads its own process group so that terminate and
/// kill reach the tools it started.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

#[async_trait::async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
        if !request.work_dir.is_dir() {
            return Err(SpawnError::MissingWorkDir(request.work_dir.clone()));
        }

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .current_dir(&request.work_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| classify_spawn_error(&request.program, e))?;
        let pid = child.id();
        debug!(program = %request.program, pid = ?pid, "worker process started");

        let (line_tx, line_rx) = flume::unbounded();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx));
        }

        let exited = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = flume::bounded::<()>(1);
        let (exit_tx, exit_rx) = flume::bounded(1);
        let exited_flag = exited.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx.recv_async() => {
                    if let Err(e) = child.start_kill() {
                        warn!(error = %e, "failed to kill worker");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!(error = %e, "failed to wait for worker");
                    -1
                }
            };
            exited_flag.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedWorker {
            pid,
            output: line_rx,
            exit: exit_rx,
            control: Arc::new(ProcessControl { pid, exited, kill_tx }),
        })
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: flume::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    // The pipe is drained to EOF even after the receiver goes away, so the
    // worker never blocks on a full pipe or dies of SIGPIPE.
    let mut forwarding = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if !forwarding {
                    continue;
                }
                let line = String::from_utf8_lossy(trim_line_end(&buf)).into_owned();
                if tx.send_async(line).await.is_err() {
                    forwarding = false;
                }
            }
            Err(e) => {
                debug!(error = %e, "worker output stream closed");
                break;
            }
        }
    }
}

fn trim_line_end(mut bytes: &[u8]) -> &[u8] {
    if let [rest @ .., b'\n'] = bytes {
        bytes = rest;
    }
    if let [rest @ .., b'\r'] = bytes {
        bytes = rest;
    }
    bytes
}

fn classify_spawn_error(program: &str, err: std::io::Error) -> SpawnError {
    match err.kind() {
        ErrorKind::NotFound => SpawnError::NotFound(program.to_string()),
        ErrorKind::PermissionDenied => SpawnError::PermissionDenied(program.to_string()),
        _ => SpawnError::Other {
            program: program.to_string(),
            message: err.to_string(),
        },
    }
}

/// Exit code, or `128 + signal` for a worker killed by a signal.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

struct ProcessControl {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    kill_tx: flume::Sender<()>,
}

impl ProcessControl {
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> bool {
        let Some(pid) = self.pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
            return false;
        };
        // SAFETY: kill(2) with a negative pid signals the process group the
        // worker leads; it has no memory-safety preconditions.
        let rc = unsafe { libc::kill(-pid, signal) };
        rc == 0
    }

    #[cfg(unix)]
    fn group_terminate(&self) -> bool {
        self.signal_group(libc::SIGTERM)
    }

    #[cfg(not(unix))]
    fn group_terminate(&self) -> bool {
        false
    }

    #[cfg(unix)]
    fn group_kill(&self) {
        self.signal_group(libc::SIGKILL);
    }

    #[cfg(not(unix))]
    fn group_kill(&self) {}
}

impl WorkerControl for ProcessControl {
    fn terminate(&self) {
        if self.has_exited() {
            return;
        }
        if !self.group_terminate() {
            let _ = self.kill_tx.try_send(());
        }
    }

    fn force_kill(&self) {
        if self.has_exited() {
            return;
        }
        self.group_kill();
        let _ = self.kill_tx.try_send(());
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(dir: &std::path::Path, script: &str) -> SpawnRequest {
        SpawnRequest {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            work_dir: dir.to_path_buf(),
            env: BTreeMap::from([("FLEET_TEST_VALUE".to_string(), "hello".to_string())]),
        }
    }

    #[tokio::test]
    async fn streams_output_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = ProcessSpawner
            .spawn(&request(tmp.path(), "echo \"$FLEET_TEST_VALUE\"; echo oops >&2; exit 3"))
            .await
            .unwrap();
        let mut lines = Vec::new();
        while let Ok(line) = worker.output.recv_async().await {
            lines.push(line);
        }
        lines.sort();
        assert_eq!(lines, vec!["hello".to_string(), "oops".to_string()]);
        assert_eq!(worker.exit.recv_async().await.unwrap(), 3);
        assert!(worker.control.has_exited());
    }

    #[tokio::test]
    async fn invalid_utf8_output_does_not_stop_the_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let script = "printf 'start\\n\\377\\r\\n'; for i in $(seq 1 200); do echo line-$i; done; exit 0";
        let worker = ProcessSpawner.spawn(&request(tmp.path(), script)).await.unwrap();
        let mut lines = Vec::new();
        while let Ok(line) = worker.output.recv_async().await {
            lines.push(line);
        }
        assert_eq!(lines.len(), 202);
        assert_eq!(lines[0], "start");
        assert_eq!(lines[1], "\u{FFFD}");
        assert_eq!(lines.last().map(String::as_str), Some("line-200"));
        assert_eq!(worker.exit.recv_async().await.unwrap(), 0);
    }

    #[test]
    fn trims_crlf_and_lf_only() {
        assert_eq!(trim_line_end(b"a\r\n"), b"a");
        assert_eq!(trim_line_end(b"a\n"), b"a");
        assert_eq!(trim_line_end(b"a"), b"a");
        assert_eq!(trim_line_end(b"a\r\r\n"), b"a\r");
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let mut req = request(tmp.path(), "true");
        req.program = "fleet-no-such-worker-binary".into();
        let err = ProcessSpawner.spawn(&req).await.err().unwrap();
        assert_eq!(err, SpawnError::NotFound("fleet-no-such-worker-binary".into()));
    }

    #[tokio::test]
    async fn missing_work_dir_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let req = request(&tmp.path().join("gone"), "true");
        assert!(matches!(
            ProcessSpawner.spawn(&req).await,
            Err(SpawnError::MissingWorkDir(_))
        ));
    }

    #[tokio::test]
    async fn terminate_stops_a_sleeping_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let worker = ProcessSpawner.spawn(&request(tmp.path(), "sleep 30")).await.unwrap();
        worker.control.terminate();
        let code = tokio::time::timeout(Duration::from_secs(10), worker.exit.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 128 + libc::SIGTERM);
    }
}
