use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::monitor::MonitorError;

// ---------------------------------------------------------------------------
// ShutdownAction
// ---------------------------------------------------------------------------

/// What the monitor does once every watched task is finished.
pub trait ShutdownAction: Send + Sync {
    fn schedule(&self, delay: Duration) -> Result<(), MonitorError>;
}

/// Schedules a real host shutdown through the platform `shutdown` command.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostShutdown;

impl HostShutdown {
    /// `shutdown` takes whole minutes on unix; round up so the delay is honoured.
    pub fn command_args(delay: Duration) -> (String, Vec<String>) {
        if cfg!(windows) {
            (
                "shutdown".to_string(),
                vec!["/s".into(), "/t".into(), delay.as_secs().to_string()],
            )
        } else {
            let minutes = delay.as_secs().div_ceil(60);
            (
                "shutdown".to_string(),
                vec!["-h".into(), format!("+{minutes}")],
            )
        }
    }
}

impl ShutdownAction for HostShutdown {
    fn schedule(&self, delay: Duration) -> Result<(), MonitorError> {
        let (program, args) = Self::command_args(delay);
        info!(%program, ?args, delay_secs = delay.as_secs(), "scheduling host shutdown");
        let output = Command::new(&program)
            .args(&args)
            .output()
            .map_err(|e| MonitorError::Shutdown(format!("could not run {program}: {e}")))?;
        if !output.status.success() {
            return Err(MonitorError::Shutdown(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Records the request instead of acting on it.
#[derive(Debug, Default, Clone)]
pub struct DryRunShutdown {
    scheduled: Arc<Mutex<Vec<Duration>>>,
}

impl DryRunShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<Duration> {
        self.scheduled.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ShutdownAction for DryRunShutdown {
    fn schedule(&self, delay: Duration) -> Result<(), MonitorError> {
        info!(delay_secs = delay.as_secs(), "dry run: host shutdown would be scheduled");
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delay);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative stop request for the monitor loop (ctrl-c, tests).
///
/// Loops `select!` on [`ShutdownSignal::subscribe`] alongside their tick.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("monitor stop requested");
            let _ = self.trigger.send(());
        } else {
            warn!("monitor stop already requested");
        }
    }

    /// Trigger on ctrl-c.
    pub fn install_ctrl_c(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("ctrl-c received");
            signal.trigger();
        });
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
