//! Completion monitor: a standalone polling loop that watches one or more
//! project roots and shuts the host down once no task is left active.
//!
//! It shares nothing with the orchestrator but the status files on disk.

pub mod monitor;
pub mod shutdown;
pub mod status;

pub use monitor::{CompletionMonitor, MonitorError, MonitorSettings, RunOutcome};
