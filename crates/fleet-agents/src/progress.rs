use fleet_core::types::{ExecutionPhase, ExecutionProgress};

use crate::output_parser::PhaseUpdate;

/// In-phase percentage a phase starts at.
pub const PHASE_START_PERCENT: u8 = 10;
/// In-phase percentage never exceeded while the worker is still running.
pub const IN_PHASE_CEILING: u8 = 90;
/// Increment applied when a phase repeats without an explicit percentage.
pub const IN_PHASE_STEP: u8 = 5;
/// Overall percentage never reached before the worker exits cleanly.
pub const RUNNING_OVERALL_CEILING: u8 = 99;

/// Folds phase updates into an [`ExecutionProgress`].
///
/// Overall progress is monotonic while the worker runs and only reaches 100
/// once [`ProgressTracker::finish`] sees exit code 0.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    progress: ExecutionProgress,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self) -> &ExecutionProgress {
        &self.progress
    }

    pub fn apply(&mut self, update: &PhaseUpdate) -> &ExecutionProgress {
        let p = &mut self.progress;
        if update.phase == ExecutionPhase::Failed {
            p.phase = ExecutionPhase::Failed;
        } else if update.phase != p.phase {
            p.phase = update.phase;
            p.phase_percent = update
                .progress
                .map_or(PHASE_START_PERCENT, |v| v.min(IN_PHASE_CEILING));
        } else {
            let next = match update.progress {
                Some(v) => v.max(p.phase_percent),
                None => p.phase_percent.saturating_add(IN_PHASE_STEP),
            };
            p.phase_percent = next.min(IN_PHASE_CEILING);
        }

        if update.subtask.is_some() {
            p.current_subtask = update.subtask.clone();
        }
        if update.message.is_some() {
            p.message = update.message.clone();
        }

        let overall = overall_percent(p.phase, p.phase_percent).min(RUNNING_OVERALL_CEILING);
        p.overall_percent = p.overall_percent.max(overall);
        &self.progress
    }

    /// Final progress once the worker has exited.
    pub fn finish(&mut self, exit_code: i32) -> &ExecutionProgress {
        let p = &mut self.progress;
        if exit_code == 0 {
            p.phase = ExecutionPhase::Complete;
            p.phase_percent = 100;
            p.overall_percent = 100;
        } else {
            p.phase = ExecutionPhase::Failed;
            p.message = Some(format!("worker exited with code {exit_code}"));
        }
        &self.progress
    }
}

/// Map an in-phase percentage onto the phase's overall band.
pub fn overall_percent(phase: ExecutionPhase, phase_percent: u8) -> u8 {
    let (start, end) = phase.overall_band();
    let span = u32::from(end.saturating_sub(start));
    let within = span * u32::from(phase_percent.min(100)) / 100;
    start.saturating_add(within as u8)
}
