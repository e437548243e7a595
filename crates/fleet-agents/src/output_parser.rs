//! Line-by-line scan of worker output for phase transitions.
//!
//! Workers that know about fleet print structured markers:
//!
//! ```text
//! __EXEC_PHASE__:{"phase":"coding","message":"Implementing 1.2","progress":40,"subtask":"1.2"}
//! ```
//!
//! Anything else is matched against a short list of phrases workers are known
//! to print when they move between phases.

use fleet_core::types::ExecutionPhase;
use serde::Deserialize;

pub const PHASE_MARKER: &str = "__EXEC_PHASE__:";

/// A phase signal extracted from one line of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseUpdate {
    pub phase: ExecutionPhase,
    pub message: Option<String>,
    /// In-phase percentage reported by the worker, clamped to 0..=100.
    pub progress: Option<u8>,
    pub subtask: Option<String>,
}

impl PhaseUpdate {
    pub fn new(phase: ExecutionPhase) -> Self {
        Self {
            phase,
            message: None,
            progress: None,
            subtask: None,
        }
    }
}

#[derive(Deserialize)]
struct MarkerPayload {
    phase: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    subtask: Option<serde_json::Value>,
}

const HEURISTICS: &[(&str, ExecutionPhase)] = &[
    ("starting planning", ExecutionPhase::Planning),
    ("planning phase", ExecutionPhase::Planning),
    ("creating implementation plan", ExecutionPhase::Planning),
    ("starting coding", ExecutionPhase::Coding),
    ("coding phase", ExecutionPhase::Coding),
    ("implementing subtask", ExecutionPhase::Coding),
    ("working on subtask", ExecutionPhase::Coding),
    ("running qa", ExecutionPhase::QaReview),
    ("starting qa", ExecutionPhase::QaReview),
    ("qa review", ExecutionPhase::QaReview),
    ("qa fixing", ExecutionPhase::QaFixing),
    ("fixing qa issues", ExecutionPhase::QaFixing),
    ("applying qa fixes", ExecutionPhase::QaFixing),
    ("all subtasks completed", ExecutionPhase::Complete),
    ("build complete", ExecutionPhase::Complete),
    ("task complete", ExecutionPhase::Complete),
    ("build failed", ExecutionPhase::Failed),
    ("task failed", ExecutionPhase::Failed),
];

/// Parse one output line. Returns `None` for ordinary log output.
pub fn parse_line(line: &str) -> Option<PhaseUpdate> {
    let clean = strip_ansi(line);
    let clean = clean.trim();
    if clean.is_empty() {
        return None;
    }

    if let Some(idx) = clean.find(PHASE_MARKER) {
        return parse_marker(&clean[idx + PHASE_MARKER.len()..]);
    }

    let lower = clean.to_ascii_lowercase();
    HEURISTICS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, phase)| PhaseUpdate {
            message: Some(clean.to_string()),
            ..PhaseUpdate::new(*phase)
        })
}

fn parse_marker(payload: &str) -> Option<PhaseUpdate> {
    let parsed: MarkerPayload = match serde_json::from_str(payload.trim()) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring malformed phase marker");
            return None;
        }
    };
    let phase = ExecutionPhase::parse(&parsed.phase)?;
    let subtask = parsed.subtask.and_then(|v| match v {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    Some(PhaseUpdate {
        phase,
        message: parsed.message.filter(|m| !m.trim().is_empty()),
        progress: parsed
            .progress
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0).round() as u8),
        subtask,
    })
}

/// Remove CSI escape sequences (colors, cursor movement).
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            // Parameters and intermediates, then one final byte in @..~.
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
    }
    out
}
