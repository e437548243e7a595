//! Worker process orchestration for fleet tasks.
//!
//! The orchestrator owns every live worker handle, turns worker output into
//! progress and rate-limit signals, and moves tasks through the state machine
//! when a worker exits. [`runner::TaskRunner`] wires it to the task store and
//! the workspace engine.

pub mod event_bus;
pub mod events;
pub mod orchestrator;
pub mod output_parser;
pub mod process;
pub mod progress;
pub mod rate_limit;
pub mod reconcile;
pub mod runner;
