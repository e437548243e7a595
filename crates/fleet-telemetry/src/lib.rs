//! Observability helpers shared by the fleet binaries and libraries.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Tracing**: trace ids and operation spans used to
//!   correlate a worker spawn or a merge across log lines

pub mod logging;
pub mod tracing_setup;
