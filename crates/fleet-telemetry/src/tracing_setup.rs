use std::fmt::Display;

use tracing::field;
use uuid::Uuid;

/// A fresh 32-hex trace id.
pub fn new_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Span for one operation (a worker spawn, a merge). Returns the span and
/// its trace id so callers can log the id outside the span too.
pub fn create_operation_span(operation: &str) -> (tracing::Span, String) {
    let trace_id = new_trace_id();
    let span = tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        operation = %operation,
        task = field::Empty,
    );
    (span, trace_id)
}

/// [`create_operation_span`] with the task it acts on recorded.
pub fn create_task_span(operation: &str, task: &dyn Display) -> (tracing::Span, String) {
    let (span, trace_id) = create_operation_span(operation);
    span.record("task", field::display(task));
    (span, trace_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_32_hex_and_unique() {
        let a = new_trace_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, new_trace_id());
    }

    #[test]
    fn task_span_carries_its_trace_id() {
        let (_span, trace_id) = create_task_span("workspace_merge", &"004-add-login");
        assert_eq!(trace_id.len(), 32);
    }
}
