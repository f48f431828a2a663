//! Marker-level tracing spans.

#[cfg(feature = "tracing")]
use tracing::Span;

/// Create a span for one incremental marking step.
#[cfg(feature = "tracing")]
pub fn span_incremental_mark(phase: &str) -> Span {
    tracing::debug_span!("incremental_mark", phase = phase)
}

/// Log the completion of an incremental marking step.
#[cfg(feature = "tracing")]
pub fn log_incremental_step(marked_bytes: usize, complete: bool) {
    tracing::debug!(
        marked_bytes = marked_bytes,
        complete = complete,
        "incremental_step"
    );
}

/// Log the start of incremental marking.
#[cfg(feature = "tracing")]
pub fn log_incremental_start(marking_type: &str) {
    tracing::debug!(marking_type = marking_type, "incremental_start");
}

/// Log a marker phase transition.
#[cfg(feature = "tracing")]
pub fn log_phase_transition(phase: &str, marked_bytes: usize) {
    tracing::debug!(
        phase = phase,
        marked_bytes = marked_bytes,
        "phase_transition"
    );
}

/// Log the start of the concurrent marking workers.
#[cfg(feature = "tracing")]
pub fn log_concurrent_workers_started(workers: usize) {
    tracing::debug!(workers = workers, "concurrent_marking_start");
}

/// Log that the concurrent marking workers have been joined.
#[cfg(feature = "tracing")]
pub fn log_concurrent_workers_joined(marked_bytes: usize) {
    tracing::debug!(marked_bytes = marked_bytes, "concurrent_marking_end");
}
