//! Work execution span helpers.
//!
//! Provides span creation and outcome recording for executions launched by
//! the scheduler.

use tracing::Span;

use crate::model::work::{OutcomeKind, WorkId, WorkKind};

/// Start a span for one execution attempt.
///
/// The `work.outcome` field is declared empty and filled by
/// [`record_outcome`].
pub fn start_work_span(function: &str, kind: WorkKind, work_id: WorkId, attempt: u32) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.function" = function,
        "work.kind" = %kind,
        "work.id" = %work_id,
        "work.attempt" = attempt,
        "work.outcome" = tracing::field::Empty,
    )
}

/// Record the attempt's outcome on the span and emit a scoped event.
pub fn record_outcome(span: &Span, outcome: OutcomeKind, duration_ms: u64) {
    span.record("work.outcome", tracing::field::display(outcome));
    span.in_scope(|| {
        tracing::debug!(outcome = %outcome, duration_ms, "attempt finished");
    });
}
