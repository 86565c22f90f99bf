//! Per-notification span helpers.
//!
//! One span wraps the whole handling of a notification; stage transitions
//! of the primary path are recorded as events inside it.

use tracing::Span;

use crate::model::Stage;

/// Start a span for handling one notification.
///
/// `job.id` and `audit.stage` are declared empty and filled in as the
/// router learns them.
pub fn start_notification_span(path: &str, message_id: &str) -> Span {
    tracing::info_span!(
        "audit.notification",
        "audit.path" = path,
        "messaging.message.id" = message_id,
        "job.id" = tracing::field::Empty,
        "audit.stage" = tracing::field::Empty,
    )
}

/// Record the job id once it has been extracted.
pub fn record_job(span: &Span, job_id: &str) {
    span.record("job.id", job_id);
}

/// Record a stage transition event on the given span.
pub fn record_stage_transition(span: &Span, from: Stage, to: Stage) {
    span.record("audit.stage", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "stage_transition");
    });
}
