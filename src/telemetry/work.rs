//! Operation execution span helpers.

use tracing::Span;

use crate::model::{OperationId, Status};

/// Start a span covering one claimed operation.
///
/// The `operation.status` field is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_operation_span(id: OperationId, name: &str, worker_name: &str) -> Span {
    tracing::info_span!(
        "serial.execute",
        "operation.id" = id,
        "operation.name" = name,
        "worker.name" = worker_name,
        "operation.status" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("operation.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
