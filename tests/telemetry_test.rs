//! Telemetry initialization and span helpers.

use omoide_serial::model::Status;
use omoide_serial::telemetry::{self, TelemetryConfig, metrics, work};
use opentelemetry::KeyValue;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Only one global subscriber per process; a second init may return Err.
    let config = TelemetryConfig {
        service_name: "omoide-serial-test".to_string(),
        ..TelemetryConfig::default()
    };
    if let Ok(guard) = telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn operation_span_records_transitions() {
    let span = work::start_operation_span(7, "rebuild_known_tags_for_anon", "worker-1");
    work::record_state_transition(&span, Status::Created, Status::Processing);
    work::record_state_transition(&span, Status::Processing, Status::Done);
}

#[test]
fn instruments_work_without_a_provider() {
    metrics::operations_enqueued().add(1, &[KeyValue::new("name", "noop")]);
    metrics::lock_events().add(1, &[KeyValue::new("result", "busy")]);
    metrics::operation_duration_ms().record(12.5, &[KeyValue::new("name", "noop")]);
}
