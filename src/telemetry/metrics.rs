//! Metric instrument factories for omoide-serial.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"omoide-serial"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("omoide-serial")
}

/// Counter: operations enqueued.
/// Labels: `name`.
pub fn operations_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("omoide.serial.enqueued")
        .with_description("Number of serial operations enqueued")
        .build()
}

/// Counter: operation state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("omoide.serial.state_transitions")
        .with_description("Number of serial operation state transitions")
        .build()
}

/// Counter: serial lock events.
/// Labels: `result` ("acquired" | "busy" | "stolen" | "released" | "lost").
pub fn lock_events() -> Counter<u64> {
    meter()
        .u64_counter("omoide.serial.lock")
        .with_description("Serial lock acquisition attempts and releases")
        .build()
}

/// Histogram: variant execution time in milliseconds.
/// Labels: `name`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("omoide.serial.duration_ms")
        .with_description("Serial operation execution time in milliseconds")
        .with_unit("ms")
        .build()
}
