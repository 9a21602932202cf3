//! Metric instrument factories for workpool.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workpool"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Bucket bounds for submission-to-outcome times: 10 ms up to one hour.
pub const DURATION_BUCKETS_MS: [f64; 12] = [
    10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 5_000.0, 15_000.0, 60_000.0, 300_000.0,
    900_000.0, 3_600_000.0,
];

/// Bucket bounds for launch lag. One segment is 100 ms, so most starts land
/// in the first few buckets.
pub const START_LAG_BUCKETS_MS: [f64; 10] = [
    0.0, 100.0, 200.0, 500.0, 1_000.0, 2_000.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0,
];

/// Returns the shared meter for workpool instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workpool")
}

/// Counter: work items submitted.
/// Labels: `function`, `kind`.
pub fn work_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("workpool.work.enqueued")
        .with_description("Number of work items submitted")
        .build()
}

/// Counter: executions launched.
/// Labels: `function`.
pub fn work_started() -> Counter<u64> {
    meter()
        .u64_counter("workpool.work.started")
        .with_description("Number of executions launched")
        .build()
}

/// Counter: work items that reached a terminal outcome.
/// Labels: `function`, `outcome` ("success" | "failed" | "canceled").
pub fn work_completed() -> Counter<u64> {
    meter()
        .u64_counter("workpool.work.completed")
        .with_description("Number of work items finished")
        .build()
}

/// Counter: failed attempts scheduled for another try.
/// Labels: `function`.
pub fn work_retried() -> Counter<u64> {
    meter()
        .u64_counter("workpool.work.retried")
        .with_description("Number of retries scheduled")
        .build()
}

/// Counter: executions presumed lost and reconciled by recovery.
pub fn work_recovered() -> Counter<u64> {
    meter()
        .u64_counter("workpool.work.recovered")
        .with_description("Number of lost executions reconciled")
        .build()
}

/// Counter: loop passes.
/// Labels: `result` ("ok" | "stale" | "error").
pub fn loop_passes() -> Counter<u64> {
    meter()
        .u64_counter("workpool.loop.passes")
        .with_description("Number of scheduler loop passes")
        .build()
}

/// Histogram: submission to terminal outcome, in milliseconds.
/// Labels: `function`, `outcome`.
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workpool.work.duration_ms")
        .with_description("Time from submission to terminal outcome")
        .with_unit("ms")
        .with_boundaries(DURATION_BUCKETS_MS.to_vec())
        .build()
}

/// Histogram: due time to launch, in milliseconds.
/// Labels: `function`.
pub fn start_lag_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workpool.work.start_lag_ms")
        .with_description("Time from becoming due to launch")
        .with_unit("ms")
        .with_boundaries(START_LAG_BUCKETS_MS.to_vec())
        .build()
}
