//! OpenTelemetry instruments for winnode
//!
//! Instruments are created lazily against the global meter. Without an OTLP
//! endpoint the global meter is a no-op and recording costs nothing.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("winnode"));

/// Counter of reconcile passes by outcome
///
/// Labels:
/// - `outcome`: configured, up_to_date, upgrade_blocked, failed
/// - `error_kind`: present when `outcome` is failed
pub static RECONCILE_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("winnode_reconcile_total")
        .with_description("Instance reconcile passes by outcome")
        .with_unit("{passes}")
        .build()
});

/// Histogram of reconcile pass duration
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("winnode_reconcile_duration_seconds")
        .with_description("Duration of instance reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of transport connection attempts
///
/// Labels:
/// - `result`: success, transient, auth_rejected
pub static CONNECT_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("winnode_transport_connect_attempts_total")
        .with_description("Remote host connection attempts by result")
        .with_unit("{attempts}")
        .build()
});

/// Counter of per-host trust bundle convergence results
///
/// Labels:
/// - `result`: converged, installed, failed
pub static BUNDLE_CONVERGENCE: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("winnode_trust_bundle_convergence_total")
        .with_description("Per-host trust bundle convergence results")
        .with_unit("{hosts}")
        .build()
});

/// Record one reconcile pass
pub fn record_reconcile(outcome: &'static str, error_kind: Option<&'static str>, seconds: f64) {
    let mut labels = vec![KeyValue::new("outcome", outcome)];
    if let Some(kind) = error_kind {
        labels.push(KeyValue::new("error_kind", kind));
    }
    RECONCILE_TOTAL.add(1, &labels);
    RECONCILE_DURATION.record(seconds, &[KeyValue::new("outcome", outcome)]);
}

/// Record one transport connection attempt
pub fn record_connect_attempt(result: &'static str) {
    CONNECT_ATTEMPTS.add(1, &[KeyValue::new("result", result)]);
}

/// Record one per-host convergence result
pub fn record_bundle_convergence(result: &'static str) {
    BUNDLE_CONVERGENCE.add(1, &[KeyValue::new("result", result)]);
}
