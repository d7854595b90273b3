//! Prometheus metrics for the GEO hub
//!
//! Exposed on /metrics for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_int_counter,
    register_int_gauge, CounterVec, Gauge, Histogram, IntCounter, IntGauge,
};

lazy_static! {
    // Payment engine
    pub static ref PAYMENTS_TOTAL: CounterVec = register_counter_vec!(
        "hub_payments_total",
        "Payments by terminal state",
        &["state"]
    ).unwrap();

    pub static ref PAYMENT_ABORT_REASONS: CounterVec = register_counter_vec!(
        "hub_payment_abort_reasons_total",
        "Aborted payments by error code",
        &["code"]
    ).unwrap();

    pub static ref PAYMENT_DURATION: Histogram = register_histogram!(
        "hub_payment_duration_seconds",
        "End-to-end payment latency (accept to terminal state)",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    // Router
    pub static ref ROUTING_DURATION: Histogram = register_histogram!(
        "hub_routing_duration_seconds",
        "Path search latency",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5]
    ).unwrap();

    pub static ref ROUTES_PER_PAYMENT: Histogram = register_histogram!(
        "hub_routes_per_payment",
        "Paths used per committed payment",
        vec![1.0, 2.0, 3.0, 4.0, 6.0, 8.0]
    ).unwrap();

    // Reservations
    pub static ref ACTIVE_PREPARE_LOCKS: IntGauge = register_int_gauge!(
        "hub_active_prepare_locks",
        "Live capacity reservations"
    ).unwrap();

    // Clearing engine
    pub static ref CLEARING_CYCLES_APPLIED: IntCounter = register_int_counter!(
        "hub_clearing_cycles_applied_total",
        "Debt cycles netted out"
    ).unwrap();

    pub static ref CLEARING_CYCLES_SKIPPED: CounterVec = register_counter_vec!(
        "hub_clearing_cycles_skipped_total",
        "Candidate cycles skipped by reason",
        &["reason"]
    ).unwrap();

    // Recovery loop
    pub static ref RECOVERY_EXPIRED_LOCKS: IntCounter = register_int_counter!(
        "hub_recovery_expired_locks_total",
        "Prepare locks expired by the recovery sweep"
    ).unwrap();

    pub static ref RECOVERY_ABORTED_TRANSACTIONS: IntCounter = register_int_counter!(
        "hub_recovery_aborted_transactions_total",
        "Transactions aborted by the recovery sweep"
    ).unwrap();

    // Invariant checker
    pub static ref INVARIANT_VIOLATIONS: IntCounter = register_int_counter!(
        "hub_invariant_violations_total",
        "Invariant check failures (each one aborts its transaction)"
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "hub_up",
        "Whether the hub is up and running"
    ).unwrap();
}

/// Record a payment reaching a terminal state
pub fn record_payment(state: &str, seconds: f64) {
    PAYMENTS_TOTAL.with_label_values(&[state]).inc();
    PAYMENT_DURATION.observe(seconds);
}

/// Record an abort reason
pub fn record_abort_reason(code: &str) {
    PAYMENT_ABORT_REASONS.with_label_values(&[code]).inc();
}

/// Record a clearing skip
pub fn record_clearing_skip(reason: &str) {
    CLEARING_CYCLES_SKIPPED.with_label_values(&[reason]).inc();
}
