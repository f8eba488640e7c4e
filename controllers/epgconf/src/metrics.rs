//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `epgconf_reconciliations_total` - Total number of reconciliations
//! - `epgconf_reconciliation_errors_total` - Total number of reconciliation errors
//! - `epgconf_reconciliation_duration_seconds` - Duration of reconciliations
//! - `epgconf_fabric_operations_total` - APIC operations by operation
//! - `epgconf_fabric_operation_errors_total` - Failed APIC operations by operation

use prometheus::{Histogram, IntCounter, IntCounterVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("epgconf_reconciliations_total", "Total number of reconciliations")
        .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "epgconf_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "epgconf_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static FABRIC_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "epgconf_fabric_operations_total",
            "Total number of APIC operations by operation",
        ),
        &["operation"],
    )
    .expect("Failed to create FABRIC_OPERATIONS_TOTAL metric - this should never happen")
});

static FABRIC_OPERATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "epgconf_fabric_operation_errors_total",
            "Total number of failed APIC operations by operation",
        ),
        &["operation"],
    )
    .expect("Failed to create FABRIC_OPERATION_ERRORS_TOTAL metric - this should never happen")
});

/// Register all metrics with the process registry
///
/// # Errors
/// Fails when called twice.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(FABRIC_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FABRIC_OPERATION_ERRORS_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_fabric_operations(operation: &str) {
    FABRIC_OPERATIONS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn increment_fabric_operation_errors(operation: &str) {
    FABRIC_OPERATION_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}
