//! Metrics collection for observability
//!
//! Prometheus metrics for ledger mutations, audit transitions and rate
//! resolution. Each `Metrics` owns its registry, so several ledgers can live
//! in one process.
//!
//! # Metrics
//!
//! - `ledger_performs_total` - Committed balance mutations
//! - `ledger_concurrency_conflicts_total` - Mutations rejected on a stale version
//! - `ledger_integrity_failures_total` - Wallet hash mismatches
//! - `ledger_history_transitions_total` - Audit entry status transitions
//! - `ledger_rate_resolutions_total` - Successful rate resolutions
//! - `ledger_rate_misses_total` - Resolutions with no valid rate
//! - `ledger_perform_duration_seconds` - Histogram of mutation latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Committed mutations
    pub performs_total: IntCounter,

    /// Stale-version rejections
    pub concurrency_conflicts: IntCounter,

    /// Hash mismatches
    pub integrity_failures: IntCounter,

    /// Audit entry transitions
    pub history_transitions: IntCounter,

    /// Rate resolutions
    pub rate_resolutions: IntCounter,

    /// Rate lookups with no valid record
    pub rate_misses: IntCounter,

    /// Perform duration histogram
    pub perform_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let performs_total =
            IntCounter::new("ledger_performs_total", "Committed balance mutations")?;
        registry.register(Box::new(performs_total.clone()))?;

        let concurrency_conflicts = IntCounter::new(
            "ledger_concurrency_conflicts_total",
            "Mutations rejected on a stale wallet version",
        )?;
        registry.register(Box::new(concurrency_conflicts.clone()))?;

        let integrity_failures = IntCounter::new(
            "ledger_integrity_failures_total",
            "Wallet integrity hash mismatches",
        )?;
        registry.register(Box::new(integrity_failures.clone()))?;

        let history_transitions = IntCounter::new(
            "ledger_history_transitions_total",
            "Wallet history status transitions",
        )?;
        registry.register(Box::new(history_transitions.clone()))?;

        let rate_resolutions = IntCounter::new(
            "ledger_rate_resolutions_total",
            "Successful exchange rate resolutions",
        )?;
        registry.register(Box::new(rate_resolutions.clone()))?;

        let rate_misses = IntCounter::new(
            "ledger_rate_misses_total",
            "Exchange rate lookups with no valid record",
        )?;
        registry.register(Box::new(rate_misses.clone()))?;

        let perform_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_perform_duration_seconds",
                "Histogram of balance mutation latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(perform_duration.clone()))?;

        Ok(Self {
            performs_total,
            concurrency_conflicts,
            integrity_failures,
            history_transitions,
            rate_resolutions,
            rate_misses,
            perform_duration,
            registry,
        })
    }

    /// Record committed mutation
    pub fn record_perform(&self, duration_seconds: f64) {
        self.performs_total.inc();
        self.perform_duration.observe(duration_seconds);
    }

    /// Record stale-version rejection
    pub fn record_concurrency_conflict(&self) {
        self.concurrency_conflicts.inc();
    }

    /// Record hash mismatch
    pub fn record_integrity_failure(&self) {
        self.integrity_failures.inc();
    }

    /// Record audit entry transition
    pub fn record_history_transition(&self) {
        self.history_transitions.inc();
    }

    /// Record rate resolution
    pub fn record_rate_resolution(&self) {
        self.rate_resolutions.inc();
    }

    /// Record rate miss
    pub fn record_rate_miss(&self) {
        self.rate_misses.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
