//! Counter service metrics for Prometheus
//!
//! Tracks counter writes, degraded-mode fallbacks, pipeline flushes, saga
//! outcomes and reconciliation activity.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::pipeline::FlushReport;

/// Shared metrics, injected into every component
#[derive(Debug)]
pub struct CounterMetrics {
    start_time: Instant,

    increments: AtomicU64,
    script_fallbacks: AtomicU64,
    degraded_reads: AtomicU64,
    version_mismatches: AtomicU64,

    direct_writes: AtomicU64,
    batches_flushed: AtomicU64,
    batch_fallbacks: AtomicU64,
    batch_items_applied: AtomicU64,
    batch_items_failed: AtomicU64,

    sagas_completed: AtomicU64,
    sagas_failed: AtomicU64,
    compensations_run: AtomicU64,
    compensations_failed: AtomicU64,

    reconciliations: AtomicU64,
    corrections: AtomicU64,
    consistency_checks: AtomicU64,
    drift_detected: AtomicU64,
}

impl Default for CounterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            increments: AtomicU64::new(0),
            script_fallbacks: AtomicU64::new(0),
            degraded_reads: AtomicU64::new(0),
            version_mismatches: AtomicU64::new(0),
            direct_writes: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            batch_fallbacks: AtomicU64::new(0),
            batch_items_applied: AtomicU64::new(0),
            batch_items_failed: AtomicU64::new(0),
            sagas_completed: AtomicU64::new(0),
            sagas_failed: AtomicU64::new(0),
            compensations_run: AtomicU64::new(0),
            compensations_failed: AtomicU64::new(0),
            reconciliations: AtomicU64::new(0),
            corrections: AtomicU64::new(0),
            consistency_checks: AtomicU64::new(0),
            drift_detected: AtomicU64::new(0),
        }
    }

    pub fn record_increment(&self) {
        self.increments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_script_fallback(&self) {
        self.script_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded_read(&self) {
        self.degraded_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_version_mismatch(&self) {
        self.version_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_direct_write(&self) {
        self.direct_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, report: &FlushReport) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        if report.fell_back {
            self.batch_fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        self.batch_items_applied
            .fetch_add(report.applied as u64, Ordering::Relaxed);
        self.batch_items_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
    }

    /// Record a finished saga and how its compensations went
    pub fn record_saga(&self, succeeded: bool, compensated: usize, compensation_failures: usize) {
        if succeeded {
            self.sagas_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sagas_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.compensations_run
            .fetch_add((compensated + compensation_failures) as u64, Ordering::Relaxed);
        self.compensations_failed
            .fetch_add(compensation_failures as u64, Ordering::Relaxed);
    }

    pub fn record_reconciliation(&self, corrected: bool) {
        self.reconciliations.fetch_add(1, Ordering::Relaxed);
        if corrected {
            self.corrections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_consistency_check(&self, drifted: bool) {
        self.consistency_checks.fetch_add(1, Ordering::Relaxed);
        if drifted {
            self.drift_detected.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn increments(&self) -> u64 {
        self.increments.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn script_fallbacks(&self) -> u64 {
        self.script_fallbacks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn direct_writes(&self) -> u64 {
        self.direct_writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sagas_failed(&self) -> u64 {
        self.sagas_failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn compensations_run(&self) -> u64 {
        self.compensations_run.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn corrections(&self) -> u64 {
        self.corrections.load(Ordering::Relaxed)
    }

    /// Export all metrics in Prometheus text format
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(4 * 1024);

        write_metric(
            &mut output,
            "tally_uptime_seconds",
            "Service uptime in seconds",
            "counter",
            self.start_time.elapsed().as_secs(),
        );

        let counters: [(&str, &str, &AtomicU64); 17] = [
            (
                "tally_counter_increments_total",
                "Counter increments applied through the store",
                &self.increments,
            ),
            (
                "tally_script_fallbacks_total",
                "Operations served by the non-atomic fallback path",
                &self.script_fallbacks,
            ),
            (
                "tally_degraded_reads_total",
                "Reads answered with 0 because the cache failed",
                &self.degraded_reads,
            ),
            (
                "tally_version_mismatches_total",
                "Versioned increments rejected by a stale version",
                &self.version_mismatches,
            ),
            (
                "tally_pipeline_direct_writes_total",
                "Updates applied synchronously because the queue was full",
                &self.direct_writes,
            ),
            (
                "tally_pipeline_batches_total",
                "Batches flushed by the pipeline",
                &self.batches_flushed,
            ),
            (
                "tally_pipeline_batch_fallbacks_total",
                "Batches that fell back to per-item increments",
                &self.batch_fallbacks,
            ),
            (
                "tally_pipeline_items_applied_total",
                "Batched updates applied",
                &self.batch_items_applied,
            ),
            (
                "tally_pipeline_items_failed_total",
                "Batched updates that could not be applied",
                &self.batch_items_failed,
            ),
            ("tally_sagas_completed_total", "Sagas that completed", &self.sagas_completed),
            (
                "tally_sagas_failed_total",
                "Sagas that failed and were compensated",
                &self.sagas_failed,
            ),
            ("tally_saga_compensations_total", "Compensations attempted", &self.compensations_run),
            (
                "tally_saga_compensations_failed_total",
                "Compensations that returned an error",
                &self.compensations_failed,
            ),
            (
                "tally_reconciliations_total",
                "Counters recomputed from the durable store",
                &self.reconciliations,
            ),
            (
                "tally_reconciliation_corrections_total",
                "Reconciliations that overwrote a drifted counter",
                &self.corrections,
            ),
            (
                "tally_consistency_checks_total",
                "Counters sampled by the consistency checker",
                &self.consistency_checks,
            ),
            (
                "tally_consistency_drift_total",
                "Sampled counters whose drift exceeded tolerance",
                &self.drift_detected,
            ),
        ];
        for (name, help, value) in counters {
            write_metric(
                &mut output,
                name,
                help,
                "counter",
                value.load(Ordering::Relaxed),
            );
        }

        output
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    // Writing into a String cannot fail
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
    let _ = writeln!(output, "{name} {value}");
}
