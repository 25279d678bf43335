// Metrics for lock acquisition, renewal and release
// Counters are recorded through the `metrics` facade; the host installs the exporter

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

pub const ACQUISITIONS_TOTAL: &str = "lock_acquisitions_total";
pub const CONTENTIONS_TOTAL: &str = "lock_contentions_total";
pub const RECLAMATIONS_TOTAL: &str = "lock_reclamations_total";
pub const RELEASES_TOTAL: &str = "lock_releases_total";
pub const RENEWALS_TOTAL: &str = "lock_renewals_total";
pub const RENEWAL_FAILURES_TOTAL: &str = "lock_renewal_failures_total";
pub const LEASES_LOST_TOTAL: &str = "lock_leases_lost_total";
pub const LOCKS_HELD: &str = "locks_held";
pub const ACQUIRE_DURATION_SECONDS: &str = "lock_acquire_duration_seconds";

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    describe_counter!(ACQUISITIONS_TOTAL, "Total number of successful lock acquisitions");
    describe_counter!(
        CONTENTIONS_TOTAL,
        "Total number of acquisitions rejected because the lock was held"
    );
    describe_counter!(
        RECLAMATIONS_TOTAL,
        "Total number of expired locks taken over from another owner"
    );
    describe_counter!(RELEASES_TOTAL, "Total number of lock releases");
    describe_counter!(RENEWALS_TOTAL, "Total number of successful lease renewals");
    describe_counter!(
        RENEWAL_FAILURES_TOTAL,
        "Total number of lease renewals that hit a store error"
    );
    describe_counter!(LEASES_LOST_TOTAL, "Total number of leases lost while held");
    describe_gauge!(LOCKS_HELD, "Current number of locks held by this process");
    describe_histogram!(
        ACQUIRE_DURATION_SECONDS,
        "Lock acquisition duration in seconds"
    );

    tracing::info!("Lock metrics initialized");
}

/// Record the outcome of one acquisition attempt
pub fn record_acquire(outcome: &str, duration_secs: f64) {
    histogram!(ACQUIRE_DURATION_SECONDS, "outcome" => outcome.to_string()).record(duration_secs);
    match outcome {
        "acquired" => counter!(ACQUISITIONS_TOTAL).increment(1),
        "reclaimed" => {
            counter!(ACQUISITIONS_TOTAL).increment(1);
            counter!(RECLAMATIONS_TOTAL).increment(1);
        }
        "contended" => counter!(CONTENTIONS_TOTAL).increment(1),
        _ => {}
    }
}

/// Record a release and whether the record was still ours
pub fn record_release(released: bool) {
    counter!(RELEASES_TOTAL, "released" => released.to_string()).increment(1);
}

pub fn lock_held() {
    gauge!(LOCKS_HELD).increment(1.0);
}

pub fn lock_dropped() {
    gauge!(LOCKS_HELD).decrement(1.0);
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
