use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for enrollment outcomes
#[derive(Debug, Default)]
pub struct EnrollmentMetrics {
    pub enrolled: AtomicU64,
    pub already_owned: AtomicU64,
    pub insufficient_funds: AtomicU64,
    pub no_available_group: AtomicU64,
    pub not_found: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl EnrollmentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enrolled(&self) {
        self.enrolled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_already_owned(&self) {
        self.already_owned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insufficient_funds(&self) {
        self.insufficient_funds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_available_group(&self) {
        self.no_available_group.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> EnrollmentStats {
        EnrollmentStats {
            enrolled: self.enrolled.load(Ordering::Relaxed),
            already_owned: self.already_owned.load(Ordering::Relaxed),
            insufficient_funds: self.insufficient_funds.load(Ordering::Relaxed),
            no_available_group: self.no_available_group.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            enrolled = stats.enrolled,
            already_owned = stats.already_owned,
            insufficient_funds = stats.insufficient_funds,
            no_available_group = stats.no_available_group,
            not_found = stats.not_found,
            storage_errors = stats.storage_errors,
            "Enrollment metrics"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrollmentStats {
    pub enrolled: u64,
    pub already_owned: u64,
    pub insufficient_funds: u64,
    pub no_available_group: u64,
    pub not_found: u64,
    pub storage_errors: u64,
}

/// Process-wide counters
static ENROLLMENT_METRICS: std::sync::LazyLock<EnrollmentMetrics> =
    std::sync::LazyLock::new(EnrollmentMetrics::new);

pub fn enrollment_metrics() -> &'static EnrollmentMetrics {
    &ENROLLMENT_METRICS
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = EnrollmentMetrics::new();
        metrics.record_enrolled();
        metrics.record_enrolled();
        metrics.record_insufficient_funds();

        let stats = metrics.get_stats();
        assert_eq!(stats.enrolled, 2);
        assert_eq!(stats.insufficient_funds, 1);
        assert_eq!(stats.no_available_group, 0);
    }
}
