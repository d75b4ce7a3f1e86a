//! Global atomic counters for toolvault observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. on a daemon tick).

use std::sync::atomic::{AtomicU64, Ordering};

use toolvault_state::ExecutionStatus;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    executions_started: AtomicU64,
    executions_succeeded: AtomicU64,
    executions_failed: AtomicU64,
    executions_timed_out: AtomicU64,
    executions_cancelled: AtomicU64,
    admissions_rejected: AtomicU64,
    platform_retries: AtomicU64,
    lifecycle_rejected: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            executions_started: AtomicU64::new(0),
            executions_succeeded: AtomicU64::new(0),
            executions_failed: AtomicU64::new(0),
            executions_timed_out: AtomicU64::new(0),
            executions_cancelled: AtomicU64::new(0),
            admissions_rejected: AtomicU64::new(0),
            platform_retries: AtomicU64::new(0),
            lifecycle_rejected: AtomicU64::new(0),
        }
    }

    /// Increment the executions-started counter by one.
    pub fn inc_started(&self) {
        self.executions_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_started", "counter incremented");
    }

    /// Count one terminal execution under its status.
    pub fn record_finished(&self, status: ExecutionStatus) {
        let counter = match status {
            ExecutionStatus::Running => return,
            ExecutionStatus::Success => &self.executions_succeeded,
            ExecutionStatus::Failure => &self.executions_failed,
            ExecutionStatus::Timeout => &self.executions_timed_out,
            ExecutionStatus::Cancelled => &self.executions_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_finished", status = %status, "counter incremented");
    }

    pub fn inc_admission_rejected(&self) {
        self.admissions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_platform_retries(&self) {
        self.platform_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_lifecycle_rejected(&self) {
        self.lifecycle_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            executions_started = self.executions_started(),
            executions_succeeded = self.executions_succeeded(),
            executions_failed = self.executions_failed(),
            executions_timed_out = self.executions_timed_out(),
            executions_cancelled = self.executions_cancelled(),
            admissions_rejected = self.admissions_rejected(),
            platform_retries = self.platform_retries(),
            lifecycle_rejected = self.lifecycle_rejected(),
        );
    }

    pub fn executions_started(&self) -> u64 {
        self.executions_started.load(Ordering::Relaxed)
    }

    pub fn executions_succeeded(&self) -> u64 {
        self.executions_succeeded.load(Ordering::Relaxed)
    }

    pub fn executions_failed(&self) -> u64 {
        self.executions_failed.load(Ordering::Relaxed)
    }

    pub fn executions_timed_out(&self) -> u64 {
        self.executions_timed_out.load(Ordering::Relaxed)
    }

    pub fn executions_cancelled(&self) -> u64 {
        self.executions_cancelled.load(Ordering::Relaxed)
    }

    pub fn admissions_rejected(&self) -> u64 {
        self.admissions_rejected.load(Ordering::Relaxed)
    }

    pub fn platform_retries(&self) -> u64 {
        self.platform_retries.load(Ordering::Relaxed)
    }

    pub fn lifecycle_rejected(&self) -> u64 {
        self.lifecycle_rejected.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.executions_started,
            &self.executions_succeeded,
            &self.executions_failed,
            &self.executions_timed_out,
            &self.executions_cancelled,
            &self.admissions_rejected,
            &self.platform_retries,
            &self.lifecycle_rejected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_started();
        m.inc_started();
        assert_eq!(m.executions_started(), 2);

        m.record_finished(ExecutionStatus::Success);
        m.record_finished(ExecutionStatus::Timeout);
        m.record_finished(ExecutionStatus::Running);
        assert_eq!(m.executions_succeeded(), 1);
        assert_eq!(m.executions_timed_out(), 1);
        assert_eq!(m.executions_failed(), 0);

        m.inc_admission_rejected();
        assert_eq!(m.admissions_rejected(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_started();
        m.inc_platform_retries();
        m.inc_lifecycle_rejected();
        m.record_finished(ExecutionStatus::Cancelled);
        m.reset();
        assert_eq!(m.executions_started(), 0);
        assert_eq!(m.platform_retries(), 0);
        assert_eq!(m.lifecycle_rejected(), 0);
        assert_eq!(m.executions_cancelled(), 0);
    }
}
