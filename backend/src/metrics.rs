//! Counters for the coordinator, exposed on `/status`.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated metrics for the VRF oracle coordinator.
///
/// Thread-safe via atomics; shared as `Arc<Metrics>`.
#[derive(Default)]
pub struct Metrics {
    /// Request ids observed from live events or reconciliation.
    pub requests_seen: AtomicU64,
    /// Distinct proofs observed from non-finishing peers.
    pub provider_proofs: AtomicU64,
    /// Deadline timers armed (including re-arms).
    pub timers_armed: AtomicU64,
    /// Proof transactions accepted by the ledger.
    pub submissions: AtomicU64,
    /// Submissions that produced no transaction.
    pub submission_failures: AtomicU64,
    /// Invocations aborted because the request was already serviced.
    pub stale_aborts: AtomicU64,
    /// Completed reconciliation sweeps.
    pub sweeps: AtomicU64,
    /// Requests currently tracked in the registry.
    pub pending_requests: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provider_proof(&self) {
        self.provider_proofs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer(&self) {
        self.timers_armed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.submission_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending(&self, count: usize) {
        self.pending_requests.store(count as u64, Ordering::Relaxed);
    }

    /// Serialize metrics as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests_seen": self.requests_seen.load(Ordering::Relaxed),
            "provider_proofs": self.provider_proofs.load(Ordering::Relaxed),
            "timers_armed": self.timers_armed.load(Ordering::Relaxed),
            "submissions": self.submissions.load(Ordering::Relaxed),
            "submission_failures": self.submission_failures.load(Ordering::Relaxed),
            "stale_aborts": self.stale_aborts.load(Ordering::Relaxed),
            "sweeps": self.sweeps.load(Ordering::Relaxed),
            "pending_requests": self.pending_requests.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_reflects_counters() {
        let metrics = Metrics::new();
        metrics.record_submission();
        metrics.record_submission();
        metrics.record_stale();
        metrics.set_pending(3);

        let json = metrics.to_json();
        assert_eq!(json["submissions"], 2);
        assert_eq!(json["stale_aborts"], 1);
        assert_eq!(json["pending_requests"], 3);
        assert_eq!(json["submission_failures"], 0);
    }
}
