//! Global atomic counters for GradeGuard observability.
//!
//! Counters are bumped at the commit boundary. Call [`Metrics::flush`] to
//! emit current values as a single `tracing::info!` event (the CLI does so
//! before exiting).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    commits: AtomicU64,
    commit_conflicts: AtomicU64,
    no_ops: AtomicU64,
    audit_relayed: AtomicU64,
    audit_relay_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            commits: AtomicU64::new(0),
            commit_conflicts: AtomicU64::new(0),
            no_ops: AtomicU64::new(0),
            audit_relayed: AtomicU64::new(0),
            audit_relay_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_commits(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// A commit lost an optimistic-concurrency race.
    pub fn inc_commit_conflicts(&self) {
        self.commit_conflicts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "commit_conflicts", "counter incremented");
    }

    /// An operation found its target state already in place.
    pub fn inc_no_ops(&self) {
        self.no_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_audit_relayed(&self, n: u64) {
        self.audit_relayed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_audit_relay_failures(&self) {
        self.audit_relay_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "audit_relay_failures", "counter incremented");
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            commits = self.commits(),
            commit_conflicts = self.commit_conflicts(),
            no_ops = self.no_ops(),
            audit_relayed = self.audit_relayed(),
            audit_relay_failures = self.audit_relay_failures(),
        );
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn commit_conflicts(&self) -> u64 {
        self.commit_conflicts.load(Ordering::Relaxed)
    }

    pub fn no_ops(&self) -> u64 {
        self.no_ops.load(Ordering::Relaxed)
    }

    pub fn audit_relayed(&self) -> u64 {
        self.audit_relayed.load(Ordering::Relaxed)
    }

    pub fn audit_relay_failures(&self) -> u64 {
        self.audit_relay_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.commits.store(0, Ordering::Relaxed);
        self.commit_conflicts.store(0, Ordering::Relaxed);
        self.no_ops.store(0, Ordering::Relaxed);
        self.audit_relayed.store(0, Ordering::Relaxed);
        self.audit_relay_failures.store(0, Ordering::Relaxed);
    }
}
