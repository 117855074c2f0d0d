use std::sync::atomic::{AtomicU64, Ordering};

/// Utilization snapshot of a worker pool.
///
/// Counters only grow; they reset when the pool is recreated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Items accepted into the queue, including scheduled firings.
    pub total_submitted: u64,
    /// Runs that returned `Ok`.
    pub total_completed: u64,
    /// Runs that returned an error or panicked.
    pub total_failed: u64,
    /// Items cancelled before or during their run.
    pub total_cancelled: u64,
    pub highest_active_threads: usize,
    pub active_threads: usize,
    pub pool_size: usize,
    pub queue_depth: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) cancelled: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fill(&self, stats: &mut PoolStats) {
        stats.total_submitted = self.submitted.load(Ordering::Relaxed);
        stats.total_completed = self.completed.load(Ordering::Relaxed);
        stats.total_failed = self.failed.load(Ordering::Relaxed);
        stats.total_cancelled = self.cancelled.load(Ordering::Relaxed);
    }
}
