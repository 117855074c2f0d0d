//! Delayed and fixed-rate scheduling on top of the worker queue.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strata_error::Result;

use super::work::{WorkContext, WorkHandle};
use super::{Job, PoolInner};

pub(crate) type PeriodicFn = Box<dyn FnMut(&WorkContext) -> Result<()> + Send + 'static>;

/// A fixed-rate action. At most one firing is queued or running at a time.
pub(crate) struct PeriodicTask {
    pub(crate) name: String,
    pub(crate) action: Mutex<PeriodicFn>,
    pub(crate) period: Duration,
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) firings: Arc<AtomicU64>,
}

pub(crate) enum TimerTask {
    Once(Job),
    Periodic(Arc<PeriodicTask>),
}

pub(crate) struct TimerEntry {
    pub(crate) due: Instant,
    pub(crate) seq: u64,
    pub(crate) task: TimerTask,
}

// Min-heap on (due, seq) inside std's max-heap.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Handle returned by `schedule` and `schedule_at_fixed_rate`.
pub struct ScheduledHandle {
    name: String,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    firings: Arc<AtomicU64>,
    work: Option<WorkHandle>,
    pool: Weak<PoolInner>,
}

impl ScheduledHandle {
    pub(crate) fn new(
        name: String,
        seq: u64,
        cancelled: Arc<AtomicBool>,
        firings: Arc<AtomicU64>,
        work: Option<WorkHandle>,
        pool: Weak<PoolInner>,
    ) -> Self {
        Self {
            name,
            seq,
            cancelled,
            firings,
            work,
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prevent every future firing. A firing that has not started never
    /// starts; one already running only observes its cancellation flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(work) = &self.work {
            work.cancel();
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.remove_timer(self.seq);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Firings that have started so far.
    pub fn firings(&self) -> u64 {
        self.firings.load(Ordering::Acquire)
    }

    /// Handle of the underlying item for one-shot schedules.
    pub fn work_handle(&self) -> Option<&WorkHandle> {
        self.work.as_ref()
    }
}

impl std::fmt::Debug for ScheduledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledHandle")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .field("firings", &self.firings())
            .finish()
    }
}

/// Next due time of a fixed-rate task whose firing was due at `prev_due`.
///
/// An overrunning firing pushes the next one to its completion time rather
/// than queueing a burst of missed firings.
pub(crate) fn next_fixed_rate_due(prev_due: Instant, period: Duration, now: Instant) -> Instant {
    (prev_due + period).max(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn periodic(name: &str) -> TimerTask {
        TimerTask::Periodic(Arc::new(PeriodicTask {
            name: name.to_string(),
            action: Mutex::new(Box::new(|_| Ok(()))),
            period: Duration::from_millis(10),
            cancelled: Arc::new(AtomicBool::new(false)),
            firings: Arc::new(AtomicU64::new(0)),
        }))
    }

    #[test]
    fn test_heap_pops_earliest_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(TimerEntry {
            due: now + Duration::from_millis(30),
            seq: 1,
            task: periodic("late"),
        });
        heap.push(TimerEntry {
            due: now + Duration::from_millis(10),
            seq: 2,
            task: periodic("early"),
        });
        heap.push(TimerEntry {
            due: now + Duration::from_millis(10),
            seq: 3,
            task: periodic("early-second"),
        });

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.seq)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_overrun_defers_next_firing() {
        let start = Instant::now();
        let period = Duration::from_millis(10);
        assert_eq!(
            next_fixed_rate_due(start, period, start + Duration::from_millis(2)),
            start + period
        );
        let late = start + Duration::from_millis(75);
        assert_eq!(next_fixed_rate_due(start, period, late), late);
    }
}
