use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use strata_error::{Result, StrataError};

type RunFn = Box<dyn FnOnce(&WorkContext) -> Result<()> + Send + 'static>;
type ReleaseFn = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle of a submitted work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            WorkState::Succeeded | WorkState::Failed | WorkState::Cancelled
        )
    }
}

/// What a running item can see of its own execution.
#[derive(Debug, Clone)]
pub struct WorkContext {
    name: Arc<str>,
    cancelled: Arc<AtomicBool>,
}

impl WorkContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Best-effort interrupt flag; long loops should poll it.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(QueryCancelled)` once the item has been cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StrataError::cancelled(format!(
                "Work item '{}' was cancelled",
                self.name
            )))
        } else {
            Ok(())
        }
    }
}

/// A unit of schedulable work.
///
/// `release` runs exactly once whether the item succeeds, fails, panics, is
/// cancelled before starting or is rejected by a shut down pool.
pub struct WorkItem {
    name: String,
    run: RunFn,
    release: Option<ReleaseFn>,
}

impl WorkItem {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(&WorkContext) -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
            release: None,
        }
    }

    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(self) -> (String, RunFn, Option<ReleaseFn>) {
        (self.name, self.run, self.release)
    }

    /// Drop the item without running it, still honoring `release`.
    pub(crate) fn discard(self) {
        if let Some(release) = self.release {
            run_release(&self.name, release);
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("name", &self.name)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

pub(crate) fn run_release(name: &str, release: ReleaseFn) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(release)).is_err() {
        tracing::error!(target: "pool", item = %name, "Release action panicked");
    }
}

struct Status {
    state: WorkState,
    error: Option<StrataError>,
}

pub(crate) struct WorkShared {
    name: Arc<str>,
    status: Mutex<Status>,
    done: Condvar,
    cancelled: Arc<AtomicBool>,
}

impl WorkShared {
    pub(crate) fn new(name: &str, cancelled: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            name: Arc::from(name),
            status: Mutex::new(Status {
                state: WorkState::Pending,
                error: None,
            }),
            done: Condvar::new(),
            cancelled,
        })
    }

    pub(crate) fn context(&self) -> WorkContext {
        WorkContext {
            name: self.name.clone(),
            cancelled: self.cancelled.clone(),
        }
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Move `Pending -> Running`. False when the item was cancelled first.
    pub(crate) fn try_start(&self) -> bool {
        let mut status = self.status.lock();
        if status.state == WorkState::Pending && !self.cancelled.load(Ordering::Acquire) {
            status.state = WorkState::Running;
            true
        } else {
            false
        }
    }

    pub(crate) fn finish(&self, state: WorkState, error: Option<StrataError>) {
        let mut status = self.status.lock();
        status.state = state;
        status.error = error;
        self.done.notify_all();
    }
}

/// Observer and canceller of one submitted item.
#[derive(Clone)]
pub struct WorkHandle {
    shared: Arc<WorkShared>,
}

impl WorkHandle {
    pub(crate) fn new(shared: Arc<WorkShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> WorkState {
        self.shared.status.lock().state
    }

    /// Request cancellation.
    ///
    /// A pending item will never run; a running item only sees the flag
    /// through [`WorkContext::is_cancelled`]. Returns true when the item had
    /// not started yet.
    pub fn cancel(&self) -> bool {
        self.shared.cancelled.store(true, Ordering::Release);
        let status = self.shared.status.lock();
        status.state == WorkState::Pending
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Block until the item reaches a final state.
    pub fn wait(&self) -> WorkState {
        let mut status = self.shared.status.lock();
        while !status.state.is_finished() {
            self.shared.done.wait(&mut status);
        }
        status.state
    }

    /// Block until finished or `timeout`; returns whether it finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while !status.state.is_finished() {
            if self.shared.done.wait_until(&mut status, deadline).timed_out() {
                return status.state.is_finished();
            }
        }
        true
    }

    /// The error of a failed or cancelled run.
    pub fn error(&self) -> Option<StrataError> {
        self.shared.status.lock().error.clone()
    }
}

impl fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkHandle")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_before_start_blocks_run() {
        let shared = WorkShared::new("q", Arc::new(AtomicBool::new(false)));
        let handle = WorkHandle::new(shared.clone());
        assert!(handle.cancel());
        assert!(!shared.try_start());
        assert!(shared.context().check_cancelled().is_err());
    }

    #[test]
    fn test_discard_runs_release_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let item = WorkItem::new("noop", |_| Ok(())).with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        item.discard();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_timeout_on_pending_item() {
        let shared = WorkShared::new("slow", Arc::new(AtomicBool::new(false)));
        let handle = WorkHandle::new(shared.clone());
        assert!(!handle.wait_timeout(Duration::from_millis(10)));
        shared.finish(WorkState::Succeeded, None);
        assert_eq!(handle.wait(), WorkState::Succeeded);
    }
}
