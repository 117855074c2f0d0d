//! Bounded worker pool.
//!
//! Work runs FIFO on at most `max_threads` OS threads. Threads are spawned
//! lazily and reused; a single timer thread feeds delayed and fixed-rate
//! work into the same queue. A failing or panicking item is isolated to its
//! own run: it is counted as failed, its `release` still runs and the worker
//! thread moves on to the next item.

mod schedule;
mod stats;
mod work;

pub use schedule::ScheduledHandle;
pub use stats::PoolStats;
pub use work::{WorkContext, WorkHandle, WorkItem, WorkState};

use std::collections::{BinaryHeap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use strata_common::config::PoolSettings;
use strata_error::{ErrorCode, ErrorContext, StrataError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use schedule::{next_fixed_rate_due, PeriodicTask, TimerEntry, TimerTask};
use stats::Counters;
use work::{run_release, WorkShared};

#[derive(Debug, Clone)]
pub struct WorkerPoolOptions {
    pub name: String,
    pub max_threads: usize,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for WorkerPoolOptions {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            name: settings.name.clone(),
            max_threads: settings.max_threads.max(1),
        }
    }
}

/// Raised when work is offered to a pool that no longer accepts it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectedExecution {
    #[error("Pool '{pool}' is shut down; rejected '{item}'")]
    Shutdown { pool: String, item: String },
}

impl From<RejectedExecution> for StrataError {
    fn from(err: RejectedExecution) -> Self {
        let message = err.to_string();
        match err {
            RejectedExecution::Shutdown { pool, item } => {
                StrataError::new(ErrorCode::WorkRejected, message)
                    .with_context(ErrorContext::WorkItem { pool, item })
            }
        }
    }
}

/// Outcome of [`WorkerPool::await_termination`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Drained,
    TimedOut,
}

pub(crate) type DoneHook = Box<dyn FnOnce(&Arc<PoolInner>) + Send + 'static>;

pub(crate) struct Job {
    item: WorkItem,
    shared: Arc<WorkShared>,
    on_done: Option<DoneHook>,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    threads: usize,
    idle: usize,
    active: usize,
    highest_active: usize,
    shutdown: bool,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    timer_running: bool,
    thread_seq: u64,
}

pub(crate) struct PoolInner {
    options: WorkerPoolOptions,
    state: Mutex<PoolState>,
    work_ready: Condvar,
    timer_wake: Condvar,
    terminated: Condvar,
    counters: Counters,
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(options: WorkerPoolOptions) -> Self {
        info!(
            target: "pool",
            pool = %options.name,
            max_threads = options.max_threads,
            "Creating worker pool"
        );
        Self {
            inner: Arc::new(PoolInner {
                options,
                state: Mutex::new(PoolState::default()),
                work_ready: Condvar::new(),
                timer_wake: Condvar::new(),
                terminated: Condvar::new(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    /// Queue `item` for the next free thread.
    pub fn execute(&self, item: WorkItem) -> Result<WorkHandle, RejectedExecution> {
        let shared = WorkShared::new(item.name(), Arc::new(AtomicBool::new(false)));
        let handle = WorkHandle::new(shared.clone());
        self.inner.submit(Job {
            item,
            shared,
            on_done: None,
        })?;
        Ok(handle)
    }

    /// Queue `item` once `delay` has elapsed.
    pub fn schedule(
        &self,
        item: WorkItem,
        delay: Duration,
    ) -> Result<ScheduledHandle, RejectedExecution> {
        let (name, run, release) = item.into_parts();
        let firings = Arc::new(AtomicU64::new(0));
        let counter = firings.clone();
        let mut item = WorkItem::new(name.clone(), move |ctx: &WorkContext| {
            counter.fetch_add(1, Ordering::AcqRel);
            run(ctx)
        });
        if let Some(release) = release {
            item = item.with_release(release);
        }

        let shared = WorkShared::new(&name, Arc::new(AtomicBool::new(false)));
        let handle = WorkHandle::new(shared.clone());
        let cancelled = shared.cancel_flag();
        let job = Job {
            item,
            shared,
            on_done: None,
        };
        let seq = self
            .inner
            .add_timer(Instant::now() + delay, TimerTask::Once(job))?;
        Ok(ScheduledHandle::new(
            name,
            seq,
            cancelled,
            firings,
            Some(handle),
            Arc::downgrade(&self.inner),
        ))
    }

    /// Run `action` every `period` after `initial_delay`.
    ///
    /// Firings never overlap: the next firing is timed from the previous due
    /// time, or from the previous completion when that ran past it.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        name: impl Into<String>,
        action: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle, RejectedExecution>
    where
        F: FnMut(&WorkContext) -> strata_error::Result<()> + Send + 'static,
    {
        let task = Arc::new(PeriodicTask {
            name: name.into(),
            action: Mutex::new(Box::new(action)),
            period,
            cancelled: Arc::new(AtomicBool::new(false)),
            firings: Arc::new(AtomicU64::new(0)),
        });
        let seq = self.inner.add_timer(
            Instant::now() + initial_delay,
            TimerTask::Periodic(task.clone()),
        )?;
        Ok(ScheduledHandle::new(
            task.name.clone(),
            seq,
            task.cancelled.clone(),
            task.firings.clone(),
            None,
            Arc::downgrade(&self.inner),
        ))
    }

    /// Stop accepting work. Queued items still drain; pending timers are
    /// cancelled. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        info!(
            target: "pool",
            pool = %self.inner.options.name,
            queued = state.queue.len(),
            active = state.active,
            "Shutting down worker pool"
        );
        self.inner.work_ready.notify_all();
        self.inner.timer_wake.notify_all();
        self.inner.terminated.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Block until every thread has exited after `shutdown`, or `timeout`.
    pub fn await_termination(&self, timeout: Duration) -> Termination {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            let drained = state.shutdown
                && state.queue.is_empty()
                && state.threads == 0
                && !state.timer_running;
            if drained {
                return Termination::Drained;
            }
            if self
                .inner
                .terminated
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                let drained = state.shutdown
                    && state.queue.is_empty()
                    && state.threads == 0
                    && !state.timer_running;
                return if drained {
                    Termination::Drained
                } else {
                    Termination::TimedOut
                };
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut stats = PoolStats {
            highest_active_threads: state.highest_active,
            active_threads: state.active,
            pool_size: state.threads,
            queue_depth: state.queue.len(),
            ..Default::default()
        };
        self.inner.counters.fill(&mut stats);
        stats
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.options.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    fn submit(self: &Arc<Self>, job: Job) -> Result<(), RejectedExecution> {
        let mut state = self.state.lock();
        if state.shutdown {
            drop(state);
            return Err(self.reject(job));
        }
        self.enqueue_locked(&mut state, job);
        Ok(())
    }

    fn reject(&self, job: Job) -> RejectedExecution {
        let item = job.item.name().to_string();
        warn!(
            target: "pool",
            pool = %self.options.name,
            item = %item,
            "Rejected work item after shutdown"
        );
        job.item.discard();
        job.shared.finish(
            WorkState::Cancelled,
            Some(
                RejectedExecution::Shutdown {
                    pool: self.options.name.clone(),
                    item: item.clone(),
                }
                .into(),
            ),
        );
        RejectedExecution::Shutdown {
            pool: self.options.name.clone(),
            item,
        }
    }

    fn enqueue_locked(self: &Arc<Self>, state: &mut PoolState, job: Job) {
        state.queue.push_back(job);
        Counters::bump(&self.counters.submitted);
        if state.queue.len() > state.idle && state.threads < self.options.max_threads {
            self.spawn_worker(state);
        } else {
            self.work_ready.notify_one();
        }
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState) {
        state.thread_seq += 1;
        let name = format!("{}-{}", self.options.name, state.thread_seq);
        let inner = self.clone();
        match std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || inner.worker_loop())
        {
            Ok(_) => {
                state.threads += 1;
                debug!(target: "pool", thread = %name, threads = state.threads, "Spawned worker");
            }
            Err(e) => {
                error!(target: "pool", thread = %name, error = %e, "Failed to spawn worker");
                self.work_ready.notify_one();
            }
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if let Some(job) = state.queue.pop_front() {
                        state.active += 1;
                        state.highest_active = state.highest_active.max(state.active);
                        break Some(job);
                    }
                    if state.shutdown {
                        break None;
                    }
                    state.idle += 1;
                    self.work_ready.wait(&mut state);
                    state.idle -= 1;
                }
            };
            let Some(job) = job else { break };

            self.run_job(job);

            let mut state = self.state.lock();
            state.active -= 1;
            if state.shutdown {
                self.terminated.notify_all();
            }
        }

        let mut state = self.state.lock();
        state.threads -= 1;
        self.terminated.notify_all();
    }

    fn run_job(self: &Arc<Self>, job: Job) {
        let Job {
            item,
            shared,
            on_done,
        } = job;
        let (name, run, release) = item.into_parts();

        let outcome = if shared.try_start() {
            let ctx = shared.context();
            match catch_unwind(AssertUnwindSafe(|| run(&ctx))) {
                Ok(Ok(())) => (WorkState::Succeeded, None),
                Ok(Err(e)) if e.is_cancellation() && ctx.is_cancelled() => {
                    (WorkState::Cancelled, Some(e))
                }
                Ok(Err(e)) => {
                    warn!(target: "pool", item = %name, error = %e, "Work item failed");
                    (WorkState::Failed, Some(e))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(target: "pool", item = %name, panic = %message, "Work item panicked");
                    let err = StrataError::new(
                        ErrorCode::WorkItemFailed,
                        format!("Work item '{}' panicked: {}", name, message),
                    )
                    .with_context(ErrorContext::WorkItem {
                        pool: self.options.name.clone(),
                        item: name.clone(),
                    });
                    (WorkState::Failed, Some(err))
                }
            }
        } else {
            debug!(target: "pool", item = %name, "Skipping cancelled work item");
            (WorkState::Cancelled, None)
        };

        if let Some(release) = release {
            run_release(&name, release);
        }
        match outcome.0 {
            WorkState::Succeeded => Counters::bump(&self.counters.completed),
            WorkState::Failed => Counters::bump(&self.counters.failed),
            _ => Counters::bump(&self.counters.cancelled),
        }
        shared.finish(outcome.0, outcome.1);

        if let Some(on_done) = on_done {
            on_done(self);
        }
    }

    fn add_timer(self: &Arc<Self>, due: Instant, task: TimerTask) -> Result<u64, RejectedExecution> {
        let mut state = self.state.lock();
        if state.shutdown {
            drop(state);
            return Err(match task {
                TimerTask::Once(job) => self.reject(job),
                TimerTask::Periodic(task) => RejectedExecution::Shutdown {
                    pool: self.options.name.clone(),
                    item: task.name.clone(),
                },
            });
        }
        state.timer_seq += 1;
        let seq = state.timer_seq;
        state.timers.push(TimerEntry { due, seq, task });
        if !state.timer_running {
            let inner = self.clone();
            match std::thread::Builder::new()
                .name(format!("{}-timer", self.options.name))
                .spawn(move || inner.timer_loop())
            {
                Ok(_) => state.timer_running = true,
                Err(e) => error!(target: "pool", error = %e, "Failed to spawn timer thread"),
            }
        }
        self.timer_wake.notify_all();
        Ok(seq)
    }

    /// Drop a timer that has not fired yet.
    pub(crate) fn remove_timer(self: &Arc<Self>, seq: u64) {
        let removed: Vec<TimerEntry> = {
            let mut state = self.state.lock();
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.timers)
                .into_iter()
                .partition(|entry| entry.seq == seq);
            state.timers = kept.into();
            removed
        };
        for entry in removed {
            self.abandon(entry.task);
        }
    }

    fn timer_loop(self: Arc<Self>) {
        loop {
            let (fired, shutdown) = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        let pending: Vec<TimerEntry> = std::mem::take(&mut state.timers).into_vec();
                        break (pending, true);
                    }
                    let now = Instant::now();
                    let next_due = state.timers.peek().map(|entry| entry.due);
                    match next_due {
                        Some(due) if due <= now => {
                            let mut fired = Vec::new();
                            while state.timers.peek().map_or(false, |e| e.due <= now) {
                                if let Some(entry) = state.timers.pop() {
                                    fired.push(entry);
                                }
                            }
                            break (fired, false);
                        }
                        Some(due) => {
                            self.timer_wake.wait_until(&mut state, due);
                        }
                        None => self.timer_wake.wait(&mut state),
                    }
                }
            };

            for entry in fired {
                if shutdown {
                    self.abandon(entry.task);
                } else {
                    self.fire(entry);
                }
            }

            if shutdown {
                let mut state = self.state.lock();
                state.timer_running = false;
                self.terminated.notify_all();
                return;
            }
        }
    }

    fn fire(self: &Arc<Self>, entry: TimerEntry) {
        match entry.task {
            TimerTask::Once(job) => {
                if job.shared.cancel_flag().load(Ordering::Acquire) {
                    self.abandon(TimerTask::Once(job));
                } else if let Err(e) = self.submit(job) {
                    debug!(target: "pool", error = %e, "Delayed item fired after shutdown");
                }
            }
            TimerTask::Periodic(task) => {
                if task.cancelled.load(Ordering::Acquire) {
                    return;
                }
                let job = periodic_firing(task, entry.due);
                if let Err(e) = self.submit(job) {
                    debug!(target: "pool", error = %e, "Periodic firing after shutdown");
                }
            }
        }
    }

    fn abandon(&self, task: TimerTask) {
        match task {
            TimerTask::Once(job) => {
                job.item.discard();
                job.shared.finish(WorkState::Cancelled, None);
                Counters::bump(&self.counters.cancelled);
            }
            TimerTask::Periodic(task) => {
                task.cancelled.store(true, Ordering::Release);
            }
        }
    }
}

fn periodic_firing(task: Arc<PeriodicTask>, due: Instant) -> Job {
    let runner = task.clone();
    let item = WorkItem::new(task.name.clone(), move |ctx: &WorkContext| {
        runner.firings.fetch_add(1, Ordering::AcqRel);
        let mut guard = runner.action.lock();
        let action = &mut *guard;
        action(ctx)
    });
    let shared = WorkShared::new(&task.name, task.cancelled.clone());
    let on_done: DoneHook = Box::new(move |inner: &Arc<PoolInner>| {
        if task.cancelled.load(Ordering::Acquire) {
            return;
        }
        let next = next_fixed_rate_due(due, task.period, Instant::now());
        let name = task.name.clone();
        if inner.add_timer(next, TimerTask::Periodic(task)).is_err() {
            debug!(target: "pool", task = %name, "Stopped periodic task at shutdown");
        }
    });
    Job {
        item,
        shared,
        on_done: Some(on_done),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pool(threads: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolOptions {
            name: "test-pool".to_string(),
            max_threads: threads,
        })
    }

    #[test]
    fn test_execute_runs_and_reports_success() {
        let pool = pool(2);
        let handle = pool
            .execute(WorkItem::new("ok", |_| Ok(())))
            .unwrap();
        assert_eq!(handle.wait(), WorkState::Succeeded);
        assert_eq!(pool.stats().total_completed, 1);
        assert_eq!(pool.stats().total_submitted, 1);
    }

    #[test]
    fn test_threads_are_reused() {
        let pool = pool(2);
        for i in 0..10 {
            let handle = pool
                .execute(WorkItem::new(format!("item-{}", i), |_| Ok(())))
                .unwrap();
            handle.wait();
        }
        assert!(pool.stats().pool_size <= 2);
    }

    #[test]
    fn test_panic_is_isolated() {
        let pool = pool(1);
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let bad = pool
            .execute(
                WorkItem::new("boom", |_| panic!("boom")).with_release(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(bad.wait(), WorkState::Failed);
        assert_eq!(bad.error().unwrap().code, ErrorCode::WorkItemFailed);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let good = pool.execute(WorkItem::new("after", |_| Ok(()))).unwrap();
        assert_eq!(good.wait(), WorkState::Succeeded);
        assert_eq!(pool.stats().total_failed, 1);
    }

    #[test]
    fn test_rejected_after_shutdown_runs_release() {
        let pool = pool(1);
        pool.shutdown();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let err = pool
            .execute(WorkItem::new("late", |_| Ok(())).with_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap_err();
        assert!(matches!(err, RejectedExecution::Shutdown { .. }));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        let strata: StrataError = err.into();
        assert_eq!(strata.code, ErrorCode::WorkRejected);
    }

    #[test]
    fn test_cancelled_pending_item_never_runs() {
        let pool = pool(1);
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let blocker_gate = gate.clone();
        pool.execute(WorkItem::new("blocker", move |_| {
            let (lock, cvar) = &*blocker_gate;
            let mut open = lock.lock();
            while !*open {
                cvar.wait(&mut open);
            }
            Ok(())
        }))
        .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let victim = pool
            .execute(WorkItem::new("victim", move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        assert!(victim.cancel());

        *gate.0.lock() = true;
        gate.1.notify_all();
        assert_eq!(victim.wait(), WorkState::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(pool.stats().total_cancelled, 1);
    }

    #[test]
    fn test_schedule_delays_execution() {
        let pool = pool(1);
        let start = Instant::now();
        let handle = pool
            .schedule(WorkItem::new("later", |_| Ok(())), Duration::from_millis(30))
            .unwrap();
        let work = handle.work_handle().unwrap().clone();
        assert_eq!(work.wait(), WorkState::Succeeded);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_cancelled_schedule_never_fires() {
        let pool = pool(1);
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let handle = pool
            .schedule(
                WorkItem::new("never", |_| panic!("must not run")).with_release(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_secs(60),
            )
            .unwrap();
        handle.cancel();
        let work = handle.work_handle().unwrap();
        assert!(work.wait_timeout(Duration::from_secs(1)));
        assert_eq!(work.state(), WorkState::Cancelled);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = pool(1);
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..5 {
            let done = done.clone();
            pool.execute(WorkItem::new(format!("drain-{}", i), move |_| {
                std::thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(
            pool.await_termination(Duration::from_secs(5)),
            Termination::Drained
        );
        assert_eq!(done.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_await_termination_times_out() {
        let pool = pool(1);
        pool.execute(WorkItem::new("slow", |_| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }))
        .unwrap();
        pool.shutdown();
        assert_eq!(
            pool.await_termination(Duration::from_millis(10)),
            Termination::TimedOut
        );
        assert_eq!(
            pool.await_termination(Duration::from_secs(5)),
            Termination::Drained
        );
    }
}
