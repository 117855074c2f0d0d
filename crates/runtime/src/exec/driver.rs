//! Pool-driven execution of a root plan.
//!
//! A [`PlanDriver`] turns an open [`PlanExecutor`] into a chain of short work
//! items. Each item polls the plan for a few batches and hands them to the
//! consumer over a bounded channel, then resubmits itself. `NotReady` and a
//! full channel both resubmit with a delay instead of holding a worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strata_common::config::QuerySettings;
use strata_error::{ErrorCode, ErrorContext, Result, StrataError};
use tracing::{debug, warn};

use super::cancel::CancellationToken;
use super::plan::{BatchPoll, PlanExecutor};
use crate::pool::{RejectedExecution, ScheduledHandle, WorkItem, WorkerPool};
use crate::types::{SchemaRef, TupleBatch};

type FinishFn = Box<dyn FnOnce() + Send>;

/// Drive `plan` to completion on the calling thread.
pub fn collect_batches(plan: &mut PlanExecutor, poll_interval: Duration) -> Result<Vec<TupleBatch>> {
    let mut batches = Vec::new();
    loop {
        match plan.next_batch()? {
            BatchPoll::Ready(batch) => {
                let terminal = batch.is_terminal();
                batches.push(batch);
                if terminal {
                    break;
                }
            }
            BatchPoll::NotReady => std::thread::sleep(poll_interval),
            BatchPoll::Done => break,
        }
    }
    Ok(batches)
}

#[derive(Debug, Clone, Copy)]
pub struct DriverOptions {
    /// Delay before polling again after `NotReady` or a full channel.
    pub poll_interval: Duration,
    /// Cancel the query with `QueryTimeout` after this long.
    pub timeout: Option<Duration>,
    /// Batches produced per work item before yielding the worker.
    pub batches_per_step: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self::from(&QuerySettings::default())
    }
}

impl From<&QuerySettings> for DriverOptions {
    fn from(settings: &QuerySettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            timeout: settings.timeout(),
            batches_per_step: 8,
        }
    }
}

pub struct PlanDriver {
    plan: PlanExecutor,
    options: DriverOptions,
    on_finish: Option<FinishFn>,
}

impl PlanDriver {
    /// `plan` must already be open.
    pub fn new(plan: PlanExecutor) -> Self {
        Self {
            plan,
            options: DriverOptions::default(),
            on_finish: None,
        }
    }

    pub fn with_options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    /// Run `f` once the driver has closed the plan, however it ended.
    pub fn on_finish<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_finish = Some(Box::new(f));
        self
    }

    pub fn spawn(mut self) -> Result<QueryHandle> {
        let Some(ctx) = self.plan.context().cloned() else {
            self.plan.close();
            return Err(StrataError::new(
                ErrorCode::PlanNotOpen,
                format!("Plan '{}' must be opened before it is driven", self.plan.name()),
            ));
        };
        let schema = self.plan.schema();
        let (sender, receiver) = mpsc::sync_channel(ctx.max_in_flight_batches());
        let finished = Arc::new(AtomicBool::new(false));

        let driver = Arc::new(Driver {
            query_id: ctx.query_id().to_string(),
            pool: ctx.pool().clone(),
            cancel: ctx.cancellation().clone(),
            options: self.options,
            finished: finished.clone(),
            state: Mutex::new(DriverState {
                plan: Some(self.plan),
                pending: None,
                sender: Some(sender),
                watchdog: None,
                on_finish: self.on_finish,
                batches: 0,
            }),
        });

        if let Some(timeout) = self.options.timeout {
            let watchdog = match driver.arm_watchdog(timeout) {
                Ok(watchdog) => watchdog,
                Err(e) => {
                    driver.abandon();
                    return Err(e);
                }
            };
            let mut state = driver.state.lock();
            if state.plan.is_some() {
                state.watchdog = Some(watchdog);
            } else {
                watchdog.cancel();
            }
        }
        driver.submit(Duration::ZERO)?;

        Ok(QueryHandle {
            query_id: ctx.query_id().to_string(),
            schema,
            receiver,
            cancel: ctx.cancellation().clone(),
            finished,
            done: false,
        })
    }
}

enum Step {
    Yield(Duration),
    Finished,
}

struct DriverState {
    plan: Option<PlanExecutor>,
    pending: Option<Result<TupleBatch>>,
    sender: Option<SyncSender<Result<TupleBatch>>>,
    watchdog: Option<ScheduledHandle>,
    on_finish: Option<FinishFn>,
    batches: u64,
}

struct Driver {
    query_id: String,
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
    options: DriverOptions,
    finished: Arc<AtomicBool>,
    state: Mutex<DriverState>,
}

impl Driver {
    fn arm_watchdog(&self, timeout: Duration) -> Result<ScheduledHandle> {
        let token = self.cancel.clone();
        let query_id = self.query_id.clone();
        let item = WorkItem::new(format!("{}-watchdog", self.query_id), move |_| {
            let timeout_ms = timeout.as_millis() as u64;
            warn!(target: "queries", query_id = %query_id, timeout_ms, "Query timed out");
            token.cancel_with(
                StrataError::new(
                    ErrorCode::QueryTimeout,
                    format!("Query '{}' exceeded its {}ms timeout", query_id, timeout_ms),
                )
                .with_context(ErrorContext::Deadline {
                    query_id: query_id.clone(),
                    timeout_ms,
                }),
            );
            Ok(())
        });
        Ok(self.pool.schedule(item, timeout)?)
    }

    /// Queue the next step. A rejected step abandons the query through its
    /// release hook.
    fn submit(self: &Arc<Self>, delay: Duration) -> std::result::Result<(), RejectedExecution> {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = ran.clone();
        let driver = self.clone();
        let abandoned = self.clone();
        let item = WorkItem::new(format!("{}-driver", self.query_id), move |_| {
            ran_flag.store(true, Ordering::Release);
            driver.step();
            Ok(())
        })
        .with_release(move || {
            if !ran.load(Ordering::Acquire) {
                abandoned.abandon();
            }
        });

        let submitted = if delay.is_zero() {
            self.pool.execute(item).map(|_| ())
        } else {
            self.pool.schedule(item, delay).map(|_| ())
        };
        if let Err(e) = &submitted {
            warn!(target: "queries", query_id = %self.query_id, error = %e, "Could not schedule query step");
        }
        submitted
    }

    fn step(self: &Arc<Self>) {
        let next = {
            let mut state = self.state.lock();
            self.advance(&mut state)
        };
        if let Step::Yield(delay) = next {
            let _ = self.submit(delay);
        }
    }

    fn advance(&self, state: &mut DriverState) -> Step {
        for _ in 0..self.options.batches_per_step.max(1) {
            if let Some(item) = state.pending.take() {
                let Some(sender) = state.sender.as_ref() else {
                    return Step::Finished;
                };
                let last = item.as_ref().map_or(true, TupleBatch::is_terminal);
                match sender.try_send(item) {
                    Ok(()) => {
                        state.batches += 1;
                        if last {
                            self.finish(state, "completed");
                            return Step::Finished;
                        }
                    }
                    Err(TrySendError::Full(item)) => {
                        state.pending = Some(item);
                        return Step::Yield(self.options.poll_interval);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        self.finish(state, "consumer dropped");
                        return Step::Finished;
                    }
                }
            }

            let Some(plan) = state.plan.as_mut() else {
                return Step::Finished;
            };
            match plan.next_batch() {
                Ok(BatchPoll::Ready(batch)) => state.pending = Some(Ok(batch)),
                Ok(BatchPoll::NotReady) => return Step::Yield(self.options.poll_interval),
                Ok(BatchPoll::Done) => {
                    self.finish(state, "completed");
                    return Step::Finished;
                }
                Err(e) => state.pending = Some(Err(e)),
            }
        }
        Step::Yield(Duration::ZERO)
    }

    fn abandon(&self) {
        let mut state = self.state.lock();
        if state.plan.is_none() && state.sender.is_none() {
            return;
        }
        let err = self.cancel.reason().unwrap_or_else(|| {
            StrataError::new(
                ErrorCode::WorkRejected,
                format!("Query '{}' could not be scheduled", self.query_id),
            )
        });
        if let Some(sender) = state.sender.as_ref() {
            let _ = sender.try_send(Err(err));
        }
        self.finish(&mut state, "abandoned");
    }

    fn finish(&self, state: &mut DriverState, reason: &str) {
        if let Some(mut plan) = state.plan.take() {
            plan.close();
        }
        state.pending = None;
        state.sender = None;
        if let Some(watchdog) = state.watchdog.take() {
            watchdog.cancel();
        }
        if let Some(on_finish) = state.on_finish.take() {
            on_finish();
        }
        self.finished.store(true, Ordering::Release);
        debug!(
            target: "queries",
            query_id = %self.query_id,
            batches = state.batches,
            reason,
            "Query driver finished"
        );
    }
}

/// Consumer side of a driven query.
///
/// Dropping the handle before the terminal batch cancels the query.
pub struct QueryHandle {
    query_id: String,
    schema: SchemaRef,
    receiver: Receiver<Result<TupleBatch>>,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    done: bool,
}

impl QueryHandle {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Block for the next batch. `Ok(None)` after the terminal batch.
    pub fn next_batch(&mut self) -> Result<Option<TupleBatch>> {
        if self.done {
            return Ok(None);
        }
        match self.receiver.recv() {
            Ok(Ok(batch)) => {
                self.done = batch.is_terminal();
                Ok(Some(batch))
            }
            Ok(Err(e)) => {
                self.done = true;
                Err(e)
            }
            Err(_) => {
                self.done = true;
                Err(self.cancel.reason().unwrap_or_else(|| {
                    StrataError::internal(format!(
                        "Query '{}' stopped before its terminal batch",
                        self.query_id
                    ))
                }))
            }
        }
    }

    /// Drain every remaining batch.
    pub fn collect(mut self) -> Result<Vec<TupleBatch>> {
        let mut batches = Vec::new();
        while let Some(batch) = self.next_batch()? {
            batches.push(batch);
        }
        Ok(batches)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the driver has closed the plan.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl Iterator for QueryHandle {
    type Item = Result<TupleBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        if !self.done {
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("query_id", &self.query_id)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferManager, BufferManagerOptions};
    use crate::exec::{ExecContext, ValuesNode};
    use crate::pool::WorkerPoolOptions;
    use crate::types::{ColumnDescriptor, DataType, RowSchema, Value};

    fn context(batch_rows: usize) -> ExecContext {
        let pool = Arc::new(WorkerPool::new(WorkerPoolOptions {
            name: "driver-test".into(),
            max_threads: 2,
        }));
        let buffers = Arc::new(BufferManager::new(BufferManagerOptions::default()));
        ExecContext::new("q-driver", pool, buffers).with_batch_rows(batch_rows)
    }

    fn values(n: i64) -> Box<ValuesNode> {
        let schema = RowSchema::new(vec![ColumnDescriptor::new("n", DataType::Int64, false)]).into_ref();
        let rows = (1..=n).map(|i| vec![Value::Int64(i)]).collect();
        Box::new(ValuesNode::new(schema, rows))
    }

    #[test]
    fn test_driver_delivers_all_batches() {
        let mut plan = PlanExecutor::new(values(25));
        plan.open(context(10)).unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let handle = PlanDriver::new(plan)
            .on_finish(move || flag.store(true, Ordering::SeqCst))
            .spawn()
            .unwrap();
        let batches = handle.collect().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].range().end, 25);
        assert!(batches[2].is_terminal());
        // finish runs after the terminal batch is sent
        std::thread::sleep(Duration::from_millis(50));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_spawn_requires_open_plan() {
        let plan = PlanExecutor::new(values(1));
        let err = PlanDriver::new(plan).spawn().unwrap_err();
        assert_eq!(err.code, ErrorCode::PlanNotOpen);
    }

    #[test]
    fn test_collect_batches_inline() {
        let mut plan = PlanExecutor::new(values(0));
        plan.open(context(4)).unwrap();
        let batches = collect_batches(&mut plan, Duration::from_millis(1)).unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());
        assert!(batches[0].is_terminal());
    }
}
