//! The batch/suspend protocol.
//!
//! A [`PlanNode`] is any operator that can produce batches. [`PlanExecutor`]
//! wraps a node and enforces the contract callers rely on:
//!
//! ```text
//! Uninitialized --open--> Open --next_batch--> Producing <--> NotReady
//!                                                 |
//!                               Terminated(Success | Error | Cancelled)
//! ```
//!
//! `BatchPoll::NotReady` is the only suspension signal: the caller yields and
//! calls `next_batch` again later. The first error terminates the plan and is
//! returned again on every later call.

use strata_error::{ErrorCode, Result, StrataError};
use tracing::debug;

use super::context::ExecContext;
use super::sequencer::BatchSequencer;
use crate::types::{SchemaRef, TupleBatch};

/// Result of asking for the next batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchPoll {
    Ready(TupleBatch),
    /// No progress possible without blocking; retry later.
    NotReady,
    /// The terminal batch was already delivered.
    Done,
}

/// An operator in a compiled plan.
///
/// Nodes are driven by one caller at a time. `poll_batch` must not block
/// waiting on other threads; it returns `NotReady` instead.
pub trait PlanNode: Send {
    fn name(&self) -> &str;

    fn schema(&self) -> SchemaRef;

    fn open(&mut self, ctx: &ExecContext) -> Result<()>;

    fn poll_batch(&mut self, ctx: &ExecContext) -> Result<BatchPoll>;

    /// Release everything acquired by `open` and `poll_batch`. Called at
    /// most once, including after failure or cancellation.
    fn close(&mut self, ctx: &ExecContext);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Uninitialized,
    Open,
    Producing,
    NotReady,
    Terminated(PlanOutcome),
}

/// Contract-enforcing wrapper around a [`PlanNode`].
pub struct PlanExecutor {
    node: Box<dyn PlanNode>,
    ctx: Option<ExecContext>,
    state: PlanState,
    sequencer: BatchSequencer,
    error: Option<StrataError>,
    closed: bool,
    // The root drains query warnings and cancels the query on early close.
    root: bool,
}

impl PlanExecutor {
    pub fn new(node: Box<dyn PlanNode>) -> Self {
        Self {
            node,
            ctx: None,
            state: PlanState::Uninitialized,
            sequencer: BatchSequencer::new(),
            error: None,
            closed: false,
            root: true,
        }
    }

    /// Executor for a child of another node; leaves warnings for the root.
    pub fn nested(node: Box<dyn PlanNode>) -> Self {
        let mut plan = Self::new(node);
        plan.root = false;
        plan
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn schema(&self) -> SchemaRef {
        self.node.schema()
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    pub fn context(&self) -> Option<&ExecContext> {
        self.ctx.as_ref()
    }

    /// Rows delivered so far.
    pub fn rows_produced(&self) -> u64 {
        self.sequencer.rows()
    }

    pub fn open(&mut self, ctx: ExecContext) -> Result<()> {
        if self.state != PlanState::Uninitialized {
            return Err(StrataError::new(
                ErrorCode::PlanAlreadyOpen,
                format!("Plan '{}' is already open", self.node.name()),
            ));
        }
        self.ctx = Some(ctx.clone());
        let opened = ctx
            .check_cancelled()
            .and_then(|_| self.node.open(&ctx));
        match opened {
            Ok(()) => {
                self.state = PlanState::Open;
                debug!(
                    target: "queries",
                    query_id = %ctx.query_id(),
                    node = %self.node.name(),
                    "Opened plan"
                );
                Ok(())
            }
            Err(e) => Err(self.terminate(e)),
        }
    }

    pub fn next_batch(&mut self) -> Result<BatchPoll> {
        match self.state {
            PlanState::Uninitialized => {
                return Err(StrataError::new(
                    ErrorCode::PlanNotOpen,
                    format!("Plan '{}' was not opened", self.node.name()),
                ))
            }
            PlanState::Terminated(PlanOutcome::Success) => return Ok(BatchPoll::Done),
            PlanState::Terminated(_) => {
                return Err(self
                    .error
                    .clone()
                    .unwrap_or_else(|| StrataError::internal("Plan terminated without error")))
            }
            _ => {}
        }
        let Some(ctx) = self.ctx.clone() else {
            return Err(StrataError::internal("Open plan has no context"));
        };

        if let Err(e) = ctx.check_cancelled() {
            return Err(self.terminate(e));
        }
        let polled = self.node.poll_batch(&ctx);
        match polled {
            Ok(BatchPoll::Ready(batch)) => {
                if let Err(e) = self.sequencer.accept(&batch) {
                    return Err(self.terminate(e));
                }
                let batch = if self.root && !ctx.warnings().is_empty() {
                    batch.with_warnings(ctx.warnings().take_all())
                } else {
                    batch
                };
                self.state = if batch.is_terminal() {
                    PlanState::Terminated(PlanOutcome::Success)
                } else {
                    PlanState::Producing
                };
                Ok(BatchPoll::Ready(batch))
            }
            Ok(BatchPoll::NotReady) => {
                self.state = PlanState::NotReady;
                Ok(BatchPoll::NotReady)
            }
            Ok(BatchPoll::Done) => {
                if self.sequencer.terminal_seen() {
                    self.state = PlanState::Terminated(PlanOutcome::Success);
                    Ok(BatchPoll::Done)
                } else {
                    Err(self.terminate(StrataError::new(
                        ErrorCode::PlanContractViolation,
                        format!(
                            "Plan '{}' finished without a terminal batch",
                            self.node.name()
                        ),
                    )))
                }
            }
            Err(e) => Err(self.terminate(e)),
        }
    }

    /// Trip the plan's cancellation token. The next `next_batch` fails.
    pub fn cancel(&self) {
        if let Some(ctx) = &self.ctx {
            ctx.cancellation().cancel();
        }
    }

    /// Run the node's close exactly once. Later calls are no-ops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Some(ctx) = self.ctx.as_ref() else {
            return;
        };
        if !matches!(self.state, PlanState::Terminated(_)) {
            let reason = StrataError::cancelled("Plan closed before completion");
            if self.root {
                ctx.cancellation().cancel_with(reason.clone());
            }
            self.state = PlanState::Terminated(PlanOutcome::Cancelled);
            self.error = Some(ctx.cancellation().reason().unwrap_or(reason));
        }
        self.node.close(ctx);
        debug!(
            target: "queries",
            query_id = %ctx.query_id(),
            node = %self.node.name(),
            rows = self.sequencer.rows(),
            "Closed plan"
        );
    }

    fn terminate(&mut self, err: StrataError) -> StrataError {
        let outcome = if err.is_cancellation() {
            PlanOutcome::Cancelled
        } else {
            PlanOutcome::Error
        };
        self.state = PlanState::Terminated(outcome);
        self.error = Some(err.clone());
        err
    }
}

impl Drop for PlanExecutor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("node", &self.node.name())
            .field("state", &self.state)
            .finish()
    }
}
